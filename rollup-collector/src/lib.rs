//! In-memory aggregation of process metrics.
//!
//! Producers record metrics on a shared [`Collector`] from any number of threads. Periodically, the
//! collector is flushed: the state of its stores is detached into a [`Batch`] under a short
//! critical section, and the stores start accumulating the next interval. The batch is then passed
//! through a [`ValidatingQueue`] to a [`Sink`] without holding any lock.
//!
//! # Counters
//!
//! The [`CounterCache`] accumulates values per metric name and tag set. Counters are reset to zero
//! on flush, unless they are marked [sporadic](Increment::sporadic), in which case they are removed
//! and only reported again once incremented.
//!
//! # Measurements
//!
//! The [`Aggregator`] keeps count, sum, minimum and maximum of measured values. Requested
//! percentiles are estimated from a [`Reservoir`] of up to 1000 samples per metric and reported as
//! additional aggregates named `<name>.p<percentile>`, for instance `request.time.p95`.
//!
//! # Validation
//!
//! Metric names and tags are checked at the submission boundary. Invalid entries are logged and
//! dropped from the batch, the remaining entries are submitted.
//!
//! ```
//! use rollup_collector::{Collector, FlushOptions, Measure};
//!
//! let collector = Collector::new();
//! collector.increment("requests");
//! collector
//!     .measure_with("request.time", 12.0, Measure::new().percentile(95.0))
//!     .unwrap();
//!
//! let batch = collector.flush_batch(FlushOptions::default());
//! assert_eq!(batch.counters.len(), 1);
//! assert_eq!(batch.aggregates.len(), 3);
//! ```

#![warn(missing_docs)]

mod aggregator;
mod batch;
mod collector;
mod counters;
mod group;
mod percentile;
mod protocol;
mod queue;
mod reservoir;

pub use aggregator::*;
pub use batch::*;
pub use collector::*;
pub use counters::*;
pub use group::*;
pub use percentile::*;
pub use protocol::*;
pub use queue::*;
pub use reservoir::*;
