//! In-process metrics aggregation with periodic submission.
//!
//! A [`Tracker`] owns a [`Collector`] that producers record counters and measurements on, and a
//! background worker that periodically flushes the collector through a [`Flusher`] to a [`Sink`].
//!
//! ```no_run
//! use rollup::Tracker;
//! use rollup_config::{Config, OverridableConfig};
//! # use rollup_collector::{Batch, Sink, SinkError};
//! # struct Client;
//! # impl Sink for Client {
//! #     fn submit(&self, _batch: &Batch) -> Result<(), SinkError> { Ok(()) }
//! # }
//!
//! let mut config = Config::from_path("config")?;
//! config.apply_override(OverridableConfig::from_env())?;
//! rollup::init_logging(&config);
//!
//! let tracker = Tracker::new(config, Client);
//! tracker.autostart()?;
//!
//! tracker.increment("worker.started");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]

mod flusher;
mod tracker;

pub use self::flusher::*;
pub use self::tracker::*;

#[doc(no_inline)]
pub use rollup_collector::{Collector, Sink, SinkError};

use once_cell::sync::Lazy;
use rollup_config::{Config, OverridableConfig};

/// Initializes logging with the configured level and format.
pub fn init_logging(config: &Config) {
    rollup_log::init(config.logging());
}

static DEFAULT_COLLECTOR: Lazy<Collector> = Lazy::new(|| {
    let mut config = Config::default();
    if let Err(error) = config.apply_override(OverridableConfig::from_env()) {
        rollup_log::warn!(
            "ignoring invalid environment configuration: {}",
            rollup_log::LogError(&error)
        );
    }

    let mut collector = Collector::new();
    if let Some(prefix) = config.prefix() {
        collector = collector.with_prefix(prefix);
    }
    if let Some(source_prefix) = config.source_prefix() {
        collector = collector.with_source_prefix(source_prefix);
    }
    collector
});

/// Returns the process-wide default collector.
///
/// The collector is created on first use with the prefixes from the `ROLLUP_PREFIX` and
/// `ROLLUP_SOURCE_PREFIX` environment variables. Prefer passing an explicit [`Collector`] or
/// [`Tracker`]; this is meant for code that cannot reach one.
pub fn default_collector() -> &'static Collector {
    &DEFAULT_COLLECTOR
}
