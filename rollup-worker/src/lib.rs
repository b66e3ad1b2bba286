//! Periodic execution of a callback with drift compensation.
//!
//! A [`Worker`] invokes a callback on a fixed [`Schedule`]. When a run takes longer than the
//! period, the worker skips the missed slots instead of catching up with back-to-back runs. The
//! waiting happens in one of three contexts, selected by [`WorkerMode`]:
//!
//!  - a dedicated thread blocking on a condition variable,
//!  - a tokio task re-arming a timer, handing each run to the blocking pool,
//!  - a tokio task sleeping cooperatively and running the callback inline.
//!
//! All modes share the same cadence and stop semantics. Calling [`WorkerHandle::stop`] prevents
//! any further run, but does not interrupt a run in progress.

#![warn(missing_docs)]

mod schedule;
mod worker;

pub use self::schedule::*;
pub use self::worker::*;
