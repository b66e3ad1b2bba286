//! Helpers for testing the collector and the flush pipeline.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test that logs, call [`setup`]. This will set up the logger so that all console
//!    output is captured by the test runner. All logs emitted with [`rollup_log`] will show up for
//!    test failures or when run with `--nocapture`.
//!  - Use [`CapturingSink`] in place of a submission client to inspect flushed batches.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     rollup_test::setup();
//!
//!     rollup_log::debug!("hello, world!");
//! }
//! ```

#![warn(missing_docs)]

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rollup_collector::{Batch, Sink, SinkError};

/// Setup the test environment.
///
///  - Initializes logs: The logger captures logs from all rollup crates and mutes all other logs.
pub fn setup() {
    rollup_log::init_test!();
}

/// The scripted result of a single submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Accept the batch.
    Accept,
    /// Fail with a retryable error.
    Retry,
    /// Fail with a permanent error.
    Reject,
}

#[derive(Debug, Default)]
struct Inner {
    accepted: Vec<Batch>,
    attempts: usize,
    script: VecDeque<Outcome>,
}

/// A [`Sink`] that records accepted batches.
///
/// By default, every batch is accepted. Failures can be scripted with [`fail_next`](Self::fail_next).
/// Clones share their state, so one clone can be handed to the code under test and another kept
/// for assertions.
#[derive(Clone, Debug, Default)]
pub struct CapturingSink {
    inner: Arc<Mutex<Inner>>,
}

impl CapturingSink {
    /// Creates a sink that accepts every batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for the next submissions. Afterwards, batches are accepted again.
    pub fn fail_next(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.inner.lock().script.extend(outcomes);
    }

    /// Returns all accepted batches.
    pub fn batches(&self) -> Vec<Batch> {
        self.inner.lock().accepted.clone()
    }

    /// Removes and returns all accepted batches.
    pub fn take(&self) -> Vec<Batch> {
        std::mem::take(&mut self.inner.lock().accepted)
    }

    /// Returns the number of submission attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }
}

impl Sink for CapturingSink {
    fn submit(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut inner = self.inner.lock();
        inner.attempts += 1;

        match inner.script.pop_front().unwrap_or(Outcome::Accept) {
            Outcome::Accept => {
                inner.accepted.push(batch.clone());
                Ok(())
            }
            Outcome::Retry => Err(SinkError::retryable(io::Error::new(
                io::ErrorKind::TimedOut,
                "submission timed out",
            ))),
            Outcome::Reject => Err(SinkError::permanent(io::Error::new(
                io::ErrorKind::InvalidData,
                "batch rejected",
            ))),
        }
    }
}
