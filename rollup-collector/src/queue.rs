use std::error::Error;
use std::sync::Arc;

use crate::batch::{AggregateEntry, Batch, CounterEntry};
use crate::protocol::{self, Tags};

/// A boxed error that can cross threads.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error returned by a [`Sink`].
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The submission failed temporarily and the same batch may be submitted again.
    #[error("retryable submission failure")]
    Retryable(#[source] BoxError),
    /// The batch was rejected and must not be submitted again.
    #[error("permanent submission failure")]
    Permanent(#[source] BoxError),
}

impl SinkError {
    /// Creates a retryable error.
    pub fn retryable(error: impl Into<BoxError>) -> Self {
        Self::Retryable(error.into())
    }

    /// Creates a permanent error.
    pub fn permanent(error: impl Into<BoxError>) -> Self {
        Self::Permanent(error.into())
    }

    /// Returns `true` if the batch may be submitted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Receiver of flushed batches, such as a network submission client.
///
/// A sink is only invoked with non-empty, validated batches.
pub trait Sink: Send + Sync {
    /// Submits a batch.
    fn submit(&self, batch: &Batch) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for &S {
    fn submit(&self, batch: &Batch) -> Result<(), SinkError> {
        (**self).submit(batch)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn submit(&self, batch: &Batch) -> Result<(), SinkError> {
        (**self).submit(batch)
    }
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn submit(&self, batch: &Batch) -> Result<(), SinkError> {
        (**self).submit(batch)
    }
}

/// The reason an entry was removed from a batch.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DropReason {
    /// The metric name violates the naming grammar.
    #[error("invalid metric name")]
    InvalidName,
    /// A tag key violates the tag key grammar.
    #[error("invalid tag key {0:?}")]
    InvalidTagKey(String),
    /// A tag value violates the tag value grammar.
    #[error("invalid value for tag {0:?}")]
    InvalidTagValue(String),
}

/// An entry removed from a batch during validation.
#[derive(Clone, Debug, PartialEq)]
pub struct Dropped {
    /// The name of the dropped entry.
    pub name: String,
    /// The tags of the dropped entry.
    pub tags: Tags,
    /// Why the entry was dropped.
    pub reason: DropReason,
}

/// The outcome of validating a single entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict<T> {
    /// The entry is valid.
    Kept(T),
    /// The entry is invalid and must not be submitted.
    Dropped(Dropped),
}

/// Common accessors of batch entries.
pub trait Entry {
    /// The full metric name.
    fn name(&self) -> &str;
    /// The tags of the entry.
    fn tags(&self) -> &Tags;
}

impl Entry for CounterEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }
}

impl Entry for AggregateEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }
}

/// Checks an entry against the naming grammar.
pub fn validate_entry<T: Entry>(entry: T) -> Verdict<T> {
    let reason = if !protocol::is_valid_name(entry.name()) {
        Some(DropReason::InvalidName)
    } else {
        entry.tags().iter().find_map(|(key, value)| {
            if !protocol::is_valid_tag_key(key) {
                Some(DropReason::InvalidTagKey(key.clone()))
            } else if !protocol::is_valid_tag_value(value) {
                Some(DropReason::InvalidTagValue(key.clone()))
            } else {
                None
            }
        })
    };

    match reason {
        None => Verdict::Kept(entry),
        Some(reason) => Verdict::Dropped(Dropped {
            name: entry.name().to_owned(),
            tags: entry.tags().clone(),
            reason,
        }),
    }
}

fn partition<T: Entry>(entries: Vec<T>, dropped: &mut Vec<Dropped>) -> Vec<T> {
    entries
        .into_iter()
        .fold(Vec::new(), |mut kept, entry| {
            match validate_entry(entry) {
                Verdict::Kept(entry) => kept.push(entry),
                Verdict::Dropped(entry) => dropped.push(entry),
            }
            kept
        })
}

/// A batch after validation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Validated {
    /// All valid entries.
    pub batch: Batch,
    /// All removed entries.
    pub dropped: Vec<Dropped>,
}

/// Summary of a successful submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Submitted {
    /// Number of entries handed to the sink.
    pub sent: usize,
    /// Number of entries removed by validation.
    pub dropped: usize,
}

/// Filters invalid entries from batches before handing them to a [`Sink`].
///
/// Invalid entries are logged and removed. They never cause the remaining batch to fail.
#[derive(Debug)]
pub struct ValidatingQueue<S> {
    sink: S,
}

impl<S: Sink> ValidatingQueue<S> {
    /// Creates a queue submitting to `sink`.
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Returns the wrapped sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Removes all invalid entries from the batch and logs each of them.
    pub fn validate(&self, batch: Batch) -> Validated {
        let mut dropped = Vec::new();
        let batch = Batch {
            counters: partition(batch.counters, &mut dropped),
            aggregates: partition(batch.aggregates, &mut dropped),
        };

        for entry in &dropped {
            rollup_log::warn!(
                name = %entry.name,
                tags = ?entry.tags,
                "dropping invalid metric: {}",
                entry.reason
            );
        }

        Validated { batch, dropped }
    }

    /// Validates a batch and submits the valid remainder.
    ///
    /// The sink is not invoked if no valid entries remain.
    pub fn submit(&self, batch: Batch) -> Result<Submitted, SinkError> {
        let Validated { batch, dropped } = self.validate(batch);
        self.send(&batch)?;

        Ok(Submitted {
            sent: batch.len(),
            dropped: dropped.len(),
        })
    }

    /// Submits an already validated batch.
    pub fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            rollup_log::trace!("skipping submission of empty batch");
            return Ok(());
        }

        rollup_log::debug!(entries = batch.len(), "submitting batch");
        self.sink.submit(batch)
    }
}
