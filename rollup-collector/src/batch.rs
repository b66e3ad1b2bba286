use serde::{Deserialize, Serialize};

use crate::protocol::{CounterValue, MeasureValue, Tags};

/// Running statistics of measured values.
///
/// Invariant: once created, `count >= 1` and `min <= value <= max` for every observed value.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Summary {
    /// The number of observed values.
    pub count: u64,
    /// The sum of all observed values.
    pub sum: MeasureValue,
    /// The smallest observed value.
    pub min: MeasureValue,
    /// The largest observed value.
    pub max: MeasureValue,
}

impl Summary {
    /// Creates a summary from a single value.
    pub fn single(value: MeasureValue) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    /// Inserts a new value into the summary.
    pub fn insert(&mut self, value: MeasureValue) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Returns the mean of all observed values.
    pub fn mean(&self) -> MeasureValue {
        self.sum / self.count as f64
    }
}

/// A flushed counter.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CounterEntry {
    /// The full name including prefixes.
    pub name: String,
    /// Tags of the counter.
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    /// The accumulated value.
    pub value: CounterValue,
}

/// A flushed summary of measurements, or a derived percentile pseudo-metric.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AggregateEntry {
    /// The full name including prefixes.
    pub name: String,
    /// Tags of the aggregate.
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    /// The aggregated statistics.
    #[serde(flatten)]
    pub summary: Summary,
}

/// The payload handed to a [`Sink`](crate::Sink) on flush.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Batch {
    /// Flushed counters.
    pub counters: Vec<CounterEntry>,
    /// Flushed aggregates including percentile pseudo-metrics.
    pub aggregates: Vec<AggregateEntry>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the batch contains no entries.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.aggregates.is_empty()
    }

    /// Returns the total number of entries.
    pub fn len(&self) -> usize {
        self.counters.len() + self.aggregates.len()
    }

    /// Looks up a counter by full name and tags.
    pub fn counter(&self, name: &str, tags: &Tags) -> Option<&CounterEntry> {
        self.counters
            .iter()
            .find(|entry| entry.name == name && &entry.tags == tags)
    }

    /// Looks up an aggregate by full name and tags.
    pub fn aggregate(&self, name: &str, tags: &Tags) -> Option<&AggregateEntry> {
        self.aggregates
            .iter()
            .find(|entry| entry.name == name && &entry.tags == tags)
    }
}

/// Options controlling a flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOptions {
    /// Keep the flushed state in the store instead of resetting it.
    pub preserve: bool,
}

impl FlushOptions {
    /// Flush and keep the current state.
    pub fn preserve() -> Self {
        Self { preserve: true }
    }
}
