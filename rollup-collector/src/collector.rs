use parking_lot::RwLock;

use crate::aggregator::{Aggregator, Measure};
use crate::batch::{AggregateEntry, Batch, FlushOptions, Summary};
use crate::counters::{CounterCache, Increment};
use crate::group::Group;
use crate::percentile::InvalidPercentile;
use crate::protocol::{self, CounterValue, MeasureValue, SOURCE_TAG, Tags};
use crate::queue::{Sink, SinkError, Submitted, ValidatingQueue};

/// Name of the aggregate added to every flushed batch.
///
/// Each process reports a value of `1`, so the sum across processes counts live reporters.
pub const BOOKKEEPING_METRIC: &str = "rollup.processes";

/// The metric store of a process.
///
/// Combines a [`CounterCache`] and an [`Aggregator`] and flushes both into a single [`Batch`].
/// All methods take `&self` and can be called concurrently from any number of threads.
///
/// ```
/// use rollup_collector::{Collector, FlushOptions, Increment};
///
/// let collector = Collector::new().with_prefix("app");
/// collector.increment_with("jobs.failed", Increment::new().tag("queue", "mail"));
/// collector.measure("jobs.duration", 12.0);
///
/// let batch = collector.flush_batch(FlushOptions::default());
/// assert_eq!(batch.counters[0].name, "app.jobs.failed");
/// ```
#[derive(Debug, Default)]
pub struct Collector {
    counters: CounterCache,
    aggregate: Aggregator,
    prefix: RwLock<Option<String>>,
    source_prefix: Option<String>,
}

impl Collector {
    /// Creates an empty collector without prefix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prefix of all flushed metric names.
    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        self.set_prefix(Some(prefix.into()));
        self
    }

    /// Sets a prefix prepended to every `source` tag.
    pub fn with_source_prefix(mut self, source_prefix: impl Into<String>) -> Self {
        self.source_prefix = Some(source_prefix.into()).filter(|prefix| !prefix.is_empty());
        self
    }

    /// Returns the counter store.
    pub fn counters(&self) -> &CounterCache {
        &self.counters
    }

    /// Returns the measurement store.
    pub fn aggregate(&self) -> &Aggregator {
        &self.aggregate
    }

    /// Increments a counter by one.
    pub fn increment(&self, name: &str) {
        self.increment_with(name, Increment::new());
    }

    /// Increments a counter by an integral amount.
    pub fn increment_by(&self, name: &str, amount: i64) {
        self.increment_with(name, Increment::by(amount as CounterValue));
    }

    /// Applies an increment with options.
    pub fn increment_with(&self, name: &str, mut increment: Increment) {
        self.prefix_source(increment.tags_mut());
        self.counters.increment_with(name, increment);
    }

    /// Records a value.
    pub fn measure(&self, name: &str, value: MeasureValue) {
        self.aggregate.measure(name, value);
    }

    /// Records a value with tags and percentiles.
    pub fn measure_with(
        &self,
        name: &str,
        value: MeasureValue,
        mut options: Measure,
    ) -> Result<(), InvalidPercentile> {
        self.prefix_source(options.tags_mut());
        self.aggregate.measure_with(name, value, options)
    }

    /// Records a timing in milliseconds.
    pub fn timing(&self, name: &str, millis: MeasureValue) {
        self.aggregate.timing(name, millis);
    }

    /// Runs `f` and records its duration in milliseconds.
    pub fn time<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.aggregate.time(name, f)
    }

    /// Runs `f` and records its duration with options.
    pub fn time_with<F, R>(&self, name: &str, mut options: Measure, f: F) -> Result<R, InvalidPercentile>
    where
        F: FnOnce() -> R,
    {
        self.prefix_source(options.tags_mut());
        self.aggregate.time_with(name, options, f)
    }

    /// Requests a percentile for a metric.
    pub fn track_percentile(
        &self,
        name: &str,
        tags: &Tags,
        percentile: f64,
    ) -> Result<(), InvalidPercentile> {
        self.aggregate.track_percentile(name, tags, percentile)
    }

    /// Runs `f` with a view that prefixes all metric names with `"<prefix>."`.
    pub fn group<F, R>(&self, prefix: &str, f: F) -> R
    where
        F: FnOnce(&Group<'_>) -> R,
    {
        f(&Group::new(self, prefix))
    }

    /// Removes all counters and measurements.
    pub fn delete_all(&self) {
        self.counters.delete_all();
        self.aggregate.delete_all();
    }

    /// Returns the current prefix.
    pub fn prefix(&self) -> Option<String> {
        self.prefix.read().clone()
    }

    /// Replaces the prefix.
    ///
    /// Metrics are stored without prefix, so existing entries remain queryable by their original
    /// name and are reported with the new prefix at the next flush. A concurrent flush reports all
    /// entries with either the old or the new prefix.
    pub fn set_prefix(&self, prefix: Option<String>) {
        let prefix = prefix.filter(|prefix| !prefix.is_empty());

        // Held across both stores. Flushes hold the read lock for their whole duration.
        let mut current = self.prefix.write();
        self.counters.set_prefix(prefix.clone());
        self.aggregate.set_prefix(prefix.clone());
        *current = prefix;
    }

    /// Returns the source prefix.
    pub fn source_prefix(&self) -> Option<&str> {
        self.source_prefix.as_deref()
    }

    /// Detaches the state of both stores into a new batch.
    ///
    /// The batch always contains the [`BOOKKEEPING_METRIC`] aggregate.
    pub fn flush_batch(&self, options: FlushOptions) -> Batch {
        let prefix = self.prefix.read();

        let mut batch = Batch::new();
        let counters = self.counters.flush_to(&mut batch, options);
        let aggregates = self.aggregate.flush_to(&mut batch, options);

        batch.aggregates.push(AggregateEntry {
            name: protocol::qualify(prefix.as_deref(), BOOKKEEPING_METRIC),
            tags: Tags::new(),
            summary: Summary::single(1.0),
        });
        drop(prefix);

        rollup_log::trace!(counters, aggregates, "flushed collector");
        batch
    }

    /// Flushes both stores and submits the batch through `queue`.
    pub fn flush<S: Sink>(
        &self,
        queue: &ValidatingQueue<S>,
        options: FlushOptions,
    ) -> Result<Submitted, SinkError> {
        queue.submit(self.flush_batch(options))
    }

    fn prefix_source(&self, tags: &mut Tags) {
        if let Some(ref source_prefix) = self.source_prefix {
            if let Some(source) = tags.get_mut(SOURCE_TAG) {
                *source = format!("{source_prefix}.{source}");
            }
        }
    }
}
