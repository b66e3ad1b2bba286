use crate::aggregator::Measure;
use crate::collector::Collector;
use crate::counters::Increment;
use crate::percentile::InvalidPercentile;
use crate::protocol::MeasureValue;

/// A view of a [`Collector`] that prefixes all metric names.
///
/// Created by [`Collector::group`]. Groups nest by joining their prefixes with a period:
///
/// ```
/// use rollup_collector::{Collector, FlushOptions};
///
/// let collector = Collector::new();
/// collector.group("db", |db| {
///     db.group("pool", |pool| pool.increment("checkout"));
/// });
///
/// let batch = collector.flush_batch(FlushOptions::default());
/// assert_eq!(batch.counters[0].name, "db.pool.checkout");
/// ```
#[derive(Debug)]
pub struct Group<'a> {
    collector: &'a Collector,
    prefix: String,
}

impl<'a> Group<'a> {
    pub(crate) fn new(collector: &'a Collector, prefix: &str) -> Self {
        Self {
            collector,
            prefix: format!("{prefix}."),
        }
    }

    fn name(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    /// Runs `f` with a nested group.
    pub fn group<F, R>(&self, prefix: &str, f: F) -> R
    where
        F: FnOnce(&Group<'a>) -> R,
    {
        f(&Group::new(self.collector, &self.name(prefix)))
    }

    /// See [`Collector::increment`].
    pub fn increment(&self, name: &str) {
        self.collector.increment(&self.name(name));
    }

    /// See [`Collector::increment_by`].
    pub fn increment_by(&self, name: &str, amount: i64) {
        self.collector.increment_by(&self.name(name), amount);
    }

    /// See [`Collector::increment_with`].
    pub fn increment_with(&self, name: &str, increment: Increment) {
        self.collector.increment_with(&self.name(name), increment);
    }

    /// See [`Collector::measure`].
    pub fn measure(&self, name: &str, value: MeasureValue) {
        self.collector.measure(&self.name(name), value);
    }

    /// See [`Collector::measure_with`].
    pub fn measure_with(
        &self,
        name: &str,
        value: MeasureValue,
        options: Measure,
    ) -> Result<(), InvalidPercentile> {
        self.collector.measure_with(&self.name(name), value, options)
    }

    /// See [`Collector::timing`].
    pub fn timing(&self, name: &str, millis: MeasureValue) {
        self.collector.timing(&self.name(name), millis);
    }

    /// See [`Collector::time`].
    pub fn time<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.collector.time(&self.name(name), f)
    }
}
