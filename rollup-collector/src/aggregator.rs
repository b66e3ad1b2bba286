use std::collections::BTreeSet;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::batch::{AggregateEntry, Batch, FlushOptions, Summary};
use crate::percentile::{InvalidPercentile, Percentile};
use crate::protocol::{self, MeasureValue, MetricKey, SOURCE_TAG, Tags};
use crate::reservoir::Reservoir;

/// Options of a single measurement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Measure {
    tags: Tags,
    percentiles: Vec<f64>,
}

impl Measure {
    /// A measurement without tags or percentiles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    /// Adds all given tags.
    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Sets the legacy `source` dimension.
    pub fn source(self, source: impl ToString) -> Self {
        self.tag(SOURCE_TAG, source)
    }

    /// Requests a percentile to be reported for this metric.
    ///
    /// The percentile is validated when the measurement is recorded.
    pub fn percentile(mut self, percentile: f64) -> Self {
        self.percentiles.push(percentile);
        self
    }

    /// Requests all given percentiles.
    pub fn percentiles(mut self, percentiles: impl IntoIterator<Item = f64>) -> Self {
        self.percentiles.extend(percentiles);
        self
    }

    pub(crate) fn tags_mut(&mut self) -> &mut Tags {
        &mut self.tags
    }
}

#[derive(Debug)]
struct PercentileStore {
    reservoir: Reservoir,
    requested: BTreeSet<Percentile>,
}

impl PercentileStore {
    fn new() -> Self {
        Self {
            reservoir: Reservoir::new(),
            requested: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
struct AggregateState {
    entries: HashMap<MetricKey, Summary>,
    percentiles: HashMap<MetricKey, PercentileStore>,
}

impl AggregateState {
    fn record(&mut self, key: MetricKey, value: MeasureValue, percentiles: &[Percentile]) {
        if !percentiles.is_empty() {
            let store = self
                .percentiles
                .entry(key.clone())
                .or_insert_with(PercentileStore::new);
            store.reservoir.push(value);
            store.requested.extend(percentiles.iter().copied());
        }

        self.entries
            .entry(key)
            .and_modify(|summary| summary.insert(value))
            .or_insert_with(|| Summary::single(value));
    }
}

/// Returns `true` if the value can be aggregated. Non-finite values are logged and skipped.
fn is_measurable(name: &str, value: MeasureValue) -> bool {
    if value.is_finite() {
        return true;
    }

    rollup_log::warn!(metric = name, value, "ignoring non-finite measurement");
    false
}

fn validate(percentiles: &[f64]) -> Result<Vec<Percentile>, InvalidPercentile> {
    percentiles.iter().copied().map(Percentile::new).collect()
}

fn elapsed_millis(start: Instant) -> MeasureValue {
    (start.elapsed().as_secs_f64() * 1000.0).round()
}

/// Thread-safe store of measurement summaries and percentile reservoirs.
#[derive(Debug, Default)]
pub struct Aggregator {
    state: Mutex<AggregateState>,
    prefix: RwLock<Option<String>>,
}

impl Aggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a value without tags. Non-finite values are ignored.
    pub fn measure(&self, name: &str, value: MeasureValue) {
        if !is_measurable(name, value) {
            return;
        }

        let key = MetricKey::new(name);
        self.state.lock().record(key, value, &[]);
    }

    /// Records a value with tags and requested percentiles.
    ///
    /// All percentiles are validated before anything is recorded. On error, the aggregator is
    /// left unchanged. Non-finite values are ignored.
    pub fn measure_with(
        &self,
        name: &str,
        value: MeasureValue,
        options: Measure,
    ) -> Result<(), InvalidPercentile> {
        let percentiles = validate(&options.percentiles)?;
        if !is_measurable(name, value) {
            return Ok(());
        }

        let key = MetricKey::with_tags(name, options.tags);
        self.state.lock().record(key, value, &percentiles);
        Ok(())
    }

    /// Records a timing in milliseconds. Alias of [`measure`](Self::measure).
    pub fn timing(&self, name: &str, millis: MeasureValue) {
        self.measure(name, millis);
    }

    /// Runs `f` and records its wall-clock duration in whole milliseconds.
    pub fn time<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.measure(name, elapsed_millis(start));
        result
    }

    /// Runs `f` and records its duration with the given options.
    ///
    /// Percentiles are validated before `f` runs, so `f` is not invoked on error.
    pub fn time_with<F, R>(&self, name: &str, options: Measure, f: F) -> Result<R, InvalidPercentile>
    where
        F: FnOnce() -> R,
    {
        let percentiles = validate(&options.percentiles)?;
        let key = MetricKey::with_tags(name, options.tags);

        let start = Instant::now();
        let result = f();
        let elapsed = elapsed_millis(start);

        self.state.lock().record(key, elapsed, &percentiles);
        Ok(result)
    }

    /// Requests a percentile for an existing or future metric.
    ///
    /// Fails without changing any state if the percentile is out of range.
    pub fn track_percentile(
        &self,
        name: &str,
        tags: &Tags,
        percentile: f64,
    ) -> Result<(), InvalidPercentile> {
        let percentile = Percentile::new(percentile)?;
        let key = MetricKey::with_tags(name, tags.clone());

        self.state
            .lock()
            .percentiles
            .entry(key)
            .or_insert_with(PercentileStore::new)
            .requested
            .insert(percentile);

        Ok(())
    }

    /// Returns the summary of a metric.
    pub fn fetch(&self, name: &str, tags: &Tags) -> Option<Summary> {
        let key = MetricKey::with_tags(name, tags.clone());
        self.state.lock().entries.get(&key).copied()
    }

    /// Returns the estimated percentile of a metric.
    ///
    /// Returns `None` if the percentile is invalid, no reservoir exists for the metric, or the
    /// reservoir is empty.
    pub fn fetch_percentile(&self, name: &str, tags: &Tags, percentile: f64) -> Option<f64> {
        let percentile = Percentile::new(percentile).ok()?;
        let key = MetricKey::with_tags(name, tags.clone());

        let state = self.state.lock();
        state.percentiles.get(&key)?.reservoir.percentile(percentile)
    }

    /// Detaches all summaries and derived percentiles into `batch`.
    ///
    /// Every requested percentile of a metric is reported as a separate aggregate named
    /// `<name>.p<percentile>`. Returns the number of flushed entries.
    pub fn flush_to(&self, batch: &mut Batch, options: FlushOptions) -> usize {
        let (entries, percentiles) = {
            let mut state = self.state.lock();

            let mut percentiles = Vec::new();
            for (key, store) in &state.percentiles {
                for percentile in &store.requested {
                    if let Some(value) = store.reservoir.percentile(*percentile) {
                        let name = format!("{}.{}", key.name, percentile.suffix());
                        percentiles.push((MetricKey::with_tags(name, key.tags.clone()), value));
                    }
                }
            }

            let entries: Vec<(MetricKey, Summary)> = if options.preserve {
                state
                    .entries
                    .iter()
                    .map(|(key, summary)| (key.clone(), *summary))
                    .collect()
            } else {
                state.percentiles.clear();
                state.entries.drain().collect()
            };

            (entries, percentiles)
        };

        let prefix = self.prefix.read().clone();
        let flushed = entries.len() + percentiles.len();

        let summaries = entries.into_iter();
        let derived = percentiles
            .into_iter()
            .map(|(key, value)| (key, Summary::single(value)));

        batch
            .aggregates
            .extend(summaries.chain(derived).map(|(key, summary)| AggregateEntry {
                name: protocol::qualify(prefix.as_deref(), &key.name),
                tags: key.tags,
                summary,
            }));

        flushed
    }

    /// Removes all summaries and reservoirs.
    pub fn delete_all(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.percentiles.clear();
    }

    /// Sets the prefix applied to metric names at flush.
    pub fn set_prefix(&self, prefix: Option<String>) {
        *self.prefix.write() = prefix;
    }

    /// Returns the number of tracked summaries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if no summaries are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn no_tags() -> Tags {
        Tags::new()
    }

    #[test]
    fn test_measure_summary() {
        let aggregator = Aggregator::new();
        for value in [3.0, 1.5, 7.25, 4.0] {
            aggregator.measure("latency", value);
        }

        similar_asserts::assert_eq!(
            aggregator.fetch("latency", &no_tags()),
            Some(Summary {
                count: 4,
                sum: 15.75,
                min: 1.5,
                max: 7.25,
            })
        );
    }

    #[test]
    fn test_measure_tags() {
        let aggregator = Aggregator::new();
        aggregator
            .measure_with("db.query", 10.0, Measure::new().tag("table", "users"))
            .unwrap();
        aggregator.measure("db.query", 20.0);

        let users = Tags::from([("table".to_owned(), "users".to_owned())]);
        assert_eq!(aggregator.fetch("db.query", &users).map(|s| s.sum), Some(10.0));
        assert_eq!(aggregator.fetch("db.query", &no_tags()).map(|s| s.sum), Some(20.0));
    }

    #[test]
    fn test_fetch_percentile() {
        let aggregator = Aggregator::new();
        for value in [1.0, 2.0, 3.0] {
            aggregator
                .measure_with("a.timing", value, Measure::new().percentile(95.0))
                .unwrap();
        }

        assert_eq!(aggregator.fetch_percentile("a.timing", &no_tags(), 95.0), Some(3.0));
        assert_eq!(aggregator.fetch_percentile("a.timing", &no_tags(), 50.0), Some(2.0));
        assert_eq!(aggregator.fetch_percentile("b.timing", &no_tags(), 50.0), None);
    }

    #[test]
    fn test_invalid_percentile_changes_nothing() {
        let aggregator = Aggregator::new();
        aggregator
            .measure_with("a", 1.0, Measure::new().percentile(50.0))
            .unwrap();

        let result = aggregator.measure_with("a", 99.0, Measure::new().percentiles([50.0, 100.1]));
        assert_eq!(result, Err(InvalidPercentile(100.1)));

        assert_eq!(aggregator.track_percentile("a", &no_tags(), -1.0), Err(InvalidPercentile(-1.0)));

        assert_eq!(aggregator.fetch("a", &no_tags()).map(|s| s.count), Some(1));
        assert_eq!(aggregator.fetch_percentile("a", &no_tags(), 100.0), Some(1.0));

        let mut batch = Batch::new();
        aggregator.flush_to(&mut batch, FlushOptions::default());
        assert!(batch.aggregate("a.p50", &no_tags()).is_some());
        assert!(batch.aggregate("a.p100", &no_tags()).is_none());
    }

    #[test]
    fn test_track_percentile_out_of_range() {
        let aggregator = Aggregator::new();
        let tags = Tags::from([("host".to_owned(), "a".to_owned())]);
        for value in [1.0, 2.0, 3.0] {
            aggregator
                .measure_with("t", value, Measure::new().tags(tags.clone()).percentile(50.0))
                .unwrap();
        }

        let before = aggregator.fetch_percentile("t", &tags, 50.0);
        assert_eq!(
            aggregator.track_percentile("t", &tags, 100.1),
            Err(InvalidPercentile(100.1))
        );

        assert_eq!(aggregator.fetch_percentile("t", &tags, 50.0), before);
        assert_eq!(aggregator.fetch_percentile("t", &tags, 100.0), Some(3.0));
        assert_eq!(aggregator.fetch("t", &tags).map(|s| s.count), Some(3));

        let mut batch = Batch::new();
        assert_eq!(aggregator.flush_to(&mut batch, FlushOptions::default()), 2);
        assert!(batch.aggregate("t.p50", &tags).is_some());
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let aggregator = Aggregator::new();
        aggregator.measure("t", 2.0);
        aggregator.measure("t", f64::NAN);
        aggregator.measure("t", f64::NEG_INFINITY);
        aggregator
            .measure_with("t", f64::INFINITY, Measure::new().percentile(50.0))
            .unwrap();

        assert_eq!(aggregator.fetch("t", &no_tags()), Some(Summary::single(2.0)));
        assert_eq!(aggregator.fetch_percentile("t", &no_tags(), 50.0), None);
    }

    #[test]
    fn test_time_with_invalid_percentile_skips_block() {
        let aggregator = Aggregator::new();
        let mut called = false;

        let result = aggregator.time_with("a", Measure::new().percentile(-5.0), || called = true);

        assert!(result.is_err());
        assert!(!called);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_time_returns_block_value() {
        let aggregator = Aggregator::new();
        let value = aggregator.time("sleep", || {
            thread::sleep(Duration::from_millis(20));
            42
        });

        assert_eq!(value, 42);
        let summary = aggregator.fetch("sleep", &no_tags()).unwrap();
        assert_eq!(summary.count, 1);
        assert!(summary.sum >= 20.0);
        assert_eq!(summary.sum, summary.sum.round());
    }

    #[test]
    fn test_flush_percentile_entries() {
        let aggregator = Aggregator::new();
        for value in 1..=10 {
            aggregator
                .measure_with(
                    "request.time",
                    value as f64,
                    Measure::new().tag("host", "a").percentiles([50.0, 99.9]),
                )
                .unwrap();
        }

        let mut batch = Batch::new();
        assert_eq!(aggregator.flush_to(&mut batch, FlushOptions::default()), 3);

        let tags = Tags::from([("host".to_owned(), "a".to_owned())]);
        let p50 = batch.aggregate("request.time.p50", &tags).unwrap();
        assert_eq!(p50.summary, Summary::single(5.0));
        let p999 = batch.aggregate("request.time.p999", &tags).unwrap();
        assert_eq!(p999.summary, Summary::single(10.0));

        assert!(aggregator.is_empty());
        assert_eq!(aggregator.fetch_percentile("request.time", &tags, 50.0), None);
    }

    #[test]
    fn test_flush_similar_percentiles() {
        let aggregator = Aggregator::new();
        aggregator
            .measure_with("t", 1.0, Measure::new().percentiles([9.99, 99.9]))
            .unwrap();

        let mut batch = Batch::new();
        assert_eq!(aggregator.flush_to(&mut batch, FlushOptions::default()), 3);
        assert!(batch.aggregate("t.p0999", &no_tags()).is_some());
        assert!(batch.aggregate("t.p999", &no_tags()).is_some());
    }

    #[test]
    fn test_percentile_requests_share_reservoir() {
        let aggregator = Aggregator::new();
        aggregator
            .measure_with("t", 1.0, Measure::new().percentile(50.0))
            .unwrap();
        aggregator
            .measure_with("t", 2.0, Measure::new().percentile(95.0))
            .unwrap();
        aggregator.track_percentile("t", &no_tags(), 0.0).unwrap();

        let mut batch = Batch::new();
        aggregator.flush_to(&mut batch, FlushOptions::default());

        assert_eq!(batch.aggregate("t.p50", &no_tags()).map(|e| e.summary.sum), Some(1.0));
        assert_eq!(batch.aggregate("t.p95", &no_tags()).map(|e| e.summary.sum), Some(2.0));
        assert_eq!(batch.aggregate("t.p0", &no_tags()).map(|e| e.summary.sum), Some(1.0));
    }

    #[test]
    fn test_flush_preserve() {
        let aggregator = Aggregator::new();
        aggregator
            .measure_with("t", 4.0, Measure::new().percentile(95.0))
            .unwrap();

        let mut batch = Batch::new();
        aggregator.flush_to(&mut batch, FlushOptions::preserve());
        assert_eq!(batch.aggregates.len(), 2);

        assert_eq!(aggregator.fetch("t", &no_tags()), Some(Summary::single(4.0)));
        assert_eq!(aggregator.fetch_percentile("t", &no_tags(), 95.0), Some(4.0));
    }

    #[test]
    fn test_flush_prefix() {
        let aggregator = Aggregator::new();
        aggregator.set_prefix(Some("app".to_owned()));
        aggregator
            .measure_with("t", 4.0, Measure::new().percentile(95.0))
            .unwrap();

        let mut batch = Batch::new();
        aggregator.flush_to(&mut batch, FlushOptions::default());

        let mut names: Vec<_> = batch.aggregates.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["app.t", "app.t.p95"]);
    }

    #[test]
    fn test_concurrent_measure() {
        let aggregator = Aggregator::new();

        thread::scope(|scope| {
            for worker in 0..4 {
                let aggregator = &aggregator;
                scope.spawn(move || {
                    for value in 0..250 {
                        aggregator.measure("work", (worker * 250 + value) as f64);
                    }
                });
            }
        });

        let summary = aggregator.fetch("work", &no_tags()).unwrap();
        assert_eq!(summary.count, 1000);
        assert_eq!(summary.sum, (0..1000).sum::<i32>() as f64);
        assert_eq!(summary.min, 0.0);
        assert_eq!(summary.max, 999.0);
    }

    #[test]
    fn test_delete_all() {
        let aggregator = Aggregator::new();
        aggregator
            .measure_with("t", 4.0, Measure::new().percentile(95.0))
            .unwrap();
        aggregator.delete_all();

        assert!(aggregator.is_empty());
        assert_eq!(aggregator.fetch_percentile("t", &no_tags(), 95.0), None);
    }
}
