use std::collections::VecDeque;

use parking_lot::Mutex;
use rollup_collector::{Batch, Collector, FlushOptions, Sink, SinkError, Tags, ValidatingQueue};
use rollup_log::LogError;

/// Result of a successful flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Number of batches accepted by the sink, including retried ones.
    pub sent: usize,
    /// Number of entries removed by validation.
    pub dropped: usize,
}

/// The flush pipeline from a [`Collector`] to a [`Sink`].
///
/// Batches that fail with a retryable error are kept and submitted again before the next batch.
/// At most `retry_batches` batches are kept, older ones are discarded when the limit is exceeded.
/// Batches that fail permanently are discarded immediately.
#[derive(Debug)]
pub struct Flusher<S> {
    queue: ValidatingQueue<S>,
    pending: Mutex<VecDeque<Batch>>,
    retry_batches: usize,
    default_tags: Tags,
    options: FlushOptions,
}

impl<S: Sink> Flusher<S> {
    /// Creates a flusher submitting to `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            queue: ValidatingQueue::new(sink),
            pending: Mutex::new(VecDeque::new()),
            retry_batches: 1,
            default_tags: Tags::new(),
            options: FlushOptions::default(),
        }
    }

    /// Sets the number of failed batches kept for retry.
    pub fn retry_batches(mut self, retry_batches: usize) -> Self {
        self.retry_batches = retry_batches;
        self
    }

    /// Sets tags added to every entry that does not define them itself.
    pub fn default_tags(mut self, tags: Tags) -> Self {
        self.default_tags = tags;
        self
    }

    /// Sets the options of the collector flush.
    pub fn options(mut self, options: FlushOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the sink.
    pub fn sink(&self) -> &S {
        self.queue.sink()
    }

    /// Returns the number of batches waiting for retry.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn apply_default_tags(&self, batch: &mut Batch) {
        if self.default_tags.is_empty() {
            return;
        }

        let tag_sets = batch
            .counters
            .iter_mut()
            .map(|entry| &mut entry.tags)
            .chain(batch.aggregates.iter_mut().map(|entry| &mut entry.tags));

        for tags in tag_sets {
            for (key, value) in &self.default_tags {
                tags.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    /// Flushes the collector and submits the batch along with all batches pending retry.
    ///
    /// The collector is only locked while its state is detached. Returns the last submission error,
    /// if any. Retryable batches remain pending in that case.
    pub fn flush(&self, collector: &Collector) -> Result<FlushReport, SinkError> {
        let mut batch = collector.flush_batch(self.options);
        self.apply_default_tags(&mut batch);
        let validated = self.queue.validate(batch);

        let mut report = FlushReport {
            sent: 0,
            dropped: validated.dropped.len(),
        };

        let mut pending = self.pending.lock();
        if !validated.batch.is_empty() {
            pending.push_back(validated.batch);
        }

        let mut result = Ok(());
        while let Some(batch) = pending.pop_front() {
            match self.queue.send(&batch) {
                Ok(()) => report.sent += 1,
                Err(error) if error.is_retryable() => {
                    rollup_log::debug!(entries = batch.len(), "keeping batch for retry");
                    pending.push_front(batch);
                    result = Err(error);
                    break;
                }
                Err(error) => {
                    rollup_log::error!(
                        entries = batch.len(),
                        "dropping batch rejected by sink: {}",
                        LogError(&error)
                    );
                    result = Err(error);
                }
            }
        }

        while pending.len() > self.retry_batches {
            if let Some(batch) = pending.pop_front() {
                rollup_log::error!(
                    entries = batch.len(),
                    "dropping batch, retry buffer is full"
                );
            }
        }

        result.map(|()| report)
    }
}

#[cfg(test)]
mod tests {
    use rollup_collector::{Increment, Measure};
    use rollup_test::{CapturingSink, Outcome};

    use super::*;

    fn collector_with_data() -> Collector {
        let collector = Collector::new();
        collector.increment("requests");
        collector
    }

    #[test]
    fn test_flush_submits_batch() {
        rollup_test::setup();

        let sink = CapturingSink::new();
        let flusher = Flusher::new(sink.clone());

        let report = flusher.flush(&collector_with_data()).unwrap();
        assert_eq!(report, FlushReport { sent: 1, dropped: 0 });
        assert_eq!(sink.batches().len(), 1);
    }

    #[test]
    fn test_default_tags() {
        let sink = CapturingSink::new();
        let flusher = Flusher::new(sink.clone()).default_tags(Tags::from([
            ("region".to_owned(), "eu".to_owned()),
            ("host".to_owned(), "default".to_owned()),
        ]));

        let collector = Collector::new();
        collector.increment_with("hits", Increment::new().tag("host", "a"));
        collector
            .measure_with("time", 1.0, Measure::new())
            .unwrap();
        flusher.flush(&collector).unwrap();

        let batch = &sink.batches()[0];
        let counter = &batch.counters[0];
        assert_eq!(counter.tags["host"], "a");
        assert_eq!(counter.tags["region"], "eu");
        assert!(batch.aggregates.iter().all(|e| e.tags["host"] == "default"));
    }

    #[test]
    fn test_retryable_failure_keeps_batch() {
        rollup_test::setup();

        let sink = CapturingSink::new();
        sink.fail_next([Outcome::Retry]);
        let flusher = Flusher::new(sink.clone());

        let collector = Collector::new();
        collector.increment_by("first", 1);
        let error = flusher.flush(&collector).unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(flusher.pending(), 1);

        collector.increment_by("second", 1);
        let report = flusher.flush(&collector).unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(flusher.pending(), 0);

        let batches = sink.batches();
        assert!(batches[0].counter("first", &Tags::new()).is_some());
        assert!(batches[1].counter("second", &Tags::new()).is_some());
    }

    #[test]
    fn test_retry_buffer_is_bounded() {
        rollup_test::setup();

        let sink = CapturingSink::new();
        sink.fail_next([Outcome::Retry, Outcome::Retry, Outcome::Retry]);
        let flusher = Flusher::new(sink.clone()).retry_batches(1);

        let collector = Collector::new();
        for name in ["a", "b", "c"] {
            collector.increment(name);
            assert!(flusher.flush(&collector).is_err());
            assert_eq!(flusher.pending(), 1);
        }

        flusher.flush(&collector).unwrap();

        // Only the most recent failed batch survived.
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].counter("c", &Tags::new()).is_some());
        assert!(batches[0].counter("a", &Tags::new()).is_some());
    }

    #[test]
    fn test_permanent_failure_drops_batch() {
        rollup_test::setup();

        let sink = CapturingSink::new();
        sink.fail_next([Outcome::Reject]);
        let flusher = Flusher::new(sink.clone());

        let error = flusher.flush(&collector_with_data()).unwrap_err();
        assert!(!error.is_retryable());
        assert_eq!(flusher.pending(), 0);
        assert!(sink.batches().is_empty());
    }

    #[test]
    fn test_no_retry_buffer() {
        let sink = CapturingSink::new();
        sink.fail_next([Outcome::Retry]);
        let flusher = Flusher::new(sink.clone()).retry_batches(0);

        assert!(flusher.flush(&collector_with_data()).is_err());
        assert_eq!(flusher.pending(), 0);
    }

    #[test]
    fn test_preserve() {
        let sink = CapturingSink::new();
        let flusher = Flusher::new(sink.clone()).options(FlushOptions::preserve());

        let collector = collector_with_data();
        flusher.flush(&collector).unwrap();

        assert_eq!(collector.counters().fetch("requests", &Tags::new()), Some(1.0));
    }
}
