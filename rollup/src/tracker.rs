use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rollup_collector::{
    Collector, FlushOptions, Group, Increment, InvalidPercentile, Measure, MeasureValue, Sink,
    SinkError,
};
use rollup_config::{Config, EventMode, Suite};
use rollup_worker::{BoxError, Worker, WorkerError, WorkerHandle, WorkerMode};
use tokio::runtime::Handle;

use crate::flusher::{FlushReport, Flusher};

/// Requests slower than this are counted as slow.
const SLOW_REQUEST_MILLIS: MeasureValue = 200.0;

/// An error starting or stopping the flush worker.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The flush worker is already running.
    #[error("flush worker already running")]
    AlreadyRunning,
    /// The flush worker is not running.
    #[error("flush worker not running")]
    NotRunning,
    /// The configured event mode requires an async runtime.
    #[error("event mode {0:?} requires a running tokio runtime")]
    NoRuntime(EventMode),
    /// The worker failed.
    #[error("flush worker failed")]
    Worker(#[from] WorkerError),
}

/// Queueing statistics reported by a load balancer in front of the application.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QueueStats {
    /// Number of requests waiting in the queue.
    pub depth: f64,
    /// Time the request spent waiting in milliseconds.
    pub wait_time: MeasureValue,
    /// Number of application instances in use.
    pub dynos: f64,
}

/// Ties together the configuration, a [`Collector`], the flush pipeline and the flush worker.
///
/// ```
/// use rollup::Tracker;
/// use rollup_config::Config;
/// use rollup_test::CapturingSink;
///
/// let sink = CapturingSink::new();
/// let tracker = Tracker::new(Config::default(), sink.clone());
///
/// tracker.increment("jobs.processed");
/// tracker.flush().unwrap();
///
/// assert_eq!(sink.batches()[0].counters[0].name, "jobs.processed");
/// ```
pub struct Tracker<S> {
    config: RwLock<Config>,
    collector: Arc<Collector>,
    flusher: Arc<Flusher<S>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl<S> Tracker<S>
where
    S: Sink + 'static,
{
    /// Creates a tracker submitting to `sink`. The flush worker is not started.
    pub fn new(config: Config, sink: S) -> Self {
        let mut collector = Collector::new();
        if let Some(prefix) = config.prefix() {
            collector = collector.with_prefix(prefix);
        }
        if let Some(source_prefix) = config.source_prefix() {
            collector = collector.with_source_prefix(source_prefix);
        }

        let options = FlushOptions {
            preserve: config.preserve_on_flush(),
        };
        let flusher = Flusher::new(sink)
            .retry_batches(config.retry_batches())
            .default_tags(config.tags().clone())
            .options(options);

        Self {
            config: RwLock::new(config),
            collector: Arc::new(collector),
            flusher: Arc::new(flusher),
            worker: Mutex::new(None),
        }
    }

    /// Returns the collector.
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    /// Returns the flush pipeline.
    pub fn flusher(&self) -> &Flusher<S> {
        &self.flusher
    }

    /// See [`Collector::increment`].
    pub fn increment(&self, name: &str) {
        self.collector.increment(name);
    }

    /// See [`Collector::increment_by`].
    pub fn increment_by(&self, name: &str, amount: i64) {
        self.collector.increment_by(name, amount);
    }

    /// See [`Collector::increment_with`].
    pub fn increment_with(&self, name: &str, increment: Increment) {
        self.collector.increment_with(name, increment);
    }

    /// See [`Collector::measure`].
    pub fn measure(&self, name: &str, value: MeasureValue) {
        self.collector.measure(name, value);
    }

    /// See [`Collector::measure_with`].
    pub fn measure_with(
        &self,
        name: &str,
        value: MeasureValue,
        options: Measure,
    ) -> Result<(), InvalidPercentile> {
        self.collector.measure_with(name, value, options)
    }

    /// See [`Collector::timing`].
    pub fn timing(&self, name: &str, millis: MeasureValue) {
        self.collector.timing(name, millis);
    }

    /// See [`Collector::time`].
    pub fn time<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.collector.time(name, f)
    }

    /// See [`Collector::group`].
    pub fn group<F, R>(&self, prefix: &str, f: F) -> R
    where
        F: FnOnce(&Group<'_>) -> R,
    {
        self.collector.group(prefix, f)
    }

    /// Flushes the collector to the sink immediately.
    pub fn flush(&self) -> Result<FlushReport, SinkError> {
        self.flusher.flush(&self.collector)
    }

    /// Returns `true` if the given instrumentation suite is enabled.
    pub fn suite_enabled(&self, suite: Suite) -> bool {
        self.config.read().suite_enabled(suite)
    }

    /// Replaces the prefix in the configuration and the collector.
    pub fn set_prefix(&self, prefix: Option<String>) {
        let mut config = self.config.write();
        config.set_prefix(prefix);
        self.collector.set_prefix(config.prefix().map(str::to_owned));
    }

    /// Returns `true` if the flush worker should start without an explicit call to
    /// [`start`](Self::start).
    ///
    /// Without an explicit `autorun` setting, the worker starts.
    pub fn should_autorun(&self) -> bool {
        self.config.read().autorun().unwrap_or(true)
    }

    /// Starts the flush worker if [`should_autorun`](Self::should_autorun) returns `true`.
    pub fn autostart(&self) -> Result<bool, TrackerError> {
        if !self.should_autorun() {
            rollup_log::debug!("autorun disabled, not starting flush worker");
            return Ok(false);
        }

        self.start()?;
        Ok(true)
    }

    /// Returns `true` if the flush worker is running.
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Starts the flush worker with the configured interval, event mode and start policy.
    ///
    /// The reactor and cooperative event modes require to be called within a tokio runtime.
    pub fn start(&self) -> Result<(), TrackerError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(TrackerError::AlreadyRunning);
        }

        let (event_mode, start_policy, interval) = {
            let config = self.config.read();
            (
                config.event_mode(),
                config.start_policy(),
                config.flush_interval(),
            )
        };

        let mode = match event_mode {
            EventMode::Thread => WorkerMode::Blocking,
            EventMode::Reactor => WorkerMode::Reactor(current_runtime(event_mode)?),
            EventMode::Cooperative => WorkerMode::Cooperative(current_runtime(event_mode)?),
        };

        let collector = self.collector.clone();
        let flusher = self.flusher.clone();
        let handle = Worker::new(mode)
            .start_policy(start_policy)
            .run_periodically(interval, move || {
                flusher.flush(&collector)?;
                Ok::<(), BoxError>(())
            })?;

        rollup_log::info!(
            mode = %event_mode_name(event_mode),
            interval = ?interval,
            "flush worker started"
        );

        *worker = Some(handle);
        Ok(())
    }

    /// Stops the flush worker.
    ///
    /// A flush in progress completes. Data collected since the last flush remains in the collector
    /// and can be submitted with [`flush`](Self::flush).
    pub fn stop(&self) -> Result<(), TrackerError> {
        let handle = self.worker.lock().take().ok_or(TrackerError::NotRunning)?;
        handle.stop()?;
        rollup_log::info!("flush worker stopped");
        Ok(())
    }

    /// Records the metrics of a served request, subject to the enabled suites.
    ///
    /// With all suites enabled, this reports:
    ///
    ///  - `request.total`, `request.time` and `request.slow` for requests above 200ms,
    ///  - `request.method.<method>` and `request.method.<method>.time`,
    ///  - `request.status.<code>`, `request.status.<n>xx` and their `.time` timings.
    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        let (suites, percentiles) = {
            let config = self.config.read();
            let percentiles: Vec<f64> = config.percentiles().iter().map(|p| p.value()).collect();
            (config.suites(), percentiles)
        };
        let millis = duration.as_secs_f64() * 1000.0;

        self.collector.group("request", |request| {
            if suites.enabled(Suite::Request) {
                request.increment("total");
                let timing = Measure::new().percentiles(percentiles.iter().copied());
                if let Err(error) = request.measure_with("time", millis, timing) {
                    rollup_log::warn!("invalid configured percentile: {error}");
                }
                if millis > SLOW_REQUEST_MILLIS {
                    request.increment("slow");
                }
            }

            if suites.enabled(Suite::RequestMethod) {
                request.group("method", |method_group| {
                    let method = method.to_ascii_lowercase();
                    method_group.increment(&method);
                    method_group.timing(&format!("{method}.time"), millis);
                });
            }

            if suites.enabled(Suite::RequestStatus) {
                request.group("status", |status_group| {
                    let class = format!("{}xx", status / 100);
                    status_group.increment(&status.to_string());
                    status_group.increment(&class);
                    status_group.timing(&format!("{status}.time"), millis);
                    status_group.timing(&format!("{class}.time"), millis);
                });
            }
        });
    }

    /// Records request queueing statistics if the queue suite is enabled.
    pub fn record_queue(&self, stats: QueueStats) {
        if !self.suite_enabled(Suite::Queue) {
            return;
        }

        self.collector.group("queue", |queue| {
            queue.measure("depth", stats.depth);
            queue.timing("wait_time", stats.wait_time);
            queue.measure("dynos", stats.dynos);
        });
    }
}

impl<S> Drop for Tracker<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.stop().ok();
        }
    }
}

fn current_runtime(event_mode: EventMode) -> Result<Handle, TrackerError> {
    Handle::try_current().map_err(|_| TrackerError::NoRuntime(event_mode))
}

fn event_mode_name(event_mode: EventMode) -> &'static str {
    match event_mode {
        EventMode::Thread => "thread",
        EventMode::Reactor => "reactor",
        EventMode::Cooperative => "cooperative",
    }
}
