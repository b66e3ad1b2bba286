use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use rollup_log::LogError;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::schedule::{Schedule, StartPolicy};

/// A boxed error returned by a periodic callback.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An error of the periodic worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The period must be greater than zero.
    #[error("invalid period {0:?}")]
    InvalidPeriod(Duration),
    /// The background thread could not be spawned.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),
    /// The worker was already stopped.
    #[error("worker already stopped")]
    AlreadyStopped,
    /// The background execution terminated abnormally.
    #[error("worker terminated abnormally")]
    Join,
}

/// The lifecycle state of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Not yet started.
    Idle,
    /// Running the callback periodically.
    Running,
    /// Stopped. This state is terminal.
    Stopped,
}

/// The execution context waiting between runs.
#[derive(Clone, Debug)]
pub enum WorkerMode {
    /// A dedicated thread blocks until the next run and invokes the callback.
    Blocking,
    /// A task on the given runtime re-arms a timer after every run and hands the callback to the
    /// runtime's blocking pool, so the reactor is never occupied by the callback.
    Reactor(Handle),
    /// A task on the given runtime sleeps cooperatively and invokes the callback inline.
    Cooperative(Handle),
}

impl WorkerMode {
    /// Returns the name of the mode, matching its configuration value.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Blocking => "thread",
            Self::Reactor(_) => "reactor",
            Self::Cooperative(_) => "cooperative",
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State shared between a running worker and its handle.
#[derive(Debug)]
struct Control {
    state: Mutex<WorkerState>,
    wakeup: Condvar,
    notify: Notify,
    finished: Mutex<bool>,
    finished_cond: Condvar,
}

impl Control {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Idle),
            wakeup: Condvar::new(),
            notify: Notify::new(),
            finished: Mutex::new(false),
            finished_cond: Condvar::new(),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.state.lock() == WorkerState::Stopped
    }

    fn stop(&self) -> Result<(), WorkerError> {
        let mut state = self.state.lock();
        if *state == WorkerState::Stopped {
            return Err(WorkerError::AlreadyStopped);
        }

        *state = WorkerState::Stopped;
        self.wakeup.notify_all();
        self.notify.notify_one();
        Ok(())
    }

    fn finish(&self) {
        *self.finished.lock() = true;
        self.finished_cond.notify_all();
    }

    fn wait_finished(&self) {
        let mut finished = self.finished.lock();
        while !*finished {
            self.finished_cond.wait(&mut finished);
        }
    }
}

/// Marks the worker as finished when the loop exits, including by panic or cancellation.
struct FinishGuard(Arc<Control>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Invokes the callback, logging errors and panics instead of propagating them.
fn invoke<F>(callback: &mut F)
where
    F: FnMut() -> Result<(), BoxError>,
{
    match panic::catch_unwind(AssertUnwindSafe(&mut *callback)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            rollup_log::error!("periodic callback failed: {}", LogError(&*error));
        }
        Err(payload) => {
            rollup_log::error!(
                "periodic callback panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

fn log_skipped(skipped: u32, period: Duration) {
    if skipped > 0 {
        rollup_log::warn!(
            skipped,
            ?period,
            "periodic callback overran its period, skipping missed runs"
        );
    }
}

/// Builder and entry point of a periodic worker.
///
/// ```
/// use std::time::Duration;
/// use rollup_worker::{Worker, WorkerMode, WorkerState};
///
/// let handle = Worker::new(WorkerMode::Blocking)
///     .run_periodically(Duration::from_secs(60), || Ok(()))
///     .unwrap();
///
/// assert_eq!(handle.state(), WorkerState::Running);
/// handle.stop().unwrap();
/// handle.join().unwrap();
/// ```
#[derive(Debug)]
pub struct Worker {
    mode: WorkerMode,
    start_policy: StartPolicy,
    start_delay: Option<Duration>,
    control: Arc<Control>,
}

impl Worker {
    /// Creates an idle worker for the given execution mode.
    pub fn new(mode: WorkerMode) -> Self {
        Self {
            mode,
            start_policy: StartPolicy::default(),
            start_delay: None,
            control: Arc::new(Control::new()),
        }
    }

    /// Sets the policy for the first run.
    pub fn start_policy(mut self, start_policy: StartPolicy) -> Self {
        self.start_policy = start_policy;
        self
    }

    /// Runs for the first time after a fixed `delay`, ignoring the start policy.
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Returns the execution mode.
    pub fn mode(&self) -> &WorkerMode {
        &self.mode
    }

    /// Returns the current state, which is always [`WorkerState::Idle`] before the worker runs.
    pub fn state(&self) -> WorkerState {
        *self.control.state.lock()
    }

    /// Starts invoking `callback` every `period`.
    ///
    /// The first run is determined by the [`StartPolicy`] or the fixed start delay. After every run, the next run moves to
    /// the next slot of the schedule that lies in the future. Errors and panics of the callback are
    /// logged and do not affect the schedule.
    pub fn run_periodically<F>(self, period: Duration, callback: F) -> Result<WorkerHandle, WorkerError>
    where
        F: FnMut() -> Result<(), BoxError> + Send + 'static,
    {
        let delay = match self.start_delay {
            Some(delay) => delay,
            None => self.start_policy.first_delay(period, SystemTime::now())?,
        };
        let first_run = Instant::now()
            .checked_add(delay)
            .ok_or(WorkerError::InvalidPeriod(period))?;
        let schedule = Schedule::new(period, first_run)?;

        {
            let mut state = self.control.state.lock();
            if *state == WorkerState::Stopped {
                return Err(WorkerError::AlreadyStopped);
            }
            *state = WorkerState::Running;
        }

        rollup_log::debug!(
            mode = self.mode.name(),
            ?period,
            ?delay,
            "starting periodic worker"
        );

        let control = self.control;
        let execution = match self.mode {
            WorkerMode::Blocking => {
                let guard = FinishGuard(control.clone());
                let handle = thread::Builder::new()
                    .name("rollup-worker".to_owned())
                    .spawn(move || run_blocking(guard, schedule, callback))
                    .map_err(|error| {
                        *control.state.lock() = WorkerState::Stopped;
                        WorkerError::Spawn(error)
                    })?;
                Execution::Thread(handle)
            }
            WorkerMode::Reactor(ref handle) => {
                let guard = FinishGuard(control.clone());
                Execution::Task(handle.spawn(run_reactor(guard, schedule, callback)))
            }
            WorkerMode::Cooperative(ref handle) => {
                let guard = FinishGuard(control.clone());
                Execution::Task(handle.spawn(run_cooperative(guard, schedule, callback)))
            }
        };

        Ok(WorkerHandle { control, execution })
    }
}

fn run_blocking<F>(guard: FinishGuard, mut schedule: Schedule, mut callback: F)
where
    F: FnMut() -> Result<(), BoxError>,
{
    let control = &guard.0;

    loop {
        {
            let mut state = control.state.lock();
            loop {
                if *state == WorkerState::Stopped {
                    return;
                }
                if schedule.is_due(Instant::now()) {
                    break;
                }
                control.wakeup.wait_until(&mut state, schedule.next_run());
            }
        }

        invoke(&mut callback);
        log_skipped(schedule.advance(Instant::now()), schedule.period());
    }
}

async fn run_reactor<F>(guard: FinishGuard, mut schedule: Schedule, mut callback: F)
where
    F: FnMut() -> Result<(), BoxError> + Send + 'static,
{
    let control = &guard.0;
    let timer = tokio::time::sleep_until(schedule.next_run().into());
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut timer => {},
            _ = control.notify.notified() => {},
        }

        if control.is_stopped() {
            break;
        }
        if !schedule.is_due(Instant::now()) {
            continue;
        }

        let result = tokio::task::spawn_blocking(move || {
            invoke(&mut callback);
            callback
        })
        .await;

        callback = match result {
            Ok(callback) => callback,
            Err(error) => {
                rollup_log::error!("periodic worker lost its callback: {}", LogError(&error));
                break;
            }
        };

        log_skipped(schedule.advance(Instant::now()), schedule.period());
        timer.as_mut().reset(schedule.next_run().into());
    }
}

async fn run_cooperative<F>(guard: FinishGuard, mut schedule: Schedule, mut callback: F)
where
    F: FnMut() -> Result<(), BoxError> + Send + 'static,
{
    let control = &guard.0;

    loop {
        let remaining = schedule.remaining(Instant::now());
        if !remaining.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {},
                _ = control.notify.notified() => {},
            }
        }

        if control.is_stopped() {
            break;
        }
        if !schedule.is_due(Instant::now()) {
            continue;
        }

        invoke(&mut callback);
        log_skipped(schedule.advance(Instant::now()), schedule.period());
    }
}

#[derive(Debug)]
enum Execution {
    Thread(thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

/// Handle to a running worker.
///
/// Dropping the handle does not stop the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    control: Arc<Control>,
    execution: Execution,
}

impl WorkerHandle {
    /// Returns the current state.
    pub fn state(&self) -> WorkerState {
        *self.control.state.lock()
    }

    /// Stops the worker.
    ///
    /// No run starts after this returns. A run already in progress completes normally.
    pub fn stop(&self) -> Result<(), WorkerError> {
        self.control.stop()?;
        rollup_log::debug!("stopping periodic worker");
        Ok(())
    }

    /// Blocks until the worker has exited.
    ///
    /// Must not be called from within an asynchronous context; use [`join_async`](Self::join_async)
    /// there instead. Never returns unless [`stop`](Self::stop) is called.
    pub fn join(self) -> Result<(), WorkerError> {
        match self.execution {
            Execution::Thread(handle) => handle.join().map_err(|_| WorkerError::Join),
            Execution::Task(_) => {
                self.control.wait_finished();
                Ok(())
            }
        }
    }

    /// Waits until the worker has exited.
    pub async fn join_async(self) -> Result<(), WorkerError> {
        match self.execution {
            Execution::Thread(handle) => tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|_| WorkerError::Join)?
                .map_err(|_| WorkerError::Join),
            Execution::Task(handle) => handle.await.map_err(|_| WorkerError::Join),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const PERIOD: Duration = Duration::from_millis(100);

    fn counting() -> (Arc<AtomicUsize>, impl FnMut() -> Result<(), BoxError> + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = move || -> Result<(), BoxError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        (calls, callback)
    }

    #[test]
    fn test_zero_period() {
        let result = Worker::new(WorkerMode::Blocking).run_periodically(Duration::ZERO, || Ok(()));
        assert!(matches!(result, Err(WorkerError::InvalidPeriod(_))));
    }

    #[test]
    fn test_mode() {
        let worker = Worker::new(WorkerMode::Blocking);
        assert_eq!(worker.mode().name(), "thread");
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn test_blocking_cadence() {
        rollup_test::setup();

        let (calls, callback) = counting();
        let handle = Worker::new(WorkerMode::Blocking)
            .start_delay(PERIOD)
            .run_periodically(PERIOD, callback)
            .unwrap();

        // Runs are due at 100, 200, 300 and 400ms.
        thread::sleep(Duration::from_millis(450));
        handle.stop().unwrap();
        handle.join().unwrap();

        let calls = calls.load(Ordering::SeqCst);
        assert!((3..=5).contains(&calls), "{calls} calls");
    }

    #[test]
    fn test_blocking_stop() {
        let (calls, callback) = counting();
        let handle = Worker::new(WorkerMode::Blocking)
            .run_periodically(PERIOD, callback)
            .unwrap();

        thread::sleep(PERIOD * 3);
        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(matches!(handle.stop(), Err(WorkerError::AlreadyStopped)));
        handle.join().unwrap();

        let before = calls.load(Ordering::SeqCst);
        assert!(before > 0);
        thread::sleep(PERIOD * 2);
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_blocking_slow_callback_skips() {
        rollup_test::setup();

        let (calls, mut inner) = counting();
        let callback = move || {
            thread::sleep(Duration::from_millis(250));
            inner()
        };

        let handle = Worker::new(WorkerMode::Blocking)
            .start_delay(PERIOD)
            .run_periodically(PERIOD, callback)
            .unwrap();

        // Runs start at 100, 400 and 700ms. Each takes 250ms, so the slots in between are skipped.
        thread::sleep(Duration::from_millis(850));
        handle.stop().unwrap();
        handle.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocking_single_slow_run_keeps_slots() {
        rollup_test::setup();

        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = starts.clone();
        let callback = move || -> Result<(), BoxError> {
            let mut starts = recorded.lock();
            starts.push(Instant::now());
            let slow = starts.len() == 2;
            drop(starts);

            if slow {
                thread::sleep(Duration::from_millis(250));
            }
            Ok(())
        };

        let handle = Worker::new(WorkerMode::Blocking)
            .start_delay(PERIOD)
            .run_periodically(PERIOD, callback)
            .unwrap();

        // Runs start at 100, 200, 500, 600 and 700ms. The second run ends at 450ms, so the slots
        // at 300 and 400ms are skipped instead of catching up.
        thread::sleep(Duration::from_millis(750));
        handle.stop().unwrap();
        handle.join().unwrap();

        let starts = starts.lock();
        assert!((4..=6).contains(&starts.len()), "{} calls", starts.len());
        assert!(starts[2] - starts[1] >= Duration::from_millis(280));
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(80), "back-to-back runs {gap:?} apart");
        }
    }

    #[test]
    fn test_unrepresentable_period() {
        let period = Duration::from_secs(u64::MAX);
        for policy in [StartPolicy::Aligned, StartPolicy::Wobble] {
            let result = Worker::new(WorkerMode::Blocking)
                .start_policy(policy)
                .run_periodically(period, || Ok(()));
            assert!(matches!(result, Err(WorkerError::InvalidPeriod(_))));
        }
    }

    #[test]
    fn test_callback_errors_and_panics_are_contained() {
        rollup_test::setup();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = move || -> Result<(), BoxError> {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            match call {
                0 => Err(io::Error::other("sink unavailable").into()),
                1 => panic!("callback exploded"),
                _ => Ok(()),
            }
        };

        let handle = Worker::new(WorkerMode::Blocking)
            .start_policy(StartPolicy::Wobble)
            .run_periodically(Duration::from_millis(50), callback)
            .unwrap();

        thread::sleep(Duration::from_millis(400));
        handle.stop().unwrap();
        handle.join().unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reactor_cadence() {
        rollup_test::setup();

        let (calls, callback) = counting();
        let handle = Worker::new(WorkerMode::Reactor(Handle::current()))
            .start_delay(PERIOD)
            .run_periodically(PERIOD, callback)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.stop().unwrap();
        handle.join_async().await.unwrap();

        let stopped_at = calls.load(Ordering::SeqCst);
        tokio::time::sleep(PERIOD * 2).await;

        assert!((3..=5).contains(&stopped_at), "{stopped_at} calls");
        assert_eq!(calls.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cooperative_cadence() {
        rollup_test::setup();

        let (calls, callback) = counting();
        let worker = Worker::new(WorkerMode::Cooperative(Handle::current()))
            .start_delay(PERIOD);
        assert_eq!(worker.mode().to_string(), "cooperative");

        let handle = worker.run_periodically(PERIOD, callback).unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.stop().unwrap();
        handle.join_async().await.unwrap();

        let stopped_at = calls.load(Ordering::SeqCst);
        tokio::time::sleep(PERIOD * 2).await;

        assert!((3..=5).contains(&stopped_at), "{stopped_at} calls");
        assert_eq!(calls.load(Ordering::SeqCst), stopped_at);
    }

    #[test]
    fn test_reactor_join_from_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();

        let (_calls, callback) = counting();
        let handle = Worker::new(WorkerMode::Reactor(runtime.handle().clone()))
            .run_periodically(Duration::from_secs(60), callback)
            .unwrap();

        handle.stop().unwrap();
        handle.join().unwrap();
    }
}
