//! Fixed-cadence fan-out of per-location ingestion tasks.
//!
//! On every tick the dispatcher walks the monitored set in insertion order
//! and spawns one fetch → evaluate → alert → persist task per location onto
//! a bounded pool. A location whose previous task is still running is
//! skipped for that tick, and a location that cannot get a pool slot
//! without waiting is skipped as congestion. The dispatcher never waits for
//! tasks; the timer drives the next tick on its own.
//!
//! Task failures stay inside the task: they are logged, counted in
//! [`SchedulerStats`] and retried on the next tick. Only lifecycle misuse
//! and configuration errors reach the caller. The one fatal condition is a
//! panicking [`AlertSink`], which stops the scheduler and notifies the
//! supervisor registered with [`MonitorScheduler::on_failure`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::alert::{AlertEvaluator, AlertSink};
use crate::error::{MonitorError, Result};
use crate::observation::{Location, MonitoredSet};
use crate::provider::WeatherProvider;
use crate::store::{ObservationStore, StoreError};

/// Default tick period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default number of concurrently running tasks.
pub const DEFAULT_WORKER_COUNT: usize = 5;
/// Default upper bound on one task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time `stop()` waits for tasks to wind down.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Scheduler settings, read once at construction.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub worker_count: usize,
    /// Tasks admitted beyond `worker_count` that may wait for a worker.
    /// Waiting time is not charged against `per_task_timeout`.
    pub queue_capacity: usize,
    pub per_task_timeout: Duration,
    pub shutdown_grace: Duration,
    pub locations: MonitoredSet,
}

impl SchedulerConfig {
    /// Defaults for everything except the locations.
    pub fn new(locations: MonitoredSet) -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: 0,
            per_task_timeout: DEFAULT_TASK_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            locations,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(MonitorError::Config("interval must be > 0".to_string()));
        }
        if self.worker_count == 0 {
            return Err(MonitorError::Config("worker_count must be >= 1".to_string()));
        }
        if self.per_task_timeout.is_zero() {
            return Err(MonitorError::Config(
                "per_task_timeout must be > 0".to_string(),
            ));
        }
        if self.locations.is_empty() {
            return Err(MonitorError::Config(
                "at least one location is required".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// NEW → RUNNING → STOPPING → STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    New,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::New => "new",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Delivered to the supervisor callback when the scheduler dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerFailed {
    pub reason: String,
}

/// Supervisor callback registered with [`MonitorScheduler::on_failure`].
pub type FailureCallback = Arc<dyn Fn(SchedulerFailed) + Send + Sync>;

// ── Stats ───────────────────────────────────────────────────────────

/// Counters for health reporting. Updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    skipped_in_flight: AtomicU64,
    congestion: AtomicU64,
    upserts: AtomicU64,
    provider_failures: AtomicU64,
    timeouts: AtomicU64,
    store_failures: AtomicU64,
    alerts: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    /// Locations skipped because their previous task was still running.
    pub skipped_in_flight: u64,
    /// Locations skipped because the pool had no free slot.
    pub congestion: u64,
    /// Successful upserts, including writes superseded by a newer row.
    pub upserts: u64,
    pub provider_failures: u64,
    pub timeouts: u64,
    pub store_failures: u64,
    pub alerts: u64,
    pub cancelled: u64,
    pub panicked: u64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            skipped_in_flight: self.skipped_in_flight.load(Ordering::Relaxed),
            congestion: self.congestion.load(Ordering::Relaxed),
            upserts: self.upserts.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

// ── In-flight markers ───────────────────────────────────────────────

/// Holds the in-flight bit for one location; clears it on drop, so every
/// exit path of a task (including panics and aborts) releases it.
struct InFlightGuard {
    flags: Arc<[AtomicBool]>,
    index: usize,
}

impl InFlightGuard {
    fn acquire(flags: &Arc<[AtomicBool]>, index: usize) -> Option<Self> {
        flags[index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flags: Arc::clone(flags),
                index,
            })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flags[self.index].store(false, Ordering::Release);
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// Everything the dispatcher and its tasks share.
struct Shared<P, S, A> {
    locations: MonitoredSet,
    in_flight: Arc<[AtomicBool]>,
    provider: Arc<P>,
    store: Arc<S>,
    sink: Arc<A>,
    evaluator: AlertEvaluator,
    stats: SchedulerStats,
    /// `worker_count + queue_capacity` permits; a task holds one from
    /// dispatch until it finishes.
    admission: Arc<Semaphore>,
    /// `worker_count` permits; held while the task is actually running.
    workers: Arc<Semaphore>,
    per_task_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    fatal_tx: mpsc::UnboundedSender<String>,
}

/// Drives periodic per-location ingestion with bounded parallelism.
pub struct MonitorScheduler<P, S, A>
where
    P: WeatherProvider,
    S: ObservationStore,
    A: AlertSink,
{
    shared: Arc<Shared<P, S, A>>,
    interval: Duration,
    shutdown_grace: Duration,
    state: Arc<Mutex<SchedulerState>>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    on_failure: Option<FailureCallback>,
}

impl<P, S, A> MonitorScheduler<P, S, A>
where
    P: WeatherProvider,
    S: ObservationStore,
    A: AlertSink,
{
    /// Build a scheduler in the NEW state.
    ///
    /// Fails with [`MonitorError::Config`] when the configuration is invalid.
    pub fn new(config: SchedulerConfig, provider: Arc<P>, store: Arc<S>, sink: Arc<A>) -> Result<Self> {
        config.validate()?;

        let in_flight: Arc<[AtomicBool]> = (0..config.locations.len())
            .map(|_| AtomicBool::new(false))
            .collect();
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let shared = Shared {
            locations: config.locations,
            in_flight,
            provider,
            store,
            sink,
            evaluator: AlertEvaluator::default(),
            stats: SchedulerStats::default(),
            admission: Arc::new(Semaphore::new(config.worker_count + config.queue_capacity)),
            workers: Arc::new(Semaphore::new(config.worker_count)),
            per_task_timeout: config.per_task_timeout,
            shutdown_tx,
            fatal_tx,
        };

        Ok(Self {
            shared: Arc::new(shared),
            interval: config.interval,
            shutdown_grace: config.shutdown_grace,
            state: Arc::new(Mutex::new(SchedulerState::New)),
            fatal_rx: Mutex::new(Some(fatal_rx)),
            dispatcher: Mutex::new(None),
            on_failure: None,
        })
    }

    /// Replace the default alert evaluator. Only meaningful before `start`.
    pub fn with_evaluator(mut self, evaluator: AlertEvaluator) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.evaluator = evaluator,
            None => log::warn!("[Scheduler] evaluator can only be replaced before start"),
        }
        self
    }

    /// Register the supervisor callback for fatal failures.
    pub fn on_failure(mut self, callback: impl Fn(SchedulerFailed) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    pub fn state(&self) -> SchedulerState {
        *lock_state(&self.state)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Begin ticking. The first tick fires immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = lock_state(&self.state);
        if *state != SchedulerState::New {
            return Err(MonitorError::InvalidState {
                op: "start",
                state: *state,
            });
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MonitorError::Runtime(
                "start() called outside a tokio runtime".to_string(),
            ));
        }
        let fatal_rx = lock_recover(&self.fatal_rx).take().ok_or_else(|| {
            MonitorError::Runtime("failure channel already consumed".to_string())
        })?;

        log::info!(
            "[Scheduler] starting: {} locations, interval {:?}, {} workers",
            self.shared.locations.len(),
            self.interval,
            self.shared.workers.available_permits()
        );

        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            self.interval,
            self.shutdown_grace,
            fatal_rx,
            Arc::clone(&self.state),
            self.on_failure.clone(),
        ));
        *lock_recover(&self.dispatcher) = Some(handle);
        *state = SchedulerState::Running;
        Ok(())
    }

    /// Signal shutdown, cancel in-flight tasks and wait up to the grace
    /// period for them to finish. Tasks still running after the grace
    /// period are aborted.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = lock_state(&self.state);
            if *state != SchedulerState::Running {
                return Err(MonitorError::InvalidState {
                    op: "stop",
                    state: *state,
                });
            }
            *state = SchedulerState::Stopping;
        }

        log::info!("[Scheduler] stopping");
        self.shared.shutdown_tx.send_replace(true);

        let handle = lock_recover(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("[Scheduler] dispatcher task failed: {}", e);
            }
        }

        *lock_state(&self.state) = SchedulerState::Stopped;
        log::info!("[Scheduler] stopped");
        Ok(())
    }

    /// Dispatch a single tick and wait for all of its tasks.
    ///
    /// Only allowed in NEW; the scheduler stays in NEW afterwards unless a
    /// fatal failure occurs.
    pub async fn run_once(&self) -> Result<()> {
        let state = self.state();
        if state != SchedulerState::New {
            return Err(MonitorError::InvalidState {
                op: "run_once",
                state,
            });
        }

        let mut tasks = JoinSet::new();
        dispatch_tick(&self.shared, &mut tasks);
        while let Some(res) = tasks.join_next().await {
            record_join(&self.shared, res);
        }

        let failure = lock_recover(&self.fatal_rx)
            .as_mut()
            .and_then(|rx| rx.try_recv().ok());
        if let Some(reason) = failure {
            self.shared.shutdown_tx.send_replace(true);
            fail(&self.state, self.on_failure.as_ref(), reason);
        }
        Ok(())
    }
}

impl<P, S, A> Drop for MonitorScheduler<P, S, A>
where
    P: WeatherProvider,
    S: ObservationStore,
    A: AlertSink,
{
    fn drop(&mut self) {
        // A dropped scheduler must not leave its dispatcher running.
        self.shared.shutdown_tx.send_replace(true);
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_state(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    lock_recover(state)
}

/// Move to STOPPED and notify the supervisor.
fn fail(state: &Mutex<SchedulerState>, on_failure: Option<&FailureCallback>, reason: String) {
    log::error!("[Scheduler] fatal: {}", reason);
    *lock_state(state) = SchedulerState::Stopped;
    if let Some(callback) = on_failure {
        callback(SchedulerFailed { reason });
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

async fn dispatch_loop<P, S, A>(
    shared: Arc<Shared<P, S, A>>,
    interval: Duration,
    shutdown_grace: Duration,
    mut fatal_rx: mpsc::UnboundedReceiver<String>,
    state: Arc<Mutex<SchedulerState>>,
    on_failure: Option<FailureCallback>,
) where
    P: WeatherProvider,
    S: ObservationStore,
    A: AlertSink,
{
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tasks = JoinSet::new();

    let failure = loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break None,
            Some(reason) = fatal_rx.recv() => break Some(reason),
            _ = ticker.tick() => dispatch_tick(&shared, &mut tasks),
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                record_join(&shared, res);
            }
        }
    };

    shared.shutdown_tx.send_replace(true);
    // Tasks still waiting for a worker see the closed pool as cancellation.
    shared.admission.close();
    shared.workers.close();
    drain(&shared, &mut tasks, shutdown_grace).await;

    if let Some(reason) = failure {
        fail(&state, on_failure.as_ref(), reason);
    }
}

/// Spawn one task per eligible location. Never waits.
fn dispatch_tick<P, S, A>(shared: &Arc<Shared<P, S, A>>, tasks: &mut JoinSet<()>)
where
    P: WeatherProvider,
    S: ObservationStore,
    A: AlertSink,
{
    let tick = shared.stats.ticks.fetch_add(1, Ordering::Relaxed);
    let mut dispatched = 0usize;

    for (index, location) in shared.locations.iter().enumerate() {
        let Some(guard) = InFlightGuard::acquire(&shared.in_flight, index) else {
            SchedulerStats::bump(&shared.stats.skipped_in_flight);
            log::debug!(
                "[Scheduler] tick {}: {} still in flight, skipping",
                tick,
                location.id
            );
            continue;
        };

        let admission = match Arc::clone(&shared.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                SchedulerStats::bump(&shared.stats.congestion);
                log::warn!(
                    "[Scheduler] tick {}: congestion, skipping {}",
                    tick,
                    location.id
                );
                continue;
            }
            Err(TryAcquireError::Closed) => {
                log::debug!("[Scheduler] tick {}: pool closed, not dispatching", tick);
                return;
            }
        };

        SchedulerStats::bump(&shared.stats.dispatched);
        tasks.spawn(run_task(
            Arc::clone(shared),
            location.clone(),
            guard,
            admission,
        ));
        dispatched += 1;
    }

    log::debug!(
        "[Scheduler] tick {}: dispatched {}/{} locations",
        tick,
        dispatched,
        shared.locations.len()
    );
}

fn record_join<P, S, A>(shared: &Shared<P, S, A>, res: std::result::Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            SchedulerStats::bump(&shared.stats.panicked);
            log::error!("[Scheduler] task panicked: {}", e);
        } else {
            log::debug!("[Scheduler] task aborted: {}", e);
        }
    }
}

/// Wait up to `grace` for tasks to observe cancellation, then abort the rest.
async fn drain<P, S, A>(shared: &Shared<P, S, A>, tasks: &mut JoinSet<()>, grace: Duration) {
    let graceful = tokio::time::timeout(grace, async {
        while let Some(res) = tasks.join_next().await {
            record_join(shared, res);
        }
    })
    .await;

    if graceful.is_err() {
        log::warn!(
            "[Scheduler] {} tasks still running after {:?}, aborting",
            tasks.len(),
            grace
        );
        tasks.abort_all();
        while let Some(res) = tasks.join_next().await {
            record_join(shared, res);
        }
    }
}

// ── Per-location task ───────────────────────────────────────────────

/// Resolves once shutdown has been signalled (or the sender is gone).
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// fetch → evaluate → alert → upsert for one location.
///
/// `_in_flight` and `_admission` are released when the future completes or
/// is dropped.
async fn run_task<P, S, A>(
    shared: Arc<Shared<P, S, A>>,
    location: Location,
    _in_flight: InFlightGuard,
    _admission: OwnedSemaphorePermit,
) where
    P: WeatherProvider,
    S: ObservationStore,
    A: AlertSink,
{
    let mut shutdown = shared.shutdown_tx.subscribe();
    let stats = &shared.stats;

    let _worker = tokio::select! {
        biased;
        _ = cancelled(&mut shutdown) => {
            SchedulerStats::bump(&stats.cancelled);
            return;
        }
        permit = Arc::clone(&shared.workers).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                SchedulerStats::bump(&stats.cancelled);
                return;
            }
        },
    };

    // The budget starts once a worker is held, not at submission.
    let deadline = Instant::now() + shared.per_task_timeout;

    let fetched = tokio::select! {
        biased;
        _ = cancelled(&mut shutdown) => {
            SchedulerStats::bump(&stats.cancelled);
            log::debug!("[Scheduler] fetch for {} cancelled", location.id);
            return;
        }
        res = tokio::time::timeout_at(deadline, shared.provider.fetch(&location, deadline)) => res,
    };

    let observation = match fetched {
        Ok(Ok(observation)) => observation,
        Ok(Err(e)) => {
            SchedulerStats::bump(&stats.provider_failures);
            log::warn!("[Scheduler] fetch failed for {}: {}", location.id, e);
            return;
        }
        Err(_) => {
            SchedulerStats::bump(&stats.timeouts);
            log::warn!(
                "[Scheduler] fetch for {} exceeded {:?}",
                location.id,
                shared.per_task_timeout
            );
            return;
        }
    };

    if *shutdown.borrow() {
        SchedulerStats::bump(&stats.cancelled);
        return;
    }

    // Alerts are not gated on persistence.
    if let Some(alert) = shared.evaluator.evaluate(&observation) {
        let sink = &shared.sink;
        match std::panic::catch_unwind(AssertUnwindSafe(|| sink.emit(&alert))) {
            Ok(()) => SchedulerStats::bump(&stats.alerts),
            Err(_) => {
                let _ = shared
                    .fatal_tx
                    .send(format!("alert sink panicked on {} alert", alert.kind));
                return;
            }
        }
    }

    // Not raced against shutdown: a started upsert runs to completion.
    match tokio::time::timeout_at(deadline, shared.store.upsert(observation)).await {
        Ok(Ok(())) => {
            SchedulerStats::bump(&stats.upserts);
            log::debug!("[Scheduler] persisted {}", location.id);
        }
        Ok(Err(StoreError::Conflict(msg))) => {
            SchedulerStats::bump(&stats.upserts);
            log::debug!("[Scheduler] {} superseded: {}", location.id, msg);
        }
        Ok(Err(e)) => {
            SchedulerStats::bump(&stats.store_failures);
            log::error!("[Scheduler] store failed for {}: {}", location.id, e);
        }
        Err(_) => {
            SchedulerStats::bump(&stats.timeouts);
            log::error!(
                "[Scheduler] upsert for {} exceeded {:?}",
                location.id,
                shared.per_task_timeout
            );
        }
    }
}
