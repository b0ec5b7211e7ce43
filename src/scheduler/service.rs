use chrono::{TimeDelta, Utc};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::db::models::MeasurementResult;
use crate::events::{
    DisableReason, EventBus, EventKind, ListenerId, MonitoringEvent, SpeedTestCompletedPayload,
    SpeedTestFailedPayload, TargetConfigPayload, TargetDisabledPayload, TargetPayload,
    TestFailurePayload, TestSuccessPayload,
};
use crate::probes::{RunOptions, RunnerError, TestRunner};
use crate::scheduler::types::{
    HealthState, HealthStatus, MonitoringTargetConfig, SchedulerError, SchedulerSettings,
    SchedulerStats, TargetConfigUpdate,
};
use crate::utils::panic_message;

const HIGH_FAILURE_RATE: f64 = 0.5;
const FAILING_TARGET_FRACTION: f64 = 0.3;

struct TargetTimer {
    id: u64,
    handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

impl TargetTimer {
    fn cancel(self) {
        if self.shutdown_tx.send(()).is_err() {
            // The loop already exited; make sure the task is gone.
            self.handle.abort();
        }
    }
}

struct ScheduledTarget {
    config: MonitoringTargetConfig,
    timer: Option<TargetTimer>,
    /// Individually paused through `pause_target`.
    paused: bool,
    /// Id of the run currently executing, if any.
    in_flight: Option<u64>,
}

#[derive(Debug, Default)]
struct RunTotals {
    total_runs: u64,
    successful_runs: u64,
    failed_runs: u64,
    total_run_time_ms: u64,
}

struct SchedulerState {
    targets: HashMap<String, ScheduledTarget>,
    running: bool,
    paused: bool,
    started_at: Option<Instant>,
    settings: SchedulerSettings,
    run_slots: Arc<Semaphore>,
    /// Slots to retire as runs finish after the cap was lowered.
    slot_debt: usize,
    totals: RunTotals,
}

impl SchedulerState {
    fn interval_for(&self, config: &MonitoringTargetConfig) -> Duration {
        if config.interval_ms == 0 {
            self.settings.default_interval
        } else {
            Duration::from_millis(config.interval_ms)
        }
    }

    fn max_failures_for(&self, config: &MonitoringTargetConfig) -> u32 {
        config.max_failures.unwrap_or(self.settings.max_failures)
    }

    fn should_be_armed(&self, target: &ScheduledTarget) -> bool {
        self.running && !self.paused && target.config.enabled && !target.paused
    }

    fn is_failed(&self, target: &ScheduledTarget) -> bool {
        target.config.failure_count >= self.max_failures_for(&target.config)
    }
}

struct SchedulerInner {
    runner: Arc<dyn TestRunner>,
    event_bus: Arc<EventBus>,
    state: Mutex<SchedulerState>,
    next_timer_id: AtomicU64,
    next_run_id: AtomicU64,
}

struct PendingRun {
    run_id: u64,
    target_id: String,
    options: RunOptions,
    slots: Arc<Semaphore>,
}

enum TickDecision {
    Run(PendingRun),
    /// The previous run is still executing.
    Skip,
    /// The timer was cancelled or replaced.
    Stop,
}

/// Owns the monitored targets and runs each one on its own timer.
///
/// Cloning is cheap and every clone drives the same scheduler. All
/// operations are synchronous; timers and runs are spawned on the current
/// tokio runtime.
#[derive(Clone)]
pub struct MonitoringScheduler {
    inner: Arc<SchedulerInner>,
}

impl MonitoringScheduler {
    pub fn new(runner: Arc<dyn TestRunner>, event_bus: Arc<EventBus>) -> Self {
        Self::with_settings(runner, event_bus, SchedulerSettings::default())
    }

    pub fn with_settings(
        runner: Arc<dyn TestRunner>,
        event_bus: Arc<EventBus>,
        settings: SchedulerSettings,
    ) -> Self {
        let default_interval = if settings.default_interval.is_zero() {
            SchedulerSettings::default().default_interval
        } else {
            settings.default_interval
        };
        let settings = SchedulerSettings {
            default_interval,
            max_concurrent_tests: settings.max_concurrent_tests.max(1),
            max_failures: settings.max_failures.max(1),
            ..settings
        };
        let state = SchedulerState {
            targets: HashMap::new(),
            running: false,
            paused: false,
            started_at: None,
            run_slots: Arc::new(Semaphore::new(settings.max_concurrent_tests)),
            slot_debt: 0,
            settings,
            totals: RunTotals::default(),
        };
        Self {
            inner: Arc::new(SchedulerInner {
                runner,
                event_bus,
                state: Mutex::new(state),
                next_timer_id: AtomicU64::new(1),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn add_target(&self, config: MonitoringTargetConfig) -> Result<(), SchedulerError> {
        if config.target_id.trim().is_empty() {
            return Err(SchedulerError::InvalidTarget(
                "target id must not be empty".to_string(),
            ));
        }
        let target_id = config.target_id.clone();
        let snapshot = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.targets.contains_key(&target_id) {
                return Err(SchedulerError::DuplicateTarget(target_id));
            }
            state.targets.insert(
                target_id.clone(),
                ScheduledTarget {
                    config,
                    timer: None,
                    paused: false,
                    in_flight: None,
                },
            );
            self.inner.reconcile(state, &target_id, false);
            state.targets.get(&target_id).map(|t| t.config.clone())
        };
        info!(target_id = %target_id, "Monitoring target added");
        if let Some(config) = snapshot {
            self.inner
                .event_bus
                .emit(MonitoringEvent::MonitoringTargetAdded(TargetConfigPayload {
                    target_id,
                    config,
                }));
        }
        Ok(())
    }

    /// Cancels the target's timer and forgets it. A run still in flight
    /// finishes, but its result is discarded.
    pub fn remove_target(&self, target_id: &str) -> bool {
        let removed = self.inner.lock().targets.remove(target_id);
        let Some(mut target) = removed else {
            debug!(target_id, "Remove requested for unknown target");
            return false;
        };
        if let Some(timer) = target.timer.take() {
            timer.cancel();
        }
        info!(target_id, "Monitoring target removed");
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringTargetRemoved(TargetPayload {
                target_id: target_id.to_string(),
            }));
        true
    }

    pub fn update_target_config(
        &self,
        target_id: &str,
        update: TargetConfigUpdate,
    ) -> Result<MonitoringTargetConfig, SchedulerError> {
        let (config, disabled) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let Some(target) = state.targets.get_mut(target_id) else {
                debug!(target_id, "Update requested for unknown target");
                return Err(SchedulerError::TargetNotFound(target_id.to_string()));
            };
            let mut interval_changed = false;
            if let Some(interval_ms) = update.interval_ms {
                interval_changed = interval_ms != target.config.interval_ms;
                target.config.interval_ms = interval_ms;
            }
            if let Some(enabled) = update.enabled {
                target.config.enabled = enabled;
            }
            if let Some(max_failures) = update.max_failures {
                target.config.max_failures = Some(max_failures);
            }
            if let Some(timeout_ms) = update.timeout_ms {
                target.config.timeout_ms = Some(timeout_ms);
            }
            let disabled = self.inner.enforce_failure_threshold(state, target_id);
            self.inner.reconcile(state, target_id, interval_changed);
            let config = state
                .targets
                .get(target_id)
                .map(|t| t.config.clone())
                .ok_or_else(|| SchedulerError::TargetNotFound(target_id.to_string()))?;
            (config, disabled)
        };
        debug!(target_id, interval_ms = config.interval_ms, enabled = config.enabled, "Monitoring target updated");
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringTargetUpdated(TargetConfigPayload {
                target_id: target_id.to_string(),
                config: config.clone(),
            }));
        if let Some(event) = disabled {
            self.inner.event_bus.emit(event);
        }
        Ok(config)
    }

    pub fn start(&self) {
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.running {
                warn!("Monitoring scheduler is already running");
                return;
            }
            state.running = true;
            state.paused = false;
            state.started_at = Some(Instant::now());
            self.inner.reconcile_all(state);
            info!(targets = state.targets.len(), "Monitoring scheduler started");
        }
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringSchedulerStarted {});
    }

    pub fn stop(&self) {
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if !state.running {
                warn!("Monitoring scheduler is not running");
                return;
            }
            state.running = false;
            state.paused = false;
            state.started_at = None;
            self.inner.reconcile_all(state);
            info!("Monitoring scheduler stopped");
        }
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringSchedulerStopped {});
    }

    pub fn pause(&self) {
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if !state.running {
                warn!("Cannot pause: monitoring scheduler is not running");
                return;
            }
            if state.paused {
                debug!("Monitoring scheduler is already paused");
                return;
            }
            state.paused = true;
            self.inner.reconcile_all(state);
            info!("Monitoring scheduler paused");
        }
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringSchedulerPaused {});
    }

    pub fn resume(&self) {
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if !state.running {
                warn!("Cannot resume: monitoring scheduler is not running");
                return;
            }
            if !state.paused {
                debug!("Monitoring scheduler is not paused");
                return;
            }
            state.paused = false;
            self.inner.reconcile_all(state);
            info!("Monitoring scheduler resumed");
        }
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringSchedulerResumed {});
    }

    /// Re-enables a target and clears its failure count.
    pub fn enable_target(&self, target_id: &str) -> bool {
        let updated = self.inner.with_target(target_id, |target| {
            target.config.enabled = true;
            target.config.failure_count = 0;
        });
        if !updated {
            debug!(target_id, "Enable requested for unknown target");
            return false;
        }
        info!(target_id, "Monitoring target enabled");
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringTargetEnabled(TargetPayload {
                target_id: target_id.to_string(),
            }));
        true
    }

    pub fn disable_target(&self, target_id: &str) -> bool {
        let mut failure_count = 0;
        let updated = self.inner.with_target(target_id, |target| {
            target.config.enabled = false;
            failure_count = target.config.failure_count;
        });
        if !updated {
            debug!(target_id, "Disable requested for unknown target");
            return false;
        }
        info!(target_id, "Monitoring target disabled");
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringTargetDisabled(TargetDisabledPayload {
                target_id: target_id.to_string(),
                reason: DisableReason::Manual,
                failure_count,
            }));
        true
    }

    pub fn pause_target(&self, target_id: &str) -> bool {
        if !self.inner.with_target(target_id, |target| target.paused = true) {
            debug!(target_id, "Pause requested for unknown target");
            return false;
        }
        info!(target_id, "Monitoring target paused");
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringTargetPaused(TargetPayload {
                target_id: target_id.to_string(),
            }));
        true
    }

    pub fn resume_target(&self, target_id: &str) -> bool {
        if !self.inner.with_target(target_id, |target| target.paused = false) {
            debug!(target_id, "Resume requested for unknown target");
            return false;
        }
        info!(target_id, "Monitoring target resumed");
        self.inner
            .event_bus
            .emit(MonitoringEvent::MonitoringTargetResumed(TargetPayload {
                target_id: target_id.to_string(),
            }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Whether the target currently has an armed timer.
    pub fn is_target_scheduled(&self, target_id: &str) -> bool {
        self.inner
            .lock()
            .targets
            .get(target_id)
            .is_some_and(|target| target.timer.is_some())
    }

    pub fn get_target_config(&self, target_id: &str) -> Option<MonitoringTargetConfig> {
        self.inner
            .lock()
            .targets
            .get(target_id)
            .map(|target| target.config.clone())
    }

    pub fn get_all_target_configs(&self) -> Vec<MonitoringTargetConfig> {
        self.collect_configs(|_, _| true)
    }

    /// Targets that are enabled and not individually paused.
    pub fn get_active_targets(&self) -> Vec<MonitoringTargetConfig> {
        self.collect_configs(|_, target| target.config.enabled && !target.paused)
    }

    /// Targets whose failure count reached their threshold.
    pub fn get_failed_targets(&self) -> Vec<MonitoringTargetConfig> {
        self.collect_configs(|state, target| state.is_failed(target))
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let state = self.inner.lock();
        let active_targets = state
            .targets
            .values()
            .filter(|target| target.config.enabled && !target.paused)
            .count();
        let paused_targets = state.targets.values().filter(|target| target.paused).count();
        let failed_targets = state
            .targets
            .values()
            .filter(|target| state.is_failed(target))
            .count();
        let totals = &state.totals;
        let average_run_time = if totals.total_runs == 0 {
            0.0
        } else {
            totals.total_run_time_ms as f64 / totals.total_runs as f64
        };
        let uptime = match (state.running, state.started_at) {
            (true, Some(started_at)) => {
                u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
            }
            _ => 0,
        };
        SchedulerStats {
            total_targets: state.targets.len(),
            active_targets,
            paused_targets,
            failed_targets,
            total_runs: totals.total_runs,
            successful_runs: totals.successful_runs,
            failed_runs: totals.failed_runs,
            average_run_time,
            uptime,
            is_running: state.running,
            is_paused: state.paused,
        }
    }

    pub fn is_healthy(&self) -> bool {
        let stats = self.get_stats();
        failure_rate(&stats) < HIGH_FAILURE_RATE
            && failing_fraction(&stats) < FAILING_TARGET_FRACTION
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let stats = self.get_stats();
        let mut issues = Vec::new();

        let rate = failure_rate(&stats);
        if rate >= HIGH_FAILURE_RATE {
            issues.push(format!("High failure rate: {:.1}%", rate * 100.0));
        }
        if failing_fraction(&stats) >= FAILING_TARGET_FRACTION {
            issues.push(format!(
                "Many targets failing: {}/{}",
                stats.failed_targets, stats.total_targets
            ));
        }
        if !stats.is_running {
            issues.push("Scheduler is not running".to_string());
        }
        if stats.is_paused {
            issues.push("Scheduler is paused".to_string());
        }

        let status = match issues.len() {
            0 => HealthState::Healthy,
            1 | 2 => HealthState::Degraded,
            _ => HealthState::Unhealthy,
        };
        HealthStatus {
            status,
            issues,
            last_check: Utc::now(),
        }
    }

    pub fn settings(&self) -> SchedulerSettings {
        self.inner.lock().settings
    }

    /// Changes the interval used by targets with `interval_ms == 0` and
    /// restarts their timers.
    pub fn set_default_interval(&self, interval: Duration) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if interval.is_zero() {
            warn!("Ignoring zero default interval");
            return;
        }
        state.settings.default_interval = interval;
        let affected: Vec<String> = state
            .targets
            .values()
            .filter(|target| target.config.interval_ms == 0)
            .map(|target| target.config.target_id.clone())
            .collect();
        for target_id in affected {
            self.inner.reconcile(state, &target_id, true);
        }
    }

    /// Caps simultaneously executing runs. Lowering the cap while runs hold
    /// slots retires those slots as the runs finish.
    pub fn set_max_concurrent_tests(&self, max: usize) {
        let max = max.max(1);
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let current = state.settings.max_concurrent_tests;
        if max > current {
            let grow = max - current;
            let repaid = grow.min(state.slot_debt);
            state.slot_debt -= repaid;
            state.run_slots.add_permits(grow - repaid);
        } else if max < current {
            let shrink = current - max;
            let forgotten = state.run_slots.forget_permits(shrink);
            state.slot_debt += shrink - forgotten;
        }
        state.settings.max_concurrent_tests = max;
        debug!(max, pending_retirements = state.slot_debt, "Concurrent test cap changed");
    }

    /// Default `max_failures` for targets that do not set their own. Targets
    /// already at the new threshold are disabled.
    pub fn set_failure_threshold(&self, max_failures: u32) {
        let disabled: Vec<MonitoringEvent> = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            state.settings.max_failures = max_failures.max(1);
            let ids: Vec<String> = state.targets.keys().cloned().collect();
            ids.iter()
                .filter_map(|target_id| self.inner.enforce_failure_threshold(state, target_id))
                .collect()
        };
        for event in disabled {
            self.inner.event_bus.emit(event);
        }
    }

    /// Lets the scheduler be driven by `*_REQUESTED` events on its bus.
    ///
    /// Handlers hold a weak reference, so they do not keep the scheduler alive.
    pub fn attach_request_handlers(&self) -> Vec<ListenerId> {
        let bus = &self.inner.event_bus;
        let mut ids = Vec::with_capacity(4);

        let weak = Arc::downgrade(&self.inner);
        ids.push(bus.on(EventKind::MonitoringSchedulerStartRequested, move |_| {
            if let Some(scheduler) = upgrade(&weak) {
                scheduler.start();
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        ids.push(bus.on(EventKind::MonitoringSchedulerStopRequested, move |_| {
            if let Some(scheduler) = upgrade(&weak) {
                scheduler.stop();
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        ids.push(bus.on(EventKind::MonitoringTargetAddRequested, move |event| {
            let MonitoringEvent::MonitoringTargetAddRequested(payload) = event else {
                return;
            };
            if let Some(scheduler) = upgrade(&weak) {
                if let Err(e) = scheduler.add_target(payload.config.clone()) {
                    warn!(target_id = %payload.target_id, error = %e, "Requested target was not added");
                }
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        ids.push(bus.on(EventKind::MonitoringTargetRemoveRequested, move |event| {
            let MonitoringEvent::MonitoringTargetRemoveRequested(payload) = event else {
                return;
            };
            if let Some(scheduler) = upgrade(&weak) {
                scheduler.remove_target(&payload.target_id);
            }
        }));

        ids
    }

    fn collect_configs<F>(&self, predicate: F) -> Vec<MonitoringTargetConfig>
    where
        F: Fn(&SchedulerState, &ScheduledTarget) -> bool,
    {
        let state = self.inner.lock();
        let mut configs: Vec<MonitoringTargetConfig> = state
            .targets
            .values()
            .filter(|target| predicate(&state, target))
            .map(|target| target.config.clone())
            .collect();
        configs.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        configs
    }
}

fn upgrade(weak: &Weak<SchedulerInner>) -> Option<MonitoringScheduler> {
    weak.upgrade().map(|inner| MonitoringScheduler { inner })
}

fn failure_rate(stats: &SchedulerStats) -> f64 {
    if stats.total_runs == 0 {
        0.0
    } else {
        stats.failed_runs as f64 / stats.total_runs as f64
    }
}

fn failing_fraction(stats: &SchedulerStats) -> f64 {
    if stats.total_targets == 0 {
        0.0
    } else {
        stats.failed_targets as f64 / stats.total_targets as f64
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` to a target and brings its timer in line with the new state.
    fn with_target<F>(self: &Arc<Self>, target_id: &str, change: F) -> bool
    where
        F: FnOnce(&mut ScheduledTarget),
    {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(target) = state.targets.get_mut(target_id) else {
            return false;
        };
        change(target);
        self.reconcile(state, target_id, false);
        true
    }

    fn reconcile_all(self: &Arc<Self>, state: &mut SchedulerState) {
        let ids: Vec<String> = state.targets.keys().cloned().collect();
        for target_id in ids {
            self.reconcile(state, &target_id, false);
        }
    }

    /// Arms or cancels the target's timer to match the scheduler and target flags.
    /// `restart` replaces an armed timer so a new interval takes effect.
    fn reconcile(self: &Arc<Self>, state: &mut SchedulerState, target_id: &str, restart: bool) {
        let period = match state.targets.get(target_id) {
            Some(target) => state.interval_for(&target.config),
            None => return,
        };
        let desired = state
            .targets
            .get(target_id)
            .is_some_and(|target| state.should_be_armed(target));
        let Some(target) = state.targets.get_mut(target_id) else {
            return;
        };

        if !desired || restart {
            if let Some(timer) = target.timer.take() {
                timer.cancel();
                debug!(target_id, "Target timer cancelled");
            }
            target.config.next_run = None;
        }
        if desired && target.timer.is_none() {
            self.arm_timer(target, period);
        }
    }

    fn arm_timer(self: &Arc<Self>, target: &mut ScheduledTarget, period: Duration) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(target_id = %target.config.target_id, error = %e, "No tokio runtime available; target not scheduled");
                return;
            }
        };
        let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = runtime.spawn(run_timer(
            Arc::downgrade(self),
            target.config.target_id.clone(),
            timer_id,
            period,
            shutdown_rx,
        ));
        target.config.next_run = next_run_after(period);
        target.timer = Some(TargetTimer {
            id: timer_id,
            handle,
            shutdown_tx,
        });
        debug!(
            target_id = %target.config.target_id,
            interval_ms = period.as_millis() as u64,
            "Target timer armed"
        );
    }

    /// Takes an enabled target out of rotation once its failure count reaches
    /// its threshold. Returns the event to emit after the lock is released.
    fn enforce_failure_threshold(
        &self,
        state: &mut SchedulerState,
        target_id: &str,
    ) -> Option<MonitoringEvent> {
        let max_failures = state
            .targets
            .get(target_id)
            .map(|target| state.max_failures_for(&target.config))?;
        let target = state.targets.get_mut(target_id)?;
        let failure_count = target.config.failure_count;
        if !target.config.enabled || failure_count < max_failures {
            return None;
        }
        target.config.enabled = false;
        target.config.next_run = None;
        if let Some(timer) = target.timer.take() {
            timer.cancel();
        }
        warn!(target_id, failure_count, max_failures, "Target disabled after repeated failures");
        Some(MonitoringEvent::MonitoringTargetDisabled(
            TargetDisabledPayload {
                target_id: target_id.to_string(),
                reason: DisableReason::FailureThreshold,
                failure_count,
            },
        ))
    }

    fn release_slot(&self, permit: Option<OwnedSemaphorePermit>) {
        let Some(permit) = permit else {
            return;
        };
        let mut state = self.lock();
        if state.slot_debt > 0 {
            state.slot_debt -= 1;
            permit.forget();
        }
    }

    fn begin_run(&self, target_id: &str, timer_id: u64) -> TickDecision {
        let mut guard = self.lock();
        let state = &mut *guard;
        let period = match state.targets.get(target_id) {
            Some(target) => state.interval_for(&target.config),
            None => return TickDecision::Stop,
        };
        let default_timeout = state.settings.default_timeout;
        let slots = state.run_slots.clone();
        let Some(target) = state.targets.get_mut(target_id) else {
            return TickDecision::Stop;
        };
        if target.timer.as_ref().map(|timer| timer.id) != Some(timer_id) {
            return TickDecision::Stop;
        }
        if target.in_flight.is_some() {
            debug!(target_id, "Previous run still in flight; skipping tick");
            return TickDecision::Skip;
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        target.in_flight = Some(run_id);
        target.config.last_run = Some(Utc::now());
        target.config.next_run = next_run_after(period);
        let timeout = target
            .config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);

        TickDecision::Run(PendingRun {
            run_id,
            target_id: target_id.to_string(),
            options: RunOptions { timeout },
            slots,
        })
    }

    async fn execute_run(self: Arc<Self>, run: PendingRun) {
        // The semaphore is never closed.
        let permit = run.slots.clone().acquire_owned().await.ok();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.runner.run(&run.target_id, &run.options))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(RunnerError::Panicked(panic_message(payload.as_ref())))
            });
        let duration = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.complete_run(&run, outcome, duration);
        self.release_slot(permit);
    }

    fn complete_run(
        &self,
        run: &PendingRun,
        outcome: Result<MeasurementResult, RunnerError>,
        duration: u64,
    ) {
        let target_id = run.target_id.as_str();
        let mut events = Vec::with_capacity(3);
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(target) = state.targets.get_mut(target_id) else {
                debug!(target_id, "Discarding result for removed target");
                return;
            };
            if target.in_flight != Some(run.run_id) {
                debug!(target_id, "Discarding result from a superseded run");
                return;
            }
            target.in_flight = None;

            let totals = &mut state.totals;
            totals.total_runs += 1;
            totals.total_run_time_ms = totals.total_run_time_ms.saturating_add(duration);

            let failure = match &outcome {
                Ok(result) if result.is_success() => None,
                Ok(result) => Some(
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| "Test reported failure".to_string()),
                ),
                Err(e) => Some(e.to_string()),
            };

            let failed = failure.is_some();
            match failure {
                None => {
                    totals.successful_runs += 1;
                    target.config.failure_count = 0;
                    debug!(target_id, duration, "Monitoring test succeeded");
                    events.push(MonitoringEvent::MonitoringTestSuccess(TestSuccessPayload {
                        target_id: target_id.to_string(),
                        duration,
                    }));
                }
                Some(error) => {
                    totals.failed_runs += 1;
                    target.config.failure_count = target.config.failure_count.saturating_add(1);
                    let failure_count = target.config.failure_count;
                    error!(target_id, failure_count, error = %error, "Monitoring test failed");
                    events.push(MonitoringEvent::MonitoringTestFailure(TestFailurePayload {
                        target_id: target_id.to_string(),
                        error,
                        failure_count,
                        duration,
                    }));
                }
            }

            let disabled = if failed {
                self.enforce_failure_threshold(state, target_id)
            } else {
                None
            };

            events.push(match outcome {
                Ok(result) => MonitoringEvent::SpeedTestCompleted(SpeedTestCompletedPayload {
                    target_id: target_id.to_string(),
                    result,
                }),
                Err(e) => MonitoringEvent::SpeedTestFailed(SpeedTestFailedPayload {
                    target_id: target_id.to_string(),
                    error: e.to_string(),
                }),
            });
            events.extend(disabled);
        }

        for event in events {
            self.event_bus.emit(event);
        }
    }
}

fn next_run_after(period: Duration) -> Option<chrono::DateTime<Utc>> {
    TimeDelta::from_std(period)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
}

async fn run_timer(
    inner: Weak<SchedulerInner>,
    target_id: String,
    timer_id: u64,
    period: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!(target_id = %target_id, "Target timer received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match inner.begin_run(&target_id, timer_id) {
                    TickDecision::Run(run) => {
                        tokio::spawn(inner.execute_run(run));
                    }
                    TickDecision::Skip => {}
                    TickDecision::Stop => break,
                }
            }
        }
    }
}
