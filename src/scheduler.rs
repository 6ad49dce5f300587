use crate::checker::{self, CheckContext};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::Service;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_checks: usize,
    pub shutdown_grace: Duration,
    pub reconcile_interval: Duration,
    /// Upper bound on the random delay before a service's first check.
    pub max_stagger: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        SchedulerSettings {
            max_concurrent_checks: config.max_concurrent_checks,
            shutdown_grace: config.shutdown_grace,
            reconcile_interval: config.reconcile_interval,
            max_stagger: config.max_stagger,
        }
    }
}

/// Per-service timer task.
struct ServiceTask {
    interval: u32,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub started: usize,
    pub stopped: usize,
    pub restarted: usize,
    pub running: usize,
}

/// Owns one timer task per active service and a shared pool of check slots.
pub struct Scheduler {
    ctx: Arc<CheckContext>,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, ServiceTask>>,
    /// Held for the duration of a check; outlives task restarts.
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Stopped timers whose last check may still be running.
    draining: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown: watch::Sender<bool>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<CheckContext>, settings: SchedulerSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Scheduler {
            permits: Arc::new(Semaphore::new(settings.max_concurrent_checks.max(1))),
            ctx,
            settings,
            tasks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            draining: Mutex::new(Vec::new()),
            shutdown,
            reconciler: Mutex::new(None),
        }
    }

    /// Schedule every active service and start the periodic reconcile loop.
    /// A storage failure here is fatal to the caller.
    pub fn start(self: &Arc<Self>) -> Result<usize> {
        if *self.shutdown.borrow() {
            return Err(Error::scheduler("scheduler already shut down"));
        }
        let summary = self.reconcile()?;
        info!(services = summary.running, "scheduler started");

        let this = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(this.settings.reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                match this.reconcile() {
                    Ok(s) if s.started + s.stopped + s.restarted > 0 => {
                        info!(started = s.started, stopped = s.stopped, restarted = s.restarted, "schedule reconciled");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("schedule reconcile failed: {}", e),
                }
            }
        });
        *lock(&self.reconciler) = Some(handle);
        Ok(summary.running)
    }

    /// Bring running timers in line with the stored set of active services:
    /// start new ones, stop removed or paused ones, restart changed intervals.
    pub fn reconcile(&self) -> Result<ReconcileSummary> {
        if *self.shutdown.borrow() {
            return Ok(ReconcileSummary::default());
        }
        let services = self.ctx.db.get_active_services()?;
        let mut summary = ReconcileSummary::default();
        let mut tasks = lock(&self.tasks);

        let wanted: HashMap<&str, &Service> = services.iter().map(|s| (s.id.as_str(), s)).collect();
        let stale: Vec<String> = tasks
            .keys()
            .filter(|id| !wanted.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(task) = tasks.remove(&id) {
                self.retire(&id, task);
                summary.stopped += 1;
            }
        }

        for service in &services {
            match tasks.get(&service.id) {
                Some(task) if task.interval == service.check_interval && !task.handle.is_finished() => {}
                Some(_) => {
                    if let Some(task) = tasks.remove(&service.id) {
                        self.retire(&service.id, task);
                    }
                    tasks.insert(service.id.clone(), self.spawn_task(service));
                    summary.restarted += 1;
                }
                None => {
                    tasks.insert(service.id.clone(), self.spawn_task(service));
                    summary.started += 1;
                }
            }
        }

        // a guard still shared with an exiting task keeps its entry so a
        // restarted timer waits on the same lock
        lock(&self.in_flight).retain(|id, guard| tasks.contains_key(id) || Arc::strong_count(guard) > 1);
        summary.running = tasks.len();
        Ok(summary)
    }

    /// Start (or restart) the timer for one service. Returns false when the
    /// service is not schedulable.
    pub fn schedule(&self, service: &Service) -> bool {
        if !service.is_active || service.is_deleted || *self.shutdown.borrow() {
            return false;
        }
        let mut tasks = lock(&self.tasks);
        if let Some(task) = tasks.remove(&service.id) {
            self.retire(&service.id, task);
        }
        tasks.insert(service.id.clone(), self.spawn_task(service));
        true
    }

    /// Stop a service's timer. A check already running is allowed to finish,
    /// bounded by [`Scheduler::shutdown`].
    pub fn unschedule(&self, service_id: &str) -> bool {
        match lock(&self.tasks).remove(service_id) {
            Some(task) => {
                self.retire(service_id, task);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, service_id: &str) -> bool {
        lock(&self.tasks).contains_key(service_id)
    }

    pub fn scheduled_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Stop all timers, then wait up to the grace period for running checks.
    /// Checks still running after that are abandoned.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = lock(&self.reconciler).take() {
            handle.abort();
        }

        let mut handles: Vec<(String, JoinHandle<()>)> = lock(&self.tasks)
            .drain()
            .map(|(id, task)| {
                let _ = task.stop.send(true);
                (id, task.handle)
            })
            .collect();
        handles.append(&mut lock(&self.draining));

        let deadline = Instant::now() + self.settings.shutdown_grace;
        let mut abandoned = 0;
        for (id, mut handle) in handles {
            if time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(service_id = %id, "check still running at shutdown deadline; abandoning");
                handle.abort();
                abandoned += 1;
            }
        }
        self.permits.close();
        info!(abandoned, "scheduler stopped");
    }

    /// Signal a timer to stop and keep its handle until it has exited.
    fn retire(&self, service_id: &str, task: ServiceTask) {
        let _ = task.stop.send(true);
        debug!(service_id = %service_id, "timer stopped");
        let mut draining = lock(&self.draining);
        draining.retain(|(_, handle)| !handle.is_finished());
        if !task.handle.is_finished() {
            draining.push((service_id.to_string(), task.handle));
        }
    }

    fn spawn_task(&self, service: &Service) -> ServiceTask {
        let (stop, stop_rx) = watch::channel(false);
        let guard = lock(&self.in_flight)
            .entry(service.id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let stagger = stagger_delay(self.settings.max_stagger, service.check_interval);
        let handle = tokio::spawn(service_loop(
            self.ctx.clone(),
            self.permits.clone(),
            guard,
            service.id.clone(),
            service.check_interval,
            stagger,
            stop_rx,
        ));
        debug!(service_id = %service.id, interval = service.check_interval, stagger_ms = stagger.as_millis() as u64, "timer started");
        ServiceTask {
            interval: service.check_interval,
            stop,
            handle,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stagger_delay(max_stagger: Duration, interval_secs: u32) -> Duration {
    let cap = max_stagger.min(Duration::from_secs(u64::from(interval_secs))).as_millis() as u64;
    if cap == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}

/// Ticks to skip after `failures` consecutive storage errors: 0, 1, 3, 7, 7, ...
pub fn persistence_backoff_ticks(failures: u32) -> u32 {
    if failures == 0 {
        return 0;
    }
    2u32.saturating_pow(failures - 1).min(8) - 1
}

#[derive(Debug, Default)]
struct PersistenceBackoff {
    failures: u32,
    skip_remaining: u32,
}

impl PersistenceBackoff {
    fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.skip_remaining = persistence_backoff_ticks(self.failures);
        self.skip_remaining
    }

    fn should_skip(&mut self) -> bool {
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.skip_remaining = 0;
    }
}

async fn service_loop(
    ctx: Arc<CheckContext>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AsyncMutex<()>>,
    service_id: String,
    interval_secs: u32,
    stagger: Duration,
    mut stop: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = time::sleep(stagger) => {}
        _ = stop.changed() => return,
    }

    let period = Duration::from_secs(u64::from(interval_secs.max(1)));
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut backoff = PersistenceBackoff::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }
        if backoff.should_skip() {
            debug!(service_id = %service_id, "skipping tick after storage failure");
            continue;
        }

        let _running = match in_flight.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(service_id = %service_id, "previous check still running; skipping tick");
                continue;
            }
        };
        let _permit = tokio::select! {
            permit = time::timeout(period, permits.clone().acquire_owned()) => match permit {
                Ok(Ok(p)) => p,
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(service_id = %service_id, "no check slot free within one interval; skipping tick");
                    continue;
                }
            },
            _ = stop.changed() => break,
        };

        match checker::run_check(&ctx, &service_id).await {
            Ok(report) => {
                backoff.reset();
                debug!(service_id = %service_id, status = %report.evaluation.status, "tick done");
            }
            Err(Error::NotFound(_)) => {
                info!(service_id = %service_id, "service no longer active; timer exiting");
                break;
            }
            Err(e) if e.is_persistence() => {
                let skip = backoff.record_failure();
                error!(service_id = %service_id, skip_ticks = skip, "{}", e);
            }
            Err(e) => warn!(service_id = %service_id, "check failed: {}", e),
        }
    }
}
