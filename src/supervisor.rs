//! Keeps one running [`StationWorker`] per active monitoring configuration.
//!
//! Reconciliation runs once on start, then every `reconcile_interval`, and
//! again whenever [`Supervisor::notify_config_changed`] is called. Workers are
//! keyed by configuration id, so editing a configuration's display fields
//! never restarts its worker.
//!
//! ```text
//!   Stopped ──start()──► Running ──stop()──► Stopped
//!                          │
//!            root CancellationToken
//!              ├── worker stop token (child)  ─► StationWorker::run
//!              ├── worker stop token (child)  ─► StationWorker::run
//!              └── reconcile loop
//! ```

use crate::source::{ArrivalSink, ArrivalSource, ConfigSource, LocationSource};
use crate::tracker::TrackerPolicy;
use crate::types::MonitoringConfig;
use crate::worker::{StationWorker, WorkerSettings};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("collector is already running")]
    AlreadyRunning,
}

/// Everything a worker needs besides its own configuration.
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub worker: WorkerSettings,
    pub policy: TrackerPolicy,
    pub reconcile_interval: Duration,
}

#[derive(Clone)]
pub struct Collaborators {
    pub configs: Arc<dyn ConfigSource>,
    pub arrivals: Arc<dyn ArrivalSource>,
    pub locations: Arc<dyn LocationSource>,
    pub sink: Arc<dyn ArrivalSink>,
}

/// Worker starts and stops made by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<i64>,
    pub stopped: Vec<i64>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

struct WorkerHandle {
    config: MonitoringConfig,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct RunScope {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

struct Inner {
    collaborators: Collaborators,
    settings: CollectorSettings,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
    run: Mutex<Option<RunScope>>,
    changed: Notify,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(collaborators: Collaborators, settings: CollectorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                collaborators,
                settings,
                workers: Mutex::new(HashMap::new()),
                run: Mutex::new(None),
                changed: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    pub fn running_workers(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.workers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Starts the collector: reconciles once, then keeps reconciling in the background.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let (shutdown, tasks) = {
            let mut run = self.inner.run.lock();
            if run.is_some() {
                return Err(SupervisorError::AlreadyRunning);
            }
            let scope = RunScope {
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            };
            let handles = (scope.shutdown.clone(), scope.tasks.clone());
            *run = Some(scope);
            handles
        };

        info!("Starting data collector");
        self.inner.reconcile().await;

        let inner = self.inner.clone();
        tasks.spawn(reconcile_loop(inner, shutdown));
        Ok(())
    }

    /// Cancels every worker and waits until all of them have exited.
    pub async fn stop(&self) {
        let Some(scope) = self.inner.run.lock().take() else {
            return;
        };
        info!("Stopping data collector");
        scope.shutdown.cancel();

        let handles: Vec<WorkerHandle> = self
            .inner
            .workers
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            handle.stop.cancel();
            if let Err(e) = handle.task.await {
                warn!(config_id = handle.config.id, error = %e, "Worker task failed");
            }
        }

        // Workers stopped earlier by reconciliation may still be winding down.
        scope.tasks.close();
        scope.tasks.wait().await;
        info!("Data collector stopped");
    }

    pub fn notify_config_changed(&self) {
        if self.is_running() {
            self.inner.changed.notify_one();
        }
    }

    /// Runs one reconciliation pass now. Returns `None` when the collector is
    /// stopped or the configuration list could not be loaded.
    pub async fn reconcile(&self) -> Option<ReconcileReport> {
        self.inner.reconcile().await
    }
}

impl Inner {
    async fn reconcile(&self) -> Option<ReconcileReport> {
        let (shutdown, tasks) = {
            let run = self.run.lock();
            let scope = run.as_ref()?;
            (scope.shutdown.clone(), scope.tasks.clone())
        };

        let configs = match self.collaborators.configs.list_active().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "Error loading configs, keeping current workers");
                return None;
            }
        };

        let active: HashSet<i64> = configs
            .iter()
            .filter(|cfg| cfg.is_active)
            .map(|cfg| cfg.id)
            .collect();

        let mut workers = self.workers.lock();
        if shutdown.is_cancelled() {
            return None;
        }

        let mut report = ReconcileReport::default();

        workers.retain(|id, handle| {
            if active.contains(id) {
                return true;
            }
            info!(
                config_id = id,
                station = %handle.config.station_name,
                "Stopping collector for deleted/inactive config"
            );
            handle.stop.cancel();
            report.stopped.push(*id);
            false
        });

        for cfg in configs.into_iter().filter(|cfg| cfg.is_active) {
            if workers.contains_key(&cfg.id) {
                continue;
            }
            info!(
                config_id = cfg.id,
                route_id = %cfg.route_id,
                route = %cfg.route_name,
                station_id = %cfg.station_id,
                station = %cfg.station_name,
                "Starting new collector"
            );

            let stop = shutdown.child_token();
            let worker = StationWorker::new(
                cfg.clone(),
                self.settings.worker.clone(),
                self.settings.policy.clone(),
                self.collaborators.arrivals.clone(),
                self.collaborators.locations.clone(),
                self.collaborators.sink.clone(),
            );
            let task = tasks.spawn(worker.run(stop.clone()));
            report.started.push(cfg.id);
            workers.insert(
                cfg.id,
                WorkerHandle {
                    config: cfg,
                    stop,
                    task,
                },
            );
        }

        report.stopped.sort_unstable();
        if report.is_noop() {
            debug!(active = workers.len(), "Collectors already in sync");
        } else {
            info!(
                active = workers.len(),
                started = report.started.len(),
                stopped = report.stopped.len(),
                "Synced collectors"
            );
        }
        Some(report)
    }
}

async fn reconcile_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    let period = inner.settings.reconcile_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = inner.changed.notified() => debug!("Configuration change notified"),
        }
        inner.reconcile().await;
    }
}
