// Run Manager
// Public façade: create, start, stop, pause, resume, list

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ForemanConfig;
use crate::error::{ForemanError, Result};
use crate::event_bus::{EventBus, EventKind, EventStream};
use crate::orchestrator::engine::RunEngine;
use crate::orchestrator::planner::{AdapterHealth, Planner};
use crate::orchestrator::store::RunStore;
use crate::orchestrator::types::{Run, RunStatus, SharedRun, WorkerStatus};
use crate::orchestrator::worker::WorkerAgent;

struct RunHandle {
    run: SharedRun,
    /// Re-minted on every start so a prior abort does not leak in
    cancel: Arc<StdMutex<CancellationToken>>,
    engine: StdMutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    fn new(run: Run) -> Arc<Self> {
        Arc::new(Self {
            run: Arc::new(RwLock::new(run)),
            cancel: Arc::new(StdMutex::new(CancellationToken::new())),
            engine: StdMutex::new(None),
        })
    }

    fn fire_abort(&self) {
        match self.cancel.lock() {
            Ok(token) => token.cancel(),
            Err(_) => tracing::error!("Cancel token lock poisoned"),
        }
    }
}

/// Owns the run map and the per-run abort handles. Cheap to clone.
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ForemanConfig,
    store: Arc<RunStore>,
    bus: EventBus,
    planner: Arc<dyn Planner>,
    workers: Arc<dyn WorkerAgent>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl RunManager {
    pub fn new(
        config: ForemanConfig,
        store: RunStore,
        bus: EventBus,
        planner: Arc<dyn Planner>,
        workers: Arc<dyn WorkerAgent>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store: Arc::new(store),
                bus,
                planner,
                workers,
                runs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new run. `max_workers` is clamped to 1..=10 (default 3);
    /// the target directory must already exist.
    pub async fn create(
        &self,
        goal: impl Into<String>,
        target_dir: impl Into<PathBuf>,
        max_workers: Option<usize>,
    ) -> Result<Run> {
        let target_dir = target_dir.into();
        if !target_dir.is_dir() {
            return Err(ForemanError::InvalidOperation(format!(
                "Target directory does not exist: {}",
                target_dir.display()
            )));
        }

        let max_workers = self.inner.config.clamp_max_workers(max_workers);
        let run = Run::new(goal, target_dir, max_workers);
        if let Err(e) = self.inner.store.save(&run) {
            tracing::error!("Failed to persist new run {}: {}", run.id, e);
        }

        let handle = RunHandle::new(run.clone());
        self.inner.runs.write().await.insert(run.id.clone(), handle);
        self.inner
            .bus
            .emit(EventKind::RunCreated, json!(run.to_snapshot()));
        tracing::info!("Created run {} ({} workers max)", run.id, run.max_workers);

        Ok(run)
    }

    /// Start (or restart) the pipeline for an idle or paused run.
    pub async fn start(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        {
            let run = handle.run.read().await;
            if !matches!(run.status, RunStatus::Idle | RunStatus::Paused) {
                return Err(ForemanError::InvalidOperation(
                    "Run can only be started when idle or paused".to_string(),
                ));
            }
        }
        self.launch(&handle, run_id).await;
        Ok(())
    }

    /// Interrupt an actively planning/executing/judging run; the pipeline
    /// rolls in-progress tasks back to pending so resume can retry them.
    pub async fn pause(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        {
            let mut run = handle.run.write().await;
            if !run.status.is_active() {
                return Err(ForemanError::InvalidOperation(
                    "Run is not planning, executing, or judging".to_string(),
                ));
            }
            run.status = RunStatus::Paused;
        }
        handle.fire_abort();
        self.persist_and_emit(&handle).await;
        tracing::info!("Run {} paused", run_id);
        Ok(())
    }

    /// Stop a run from any non-terminal state.
    pub async fn stop(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        {
            let mut run = handle.run.write().await;
            if run.status.is_terminal() {
                return Err(ForemanError::InvalidOperation(
                    "Run is already finished".to_string(),
                ));
            }
            run.status = RunStatus::Stopped;
            run.completed_at = Some(chrono::Utc::now());
        }
        handle.fire_abort();
        self.persist_and_emit(&handle).await;
        tracing::info!("Run {} stopped", run_id);
        Ok(())
    }

    /// Resume a paused run, or reopen a stopped one and resume it.
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let reopened = {
            let mut run = handle.run.write().await;
            match run.status {
                RunStatus::Paused => false,
                RunStatus::Stopped => {
                    run.status = RunStatus::Paused;
                    run.completed_at = None;
                    true
                }
                _ => {
                    return Err(ForemanError::InvalidOperation(
                        "Run is not paused or stopped".to_string(),
                    ))
                }
            }
        };
        if reopened {
            self.persist_and_emit(&handle).await;
        }
        self.launch(&handle, run_id).await;
        tracing::info!("Run {} resumed", run_id);
        Ok(())
    }

    /// Defensive copy of one run.
    pub async fn get(&self, run_id: &str) -> Result<Run> {
        let handle = self.handle(run_id).await?;
        let run = handle.run.read().await;
        Ok(run.clone())
    }

    /// Defensive copies of every run, newest first.
    pub async fn list(&self) -> Vec<Run> {
        let handles: Vec<Arc<RunHandle>> =
            self.inner.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            runs.push(handle.run.read().await.clone());
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Which external providers appear configured.
    pub fn health(&self) -> Vec<AdapterHealth> {
        vec![self.inner.planner.health(), self.inner.workers.health()]
    }

    async fn launch(&self, handle: &Arc<RunHandle>, run_id: &str) {
        // wait out the previous pipeline (it is draining on a cancelled
        // token) so its rollback cannot touch the workers we spawn next
        let previous = match handle.engine.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                tracing::error!("Run {} previous pipeline join error: {}", run_id, e);
            }
        }

        let token = CancellationToken::new();
        match handle.cancel.lock() {
            Ok(mut guard) => *guard = token,
            Err(_) => tracing::error!("Cancel token lock poisoned for run {}", run_id),
        }

        let engine = RunEngine::new(
            run_id.to_string(),
            handle.run.clone(),
            handle.cancel.clone(),
            self.inner.store.clone(),
            self.inner.bus.clone(),
            self.inner.planner.clone(),
            self.inner.workers.clone(),
            self.inner.config.clone(),
        );
        let join = tokio::spawn(async move { engine.run().await });
        match handle.engine.lock() {
            Ok(mut slot) => *slot = Some(join),
            Err(_) => tracing::error!("Engine slot lock poisoned for run {}", run_id),
        }
    }

    async fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>> {
        self.inner
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| ForemanError::NotFound(format!("No run with id {}", run_id)))
    }

    async fn persist_and_emit(&self, handle: &Arc<RunHandle>) {
        let run = handle.run.read().await;
        if let Err(e) = self.inner.store.save(&run) {
            tracing::error!("Failed to persist run {}: {}", run.id, e);
        }
        self.inner
            .bus
            .emit(EventKind::RunUpdated, json!(run.to_snapshot()));
    }

    // ========================================================================
    // Lifecycle support
    // ========================================================================

    /// Register a run restored from disk without emitting creation events.
    pub(crate) async fn adopt(&self, run: Run) {
        let handle = RunHandle::new(run.clone());
        self.inner.runs.write().await.insert(run.id, handle);
    }

    pub(crate) fn store(&self) -> &RunStore {
        &self.inner.store
    }

    pub(crate) fn config(&self) -> &ForemanConfig {
        &self.inner.config
    }

    /// Snapshot every run to disk (autosave ticker body).
    pub async fn persist_all(&self) {
        let handles: Vec<Arc<RunHandle>> =
            self.inner.runs.read().await.values().cloned().collect();
        for handle in handles {
            let run = handle.run.read().await;
            if let Err(e) = self.inner.store.save(&run) {
                tracing::error!("Autosave failed for run {}: {}", run.id, e);
            }
        }
    }

    /// Shutdown path: abort every pipeline, cancel all workers, close out
    /// running worker records, and persist. Run statuses are left alone so
    /// restart reconciliation can resume them.
    pub(crate) async fn suspend_all(&self) {
        let handles: Vec<Arc<RunHandle>> =
            self.inner.runs.read().await.values().cloned().collect();
        for handle in &handles {
            handle.fire_abort();
        }
        self.inner.workers.cancel_all().await;

        let now = chrono::Utc::now();
        for handle in &handles {
            {
                let mut run = handle.run.write().await;
                for worker in run
                    .workers
                    .iter_mut()
                    .filter(|w| w.status == WorkerStatus::Running)
                {
                    worker.status = WorkerStatus::Failed;
                    worker.completed_at = Some(now);
                }
            }
            let run = handle.run.read().await;
            if let Err(e) = self.inner.store.save(&run) {
                tracing::error!("Shutdown persist failed for run {}: {}", run.id, e);
            }
        }
    }
}
