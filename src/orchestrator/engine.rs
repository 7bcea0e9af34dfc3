// Run Engine
// Per-run pipeline: plan -> spawn workers -> judge completions -> quiesce

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ForemanConfig;
use crate::error::{ForemanError, Result};
use crate::event_bus::{EventBus, EventKind};
use crate::orchestrator::planner::{resolve_depends_on, Planner, Verdict};
use crate::orchestrator::scheduler::TaskGraph;
use crate::orchestrator::store::RunStore;
use crate::orchestrator::types::{
    Judgement, RunStatus, SharedRun, Task, TaskStatus, WorkerRecord, WorkerStatus,
    DEFAULT_TASK_PRIORITY,
};
use crate::orchestrator::worker::{WorkerAgent, WorkerSpec};
use crate::summary::summarize_activity;

const BLOCKED_BY_FAILED_DEPS: &str = "Blocked by failed dependencies";

/// Drives one run from start (or resume) to a terminal or interrupted
/// state. Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct RunEngine {
    run_id: String,
    run: SharedRun,
    cancel: Arc<StdMutex<CancellationToken>>,
    store: Arc<RunStore>,
    bus: EventBus,
    planner: Arc<dyn Planner>,
    workers: Arc<dyn WorkerAgent>,
    /// Tasks awaiting judgement, in completion order
    judge_queue: Arc<StdMutex<VecDeque<String>>>,
    /// Claimed by the single judge-queue consumer
    judging: Arc<AtomicBool>,
    config: ForemanConfig,
}

impl RunEngine {
    pub fn new(
        run_id: String,
        run: SharedRun,
        cancel: Arc<StdMutex<CancellationToken>>,
        store: Arc<RunStore>,
        bus: EventBus,
        planner: Arc<dyn Planner>,
        workers: Arc<dyn WorkerAgent>,
        config: ForemanConfig,
    ) -> Self {
        Self {
            run_id,
            run,
            cancel,
            store,
            bus,
            planner,
            workers,
            judge_queue: Arc::new(StdMutex::new(VecDeque::new())),
            judging: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Entry point for the spawned pipeline task.
    pub async fn run(&self) {
        let cancel = self.cancel_token();
        if let Err(e) = self.drive(&cancel).await {
            tracing::error!("Run {} pipeline error: {}", self.run_id, e);
        }
    }

    async fn drive(&self, cancel: &CancellationToken) -> Result<()> {
        let needs_plan = {
            let run = self.run.read().await;
            !run.tasks.iter().any(|t| t.status == TaskStatus::Pending)
        };

        if needs_plan {
            match self.run_planning_phase(cancel).await {
                Ok(true) => {}
                // aborted mid-planning; the interrupted status is already persisted
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.handle_plan_failure(&e).await;
                    return Err(e);
                }
            }
        } else {
            self.log("Resuming with existing pending tasks; skipping planning");
        }

        self.run_execution_loop(cancel).await
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Returns `Ok(false)` when the planning call was aborted.
    async fn run_planning_phase(&self, cancel: &CancellationToken) -> Result<bool> {
        {
            let mut run = self.run.write().await;
            run.status = RunStatus::Planning;
        }
        self.persist_and_emit_run(EventKind::RunUpdated).await;
        self.log("Planning started");

        let snapshot = { self.run.read().await.clone() };
        let plan = tokio::select! {
            outcome = self.planner.plan(&snapshot) => outcome?,
            _ = cancel.cancelled() => {
                tracing::info!("Run {} planning aborted", self.run_id);
                return Ok(false);
            }
        };

        // Mint identifiers first, then resolve dependency titles within the
        // freshly returned set.
        let mut minted: Vec<Task> = plan
            .tasks
            .iter()
            .map(|spec| {
                Task::new(
                    &spec.title,
                    &spec.description,
                    spec.priority.unwrap_or(DEFAULT_TASK_PRIORITY),
                )
            })
            .collect();
        let resolved: Vec<Vec<String>> = plan
            .tasks
            .iter()
            .map(|spec| resolve_depends_on(&minted, &spec.depends_on))
            .collect();
        for (task, deps) in minted.iter_mut().zip(resolved) {
            task.depends_on = deps;
        }
        if let Some(cycle) = TaskGraph::detect_cycle(&minted) {
            tracing::warn!(
                "Run {} plan contains a dependency cycle: {}",
                self.run_id,
                cycle.join(" -> ")
            );
        }

        let task_count = minted.len();
        {
            let mut run = self.run.write().await;
            run.analysis = plan.analysis;
            run.tasks.extend(minted);
        }
        self.persist_and_emit_run(EventKind::RunUpdated).await;
        self.log(format!("Planner produced {} tasks", task_count));

        Ok(true)
    }

    async fn handle_plan_failure(&self, error: &ForemanError) {
        {
            let mut run = self.run.write().await;
            run.status = RunStatus::Failed;
            run.completed_at = Some(chrono::Utc::now());
            run.error = Some(error.to_string());
        }
        self.persist().await;
        self.bus
            .emit(EventKind::RunFailed, self.snapshot_payload().await);
        tracing::error!("Run {} failed during planning: {}", self.run_id, error);
    }

    // ========================================================================
    // Execution Loop
    // ========================================================================

    async fn run_execution_loop(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut run = self.run.write().await;
            run.status = RunStatus::Executing;
        }
        self.persist_and_emit_run(EventKind::RunUpdated).await;

        let mut in_flight: JoinSet<String> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            {
                // the judge completes the run directly when nothing is left running
                let run = self.run.read().await;
                if run.status == RunStatus::Completed {
                    break;
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                match joined {
                    Ok(task_id) => self.on_worker_done(&task_id).await,
                    Err(e) => tracing::error!("Run {} worker join error: {}", self.run_id, e),
                }
            }

            let spawned = self.spawn_ready_tasks(&mut in_flight, cancel).await;

            if in_flight.is_empty() && !spawned {
                let no_pending = self.cancel_dead_ends().await;
                if no_pending && !self.judging.load(Ordering::SeqCst) && self.queue_is_empty() {
                    // a judge that went idle since the dead-end pass may have
                    // spawned tasks; quiescence holds only if none appeared
                    let still_none = {
                        let run = self.run.read().await;
                        !run.tasks.iter().any(|t| t.status == TaskStatus::Pending)
                    };
                    if still_none {
                        break;
                    }
                }
            }

            if !in_flight.is_empty() {
                tokio::select! {
                    joined = in_flight.join_next() => {
                        if let Some(joined) = joined {
                            match joined {
                                Ok(task_id) => self.on_worker_done(&task_id).await,
                                Err(e) => tracing::error!(
                                    "Run {} worker join error: {}",
                                    self.run_id,
                                    e
                                ),
                            }
                        }
                    }
                    _ = cancel.cancelled() => {}
                }
            } else {
                // nothing running; wait for the judge to finish or spawn work
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_poll()) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        self.finalize(&mut in_flight, cancel).await;
        Ok(())
    }

    /// Claim ready tasks up to the worker cap and launch them. Returns
    /// whether anything was spawned.
    async fn spawn_ready_tasks(
        &self,
        in_flight: &mut JoinSet<String>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut spawned = false;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let claimed = {
                let mut run = self.run.write().await;
                let running = run
                    .workers
                    .iter()
                    .filter(|w| w.status == WorkerStatus::Running)
                    .count();
                if running >= run.max_workers {
                    None
                } else if let Some(task_id) =
                    TaskGraph::ready(&run.tasks).first().map(|t| t.id.clone())
                {
                    let worker_id = Uuid::new_v4().to_string();
                    let target_dir = run.target_dir.clone();
                    match run.task_mut(&task_id) {
                        Some(task) => {
                            task.status = TaskStatus::InProgress;
                            task.started_at = Some(chrono::Utc::now());
                            task.worker_id = Some(worker_id.clone());
                            let task_snapshot = task.clone();
                            run.workers.push(WorkerRecord::started(&worker_id, &task_id));
                            Some((task_snapshot, worker_id, target_dir))
                        }
                        None => None,
                    }
                } else {
                    None
                }
            };

            let Some((task, worker_id, target_dir)) = claimed else {
                break;
            };

            self.bus.emit(EventKind::TaskUpdated, json!(task));
            self.bus.emit(
                EventKind::WorkerCreated,
                json!({ "run_id": self.run_id, "worker_id": worker_id, "task_id": task.id }),
            );

            let spec = WorkerSpec {
                run: self.run.clone(),
                worker_id: worker_id.clone(),
                task_id: task.id.clone(),
                target_dir,
                bus: self.bus.clone(),
            };
            match self.workers.spawn(spec).await {
                Ok(done) => {
                    let task_id = task.id.clone();
                    in_flight.spawn(async move {
                        done.await;
                        task_id
                    });
                    spawned = true;
                }
                Err(e) => {
                    tracing::error!(
                        "Run {} failed to spawn worker for task {}: {}",
                        self.run_id,
                        task.id,
                        e
                    );
                    self.mark_spawn_failure(&task.id, &worker_id, &e.to_string())
                        .await;
                    // the failure is still judged so the judge can react
                    self.enqueue_judgement(&task.id);
                }
            }
            self.persist_and_emit_run(EventKind::RunUpdated).await;
        }
        spawned
    }

    /// Completion continuation for one settled worker.
    async fn on_worker_done(&self, task_id: &str) {
        let task = { self.run.read().await.task(task_id).cloned() };
        if let Some(task) = task {
            self.bus.emit(EventKind::TaskUpdated, json!(task));
        }
        self.enqueue_judgement(task_id);
        self.persist_and_emit_run(EventKind::RunUpdated).await;
    }

    /// Cancels pending tasks that can no longer run. Returns true when no
    /// pending tasks remain at all (the quiescence precondition).
    async fn cancel_dead_ends(&self) -> bool {
        let mut cancelled: Vec<Task> = Vec::new();
        let no_pending;
        {
            let mut run = self.run.write().await;

            // chains behind a failure collapse one link per pass
            loop {
                let blocked = TaskGraph::blocked_by_failure(&run.tasks);
                if blocked.is_empty() {
                    break;
                }
                for task_id in blocked {
                    cancel_task(&mut run.tasks, &task_id, BLOCKED_BY_FAILED_DEPS, &mut cancelled);
                }
            }

            // with nothing running or ready, a surviving pending task is
            // stuck behind a dependency cycle
            if TaskGraph::ready(&run.tasks).is_empty() {
                for task_id in TaskGraph::doomed(&run.tasks) {
                    cancel_task(
                        &mut run.tasks,
                        &task_id,
                        "Unsatisfiable dependencies",
                        &mut cancelled,
                    );
                }
            }

            no_pending = !run.tasks.iter().any(|t| t.status == TaskStatus::Pending);
        }

        for task in &cancelled {
            self.bus.emit(EventKind::TaskUpdated, json!(task));
        }
        if !cancelled.is_empty() {
            self.log(format!("Cancelled {} unrunnable tasks", cancelled.len()));
            self.persist().await;
        }
        no_pending
    }

    // ========================================================================
    // Judge Queue
    // ========================================================================

    fn enqueue_judgement(&self, task_id: &str) {
        if let Ok(mut queue) = self.judge_queue.lock() {
            queue.push_back(task_id.to_string());
        } else {
            tracing::error!("Run {} judge queue lock poisoned", self.run_id);
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.process_judge_queue().await });
    }

    /// Single-consumer drain of the judge queue. Re-entrant callers bounce
    /// off the `judging` flag; the active drainer picks up anything they
    /// enqueued.
    async fn process_judge_queue(&self) {
        loop {
            if self
                .judging
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            let cancel = self.cancel_token();
            while !cancel.is_cancelled() {
                let Some(task_id) = self.pop_queue() else {
                    break;
                };
                self.judge_one(&task_id, &cancel).await;

                // revert judging -> executing only once the queue has drained,
                // so back-to-back judgements do not flap the status
                if self.queue_is_empty() {
                    let reverted = {
                        let mut run = self.run.write().await;
                        if run.status == RunStatus::Judging {
                            run.status = RunStatus::Executing;
                            true
                        } else {
                            false
                        }
                    };
                    if reverted {
                        self.persist_and_emit_run(EventKind::RunUpdated).await;
                    }
                }
            }

            self.judging.store(false, Ordering::SeqCst);
            // a producer may have enqueued between the pop and the release;
            // reclaim the flag instead of losing the wakeup
            if cancel.is_cancelled() || self.queue_is_empty() {
                return;
            }
        }
    }

    async fn judge_one(&self, task_id: &str, cancel: &CancellationToken) {
        let flipped = {
            let mut run = self.run.write().await;
            if run.status == RunStatus::Executing {
                run.status = RunStatus::Judging;
                true
            } else {
                false
            }
        };
        if flipped {
            self.persist_and_emit_run(EventKind::RunUpdated).await;
        }

        let (snapshot, task, digest) = {
            let run = self.run.read().await;
            let Some(task) = run.task(task_id).cloned() else {
                tracing::error!("Run {} judge queue held unknown task {}", self.run_id, task_id);
                return;
            };
            let digest = task
                .worker_id
                .as_deref()
                .and_then(|id| run.workers.iter().find(|w| w.id == id))
                .map(summarize_activity)
                .unwrap_or_else(|| "No recorded activity".to_string());
            (run.clone(), task, digest)
        };
        self.log(format!("Judging task '{}'", task.title));

        let outcome = tokio::select! {
            outcome = self.planner.judge(&snapshot, &task, &digest) => outcome,
            _ = cancel.cancelled() => return,
        };
        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(
                    "Run {} judge failed for task {}: {}",
                    self.run_id,
                    task_id,
                    e
                );
                Verdict {
                    assessment: format!("Judge error: {}", e),
                    goal_complete: false,
                    new_tasks: Vec::new(),
                }
            }
        };

        self.apply_verdict(task_id, verdict).await;
    }

    async fn apply_verdict(&self, task_id: &str, verdict: Verdict) {
        let mut spawned_tasks: Vec<Task> = Vec::new();
        let mut cancelled_tasks: Vec<Task> = Vec::new();
        let judgement;
        let run_completed;
        {
            let mut run = self.run.write().await;
            let judgement_id = Uuid::new_v4().to_string();

            let mut new_task_ids = Vec::with_capacity(verdict.new_tasks.len());
            for spec in &verdict.new_tasks {
                let mut task = Task::new(
                    &spec.title,
                    &spec.description,
                    spec.priority.unwrap_or(DEFAULT_TASK_PRIORITY),
                );
                task.spawned_by = Some(judgement_id.clone());
                task.depends_on = resolve_depends_on(&run.tasks, &spec.depends_on);
                new_task_ids.push(task.id.clone());
                spawned_tasks.push(task.clone());
                run.tasks.push(task);
            }

            judgement = Judgement {
                id: judgement_id,
                task_id: task_id.to_string(),
                assessment: verdict.assessment.clone(),
                new_task_ids,
                goal_complete: verdict.goal_complete,
                created_at: chrono::Utc::now(),
            };
            run.judgements.push(judgement.clone());

            if verdict.goal_complete {
                let now = chrono::Utc::now();
                for task in run
                    .tasks
                    .iter_mut()
                    .filter(|t| t.status == TaskStatus::Pending)
                {
                    task.status = TaskStatus::Cancelled;
                    task.error = Some("Goal already complete".to_string());
                    task.completed_at = Some(now);
                    cancelled_tasks.push(task.clone());
                }
                let still_running = run
                    .tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::InProgress);
                if !still_running && !run.status.is_terminal() {
                    run.status = RunStatus::Completed;
                    run.completed_at = Some(now);
                    run_completed = true;
                } else {
                    run_completed = false;
                }
            } else {
                run_completed = false;
            }
        }

        for task in &spawned_tasks {
            self.bus.emit(EventKind::TaskUpdated, json!(task));
        }
        for task in &cancelled_tasks {
            self.bus.emit(EventKind::TaskUpdated, json!(task));
        }
        self.bus.emit(EventKind::JudgementCreated, json!(judgement));
        self.log(format!("Judgement: {}", judgement.assessment));
        self.persist().await;

        if run_completed {
            self.bus
                .emit(EventKind::RunCompleted, self.snapshot_payload().await);
            self.log("Goal complete; run finished");
        } else if verdict.goal_complete {
            self.log("Goal marked complete; waiting for running tasks to finish");
        }
    }

    // ========================================================================
    // Finalization and Abort
    // ========================================================================

    async fn finalize(&self, in_flight: &mut JoinSet<String>, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            self.abort_in_flight(in_flight).await;
            return;
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok(task_id) => self.on_worker_done(&task_id).await,
                Err(e) => tracing::error!("Run {} worker join error: {}", self.run_id, e),
            }
        }

        loop {
            if cancel.is_cancelled() {
                self.abort_in_flight(in_flight).await;
                return;
            }
            if !self.judging.load(Ordering::SeqCst) && self.queue_is_empty() {
                break;
            }
            tokio::time::sleep(self.config.judge_poll()).await;
        }

        let completed = {
            let mut run = self.run.write().await;
            if run.status.is_terminal() {
                false
            } else {
                run.status = RunStatus::Completed;
                run.completed_at = Some(chrono::Utc::now());
                true
            }
        };
        if completed {
            self.persist().await;
            self.bus
                .emit(EventKind::RunCompleted, self.snapshot_payload().await);
            self.log("Run completed");
        }
    }

    /// Abort path: cancel workers, drop queued judgements, roll interrupted
    /// tasks back to pending. The interrupted status (paused or stopped)
    /// was set by whoever fired the abort.
    async fn abort_in_flight(&self, in_flight: &mut JoinSet<String>) {
        let running = { self.run.read().await.running_worker_ids() };
        if !running.is_empty() {
            self.workers.cancel(&running).await;
        }
        while let Some(joined) = in_flight.join_next().await {
            // settled tasks are not enqueued for judgement once the abort fired
            if let Err(e) = joined {
                tracing::error!(
                    "Run {} worker join error during abort: {}",
                    self.run_id,
                    e
                );
            }
        }

        if let Ok(mut queue) = self.judge_queue.lock() {
            queue.clear();
        }
        while self.judging.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.judge_poll()).await;
        }

        let rolled_back = {
            let mut run = self.run.write().await;
            let now = chrono::Utc::now();
            for worker in run
                .workers
                .iter_mut()
                .filter(|w| w.status == WorkerStatus::Running)
            {
                worker.status = WorkerStatus::Failed;
                worker.completed_at = Some(now);
            }
            let mut rolled = Vec::new();
            for task in run
                .tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::InProgress)
            {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.worker_id = None;
                rolled.push(task.clone());
            }
            rolled
        };

        for task in &rolled_back {
            self.bus.emit(EventKind::TaskUpdated, json!(task));
        }
        self.persist_and_emit_run(EventKind::RunUpdated).await;
        tracing::info!(
            "Run {} interrupted; {} tasks rolled back to pending",
            self.run_id,
            rolled_back.len()
        );
    }

    async fn mark_spawn_failure(&self, task_id: &str, worker_id: &str, error: &str) {
        let task = {
            let mut run = self.run.write().await;
            let now = chrono::Utc::now();
            if let Some(worker) = run.worker_mut(worker_id) {
                worker.status = WorkerStatus::Failed;
                worker.completed_at = Some(now);
            }
            run.task_mut(task_id).map(|task| {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                task.completed_at = Some(now);
                task.clone()
            })
        };
        if let Some(task) = task {
            self.bus.emit(EventKind::TaskUpdated, json!(task));
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn cancel_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(_) => {
                tracing::error!("Run {} cancel token lock poisoned", self.run_id);
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    fn pop_queue(&self) -> Option<String> {
        self.judge_queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn queue_is_empty(&self) -> bool {
        self.judge_queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    async fn persist(&self) {
        let run = self.run.read().await;
        if let Err(e) = self.store.save(&run) {
            tracing::error!("Failed to persist run {}: {}", self.run_id, e);
        }
    }

    async fn snapshot_payload(&self) -> serde_json::Value {
        json!(self.run.read().await.to_snapshot())
    }

    async fn persist_and_emit_run(&self, kind: EventKind) {
        self.persist().await;
        self.bus.emit(kind, self.snapshot_payload().await);
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("Run {}: {}", self.run_id, message);
        self.bus.emit(
            EventKind::Log,
            json!({ "run_id": self.run_id, "message": message }),
        );
    }
}

fn cancel_task(tasks: &mut [Task], task_id: &str, reason: &str, cancelled: &mut Vec<Task>) {
    if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
        task.status = TaskStatus::Cancelled;
        task.error = Some(reason.to_string());
        task.completed_at = Some(chrono::Utc::now());
        cancelled.push(task.clone());
    }
}
