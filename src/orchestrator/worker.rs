// Worker Adapter
// Interface to the external worker agent: spawn, cancel, enumerate

use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::event_bus::EventBus;
use crate::orchestrator::planner::AdapterHealth;
use crate::orchestrator::types::SharedRun;

/// Everything a worker agent needs to execute one task.
///
/// The worker records progress directly into the shared run: log and
/// activity entries on the `WorkerRecord` identified by `worker_id` (which
/// the engine has already appended) while it runs, and on normal
/// termination the record's terminal status and `completed_at` plus the
/// task's `status`/`result`/`error`/`completed_at`. A cancelled worker
/// marks only its own record failed; the engine owns the task rollback.
pub struct WorkerSpec {
    pub run: SharedRun,
    pub worker_id: String,
    pub task_id: String,
    pub target_dir: PathBuf,
    /// For `worker:log` / `worker:updated` emissions as the agent runs
    pub bus: EventBus,
}

/// Resolves only after the worker's terminal mutations are visible in the
/// shared run.
pub type WorkerDone = BoxFuture<'static, ()>;

#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Launch the agentic loop for one task and return the completion
    /// future the engine awaits.
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerDone>;

    /// Cancel specific workers; they stop promptly and record themselves
    /// failed.
    async fn cancel(&self, worker_ids: &[String]);

    /// Cancel every active worker (shutdown path).
    async fn cancel_all(&self);

    /// Identifiers of workers currently executing.
    async fn list_active(&self) -> Vec<String>;

    fn health(&self) -> AdapterHealth;
}
