// Orchestrator Types
// Run, task, judgement and worker records shared across the engine

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Priority assigned to tasks that do not carry one (smaller = higher).
pub const DEFAULT_TASK_PRIORITY: i32 = 5;

/// The per-run shared state every component mutates under the run's lock.
pub type SharedRun = Arc<RwLock<Run>>;

// ============================================================================
// Run State
// ============================================================================

/// Status of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created, never started
    Idle,
    /// Planner is generating the initial task set
    Planning,
    /// Workers are executing tasks
    Executing,
    /// The judge is assessing a completed task
    Judging,
    /// Interrupted by the user; resumable
    Paused,
    /// All work drained; terminal
    Completed,
    /// Unrecoverable error; terminal
    Failed,
    /// Stopped by the user; reopened as paused on resume
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// States in which a scheduler is (logically) driving the run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Planning | Self::Executing | Self::Judging)
    }
}

/// One end-to-end attempt to satisfy a goal over a target directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier
    pub id: String,
    /// User's goal
    pub goal: String,
    /// Directory the workers operate in
    pub target_dir: PathBuf,
    /// Current run status
    pub status: RunStatus,
    /// Analysis text produced by the planner
    #[serde(default)]
    pub analysis: String,
    /// Task list, in creation order
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Judge records, in the order their triggering tasks completed
    #[serde(default)]
    pub judgements: Vec<Judgement>,
    /// Worker executions, in spawn order
    #[serde(default)]
    pub workers: Vec<WorkerRecord>,
    /// Worker parallelism cap (1..=10)
    pub max_workers: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Terminal error message, set only for unrecoverable failures
    pub error: Option<String>,
}

impl Run {
    pub fn new(goal: impl Into<String>, target_dir: impl Into<PathBuf>, max_workers: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            target_dir: target_dir.into(),
            status: RunStatus::Idle,
            analysis: String::new(),
            tasks: Vec::new(),
            judgements: Vec::new(),
            workers: Vec::new(),
            max_workers,
            created_at: chrono::Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    pub fn running_worker_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Running)
            .map(|w| w.id.clone())
            .collect()
    }

    pub fn to_snapshot(&self) -> RunSnapshot {
        let tasks_completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let tasks_failed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let workers_running = self
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Running)
            .count();

        RunSnapshot {
            id: self.id.clone(),
            goal: self.goal.clone(),
            status: self.status,
            task_count: self.tasks.len(),
            tasks_completed,
            tasks_failed,
            workers_running,
            judgement_count: self.judgements.len(),
            error: self.error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Lightweight view of a run used as event payload and for listings
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub id: String,
    pub goal: String,
    pub status: RunStatus,
    pub task_count: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub workers_running: usize,
    pub judgement_count: usize,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

// ============================================================================
// Task State
// ============================================================================

/// Status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies and a worker slot
    Pending,
    /// A worker is executing it
    InProgress,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Never ran; terminal
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A unit of work inside a run, executed by one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the run
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Smaller = higher priority
    pub priority: i32,
    /// Identifiers of tasks in the same run that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Worker currently (or last) assigned to this task
    pub worker_id: Option<String>,
    /// Result text, set on completion
    pub result: Option<String>,
    /// Error text, set on failure or cancellation
    pub error: Option<String>,
    /// Judgement that spawned this task; absent for initial-plan tasks
    pub spawned_by: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority,
            depends_on: Vec::new(),
            worker_id: None,
            result: None,
            error: None,
            spawned_by: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// Judgements
// ============================================================================

/// Immutable record of one judge invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgement {
    pub id: String,
    /// The task whose completion triggered this judgement
    pub task_id: String,
    pub assessment: String,
    /// Tasks spawned by this judgement, each carrying `spawned_by = id`
    #[serde(default)]
    pub new_task_ids: Vec<String>,
    pub goal_complete: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// Workers
// ============================================================================

/// Status of a worker execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Completed,
    Failed,
}

/// Kind of a structured activity entry emitted by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ToolCall,
    FileEdit,
    FileCreate,
    Bash,
    Text,
    Error,
    Thinking,
}

/// One structured activity record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub kind: ActivityKind,
    pub summary: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Record of one worker-agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub status: WorkerStatus,
    pub task_id: String,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub activity: Vec<ActivityEntry>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WorkerRecord {
    pub fn started(id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Running,
            task_id: task_id.into(),
            logs: Vec::new(),
            activity: Vec::new(),
            started_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub fn record(&mut self, kind: ActivityKind, summary: impl Into<String>) {
        self.activity.push(ActivityEntry {
            kind,
            summary: summary.into(),
            timestamp: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let mut run = Run::new("goal", "/tmp", 3);
        let mut done = Task::new("a", "", DEFAULT_TASK_PRIORITY);
        done.status = TaskStatus::Completed;
        let mut failed = Task::new("b", "", DEFAULT_TASK_PRIORITY);
        failed.status = TaskStatus::Failed;
        run.tasks = vec![done, failed, Task::new("c", "", DEFAULT_TASK_PRIORITY)];
        run.workers.push(WorkerRecord::started("w1", "a"));

        let snapshot = run.to_snapshot();
        assert_eq!(snapshot.task_count, 3);
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.workers_running, 1);
    }

    #[test]
    fn test_status_predicates() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Judging.is_active());
        assert!(!RunStatus::Idle.is_active());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }
}
