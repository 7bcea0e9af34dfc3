// Run Store
// Durable per-run persistence: one directory per run, run.json inside

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::orchestrator::types::{Run, RunStatus, TaskStatus, WorkerStatus};

/// Most recent log/activity entries kept per worker at write time.
const PERSISTED_TAIL: usize = 100;

/// Persistence layer for run state
pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    /// Create a store rooted at `base_dir`, creating the directory if
    /// needed.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    /// Atomically persist a run under its identifier. Worker logs and
    /// activity are truncated to the trailing 100 entries to bound on-disk
    /// size.
    pub fn save(&self, run: &Run) -> Result<()> {
        let mut run = run.clone();
        for worker in &mut run.workers {
            truncate_to_tail(&mut worker.logs);
            truncate_to_tail(&mut worker.activity);
        }

        let dir = self.run_dir(&run.id);
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(&run)?;
        atomic_write(&dir.join("run.json"), &content)
    }

    /// Load one run, applying the legacy-record migration but not the
    /// restart reconciliation.
    pub fn load(&self, run_id: &str) -> Result<Run> {
        let path = self.run_dir(run_id).join("run.json");
        let content = fs::read_to_string(&path)?;
        let mut record: Value = serde_json::from_str(&content)?;
        migrate_legacy_record(&mut record);
        Ok(serde_json::from_value(record)?)
    }

    /// Read every stored run, migrated and reconciled for a fresh start.
    /// Unreadable records are skipped with an error log.
    pub fn load_all(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        if !self.base_dir.exists() {
            return Ok(runs);
        }

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            match self.load(&run_id) {
                Ok(mut run) => {
                    reconcile_loaded(&mut run);
                    runs.push(run);
                }
                Err(e) => {
                    tracing::error!("Skipping unreadable run record {}: {}", run_id, e);
                }
            }
        }

        Ok(runs)
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id).join("run.json").exists()
    }
}

fn truncate_to_tail<T>(entries: &mut Vec<T>) {
    if entries.len() > PERSISTED_TAIL {
        entries.drain(..entries.len() - PERSISTED_TAIL);
    }
}

/// Restart reconciliation: a freshly loaded graph must carry no phantom
/// in-flight state. In-flight runs resume as paused, running workers are
/// closed out as failed, and their tasks return to the pending pool.
pub fn reconcile_loaded(run: &mut Run) {
    if run.status.is_active() {
        run.status = RunStatus::Paused;
    }
    let now = chrono::Utc::now();
    for worker in &mut run.workers {
        if worker.status == WorkerStatus::Running {
            worker.status = WorkerStatus::Failed;
            worker.completed_at = Some(now);
        }
    }
    for task in &mut run.tasks {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.worker_id = None;
        }
    }
}

/// Upgrade a record written in the superseded `cycles` shape: cycle plans
/// are flattened into `tasks`, the first non-empty cycle analysis becomes
/// `analysis`, and each cycle judgement text becomes a synthesized
/// judgement with `goal_complete = !should_continue`. Already-migrated
/// records pass through unchanged, so the migration is idempotent.
pub fn migrate_legacy_record(record: &mut Value) {
    let Some(obj) = record.as_object_mut() else {
        return;
    };
    if obj.contains_key("tasks") || !obj.contains_key("cycles") {
        obj.remove("cycles");
        return;
    }

    let cycles = obj
        .remove("cycles")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();

    let mut tasks = Vec::new();
    let mut analysis = String::new();
    let mut judgements = Vec::new();

    for cycle in &cycles {
        if let Some(plan_tasks) = cycle.pointer("/plan/tasks").and_then(Value::as_array) {
            tasks.extend(plan_tasks.iter().cloned());
        }
        if analysis.is_empty() {
            if let Some(text) = cycle.pointer("/plan/analysis").and_then(Value::as_str) {
                if !text.is_empty() {
                    analysis = text.to_string();
                }
            }
        }
        if let Some(text) = cycle.get("judgement").and_then(Value::as_str) {
            let should_continue = cycle
                .get("should_continue")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let created_at = cycle
                .get("completed_at")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| json!(chrono::Utc::now()));
            judgements.push(json!({
                "id": Uuid::new_v4().to_string(),
                "task_id": "",
                "assessment": text,
                "new_task_ids": [],
                "goal_complete": !should_continue,
                "created_at": created_at,
            }));
        }
    }

    obj.insert("tasks".to_string(), Value::Array(tasks));
    if !obj.contains_key("analysis") {
        obj.insert("analysis".to_string(), json!(analysis));
    }
    if !obj.contains_key("judgements") {
        obj.insert("judgements".to_string(), Value::Array(judgements));
    }
    if !obj.contains_key("workers") {
        obj.insert("workers".to_string(), json!([]));
    }
}

/// Atomic write using temp file and rename
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
