// Planner Adapter
// Interface to the external planning service: initial plan and per-task judge

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orchestrator::types::{Run, Task};

/// A task as described by the planning service, before identifiers are
/// minted. Dependencies are given by sibling-task title and resolved by the
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    /// Smaller = higher; tasks without one get the default of 5
    pub priority: Option<i32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Initial plan for a run
#[derive(Debug, Clone)]
pub struct Plan {
    pub analysis: String,
    pub tasks: Vec<TaskSpec>,
}

/// Judge outcome for one finished task
#[derive(Debug, Clone)]
pub struct Verdict {
    pub assessment: String,
    pub goal_complete: bool,
    pub new_tasks: Vec<TaskSpec>,
}

/// Whether an external service appears configured. Credentials themselves
/// are opaque to the core.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealth {
    pub name: String,
    pub configured: bool,
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce the analysis and initial task set for a run. Failure here is
    /// fatal to the run.
    async fn plan(&self, run: &Run) -> Result<Plan>;

    /// Assess a finished task. `activity` is a compact digest of the
    /// worker's activity feed. Failure is recorded and never fatal.
    async fn judge(&self, run: &Run, task: &Task, activity: &str) -> Result<Verdict>;

    fn health(&self) -> AdapterHealth;
}

/// Resolve dependency titles to task identifiers, case-insensitively,
/// against `tasks`. Unresolvable titles are dropped with a warning; when
/// several tasks share a title the first one in task order wins.
pub fn resolve_depends_on(tasks: &[Task], titles: &[String]) -> Vec<String> {
    let mut resolved = Vec::with_capacity(titles.len());
    for title in titles {
        let needle = title.to_lowercase();
        let mut matches = tasks.iter().filter(|t| t.title.to_lowercase() == needle);
        match matches.next() {
            Some(task) => {
                if matches.next().is_some() {
                    tracing::warn!(
                        "Multiple tasks share the title '{}'; using the first match",
                        title
                    );
                }
                resolved.push(task.id.clone());
            }
            None => {
                tracing::warn!("Dropping unresolvable dependency title '{}'", title);
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::DEFAULT_TASK_PRIORITY;

    fn make_task(title: &str) -> Task {
        Task::new(title, "", DEFAULT_TASK_PRIORITY)
    }

    #[test]
    fn test_resolution_is_case_insensitive() {
        let tasks = vec![make_task("Write Tests"), make_task("Refactor")];
        let resolved = resolve_depends_on(&tasks, &["write tests".to_string()]);
        assert_eq!(resolved, vec![tasks[0].id.clone()]);
    }

    #[test]
    fn test_unresolvable_titles_are_dropped() {
        let tasks = vec![make_task("A")];
        let resolved = resolve_depends_on(&tasks, &["A".to_string(), "Missing".to_string()]);
        assert_eq!(resolved, vec![tasks[0].id.clone()]);
    }

    #[test]
    fn test_duplicate_titles_use_first_match() {
        let tasks = vec![make_task("dup"), make_task("DUP")];
        let resolved = resolve_depends_on(&tasks, &["Dup".to_string()]);
        assert_eq!(resolved, vec![tasks[0].id.clone()]);
    }
}
