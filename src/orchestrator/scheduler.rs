// Task Graph
// Pure dependency-graph helpers used by the run engine

use std::collections::{HashMap, HashSet};

use crate::orchestrator::types::{Task, TaskStatus};

/// Dependency-graph queries over a run's task list
pub struct TaskGraph;

impl TaskGraph {
    /// Pending tasks whose dependencies are all completed, best first
    /// (smaller priority wins, creation order breaks ties).
    pub fn ready(tasks: &[Task]) -> Vec<&Task> {
        let completed: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();

        let mut ready: Vec<&Task> = tasks
            .iter()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && task
                        .depends_on
                        .iter()
                        .all(|dep| completed.contains(dep.as_str()))
            })
            .collect();

        // stable sort keeps creation order within a priority level
        ready.sort_by_key(|task| task.priority);
        ready
    }

    /// Pending tasks with at least one failed or cancelled dependency.
    pub fn blocked_by_failure(tasks: &[Task]) -> Vec<String> {
        let dead: HashSet<&str> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .map(|t| t.id.as_str())
            .collect();

        tasks
            .iter()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && task.depends_on.iter().any(|dep| dead.contains(dep.as_str()))
            })
            .map(|task| task.id.clone())
            .collect()
    }

    /// Pending tasks that can never become ready: some dependency is
    /// terminal-without-completing, missing from the run, or caught in a
    /// dependency cycle. Computed as the complement of a viability
    /// fixpoint.
    pub fn doomed(tasks: &[Task]) -> Vec<String> {
        let mut viable: HashSet<&str> = tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Completed | TaskStatus::InProgress | TaskStatus::Pending
                )
            })
            .map(|t| t.id.as_str())
            .collect();

        loop {
            let stuck: Vec<&str> = tasks
                .iter()
                .filter(|task| {
                    task.status == TaskStatus::Pending
                        && viable.contains(task.id.as_str())
                        && task
                            .depends_on
                            .iter()
                            .any(|dep| !viable.contains(dep.as_str()))
                })
                .map(|task| task.id.as_str())
                .collect();
            if stuck.is_empty() {
                break;
            }
            for id in stuck {
                viable.remove(id);
            }
        }

        tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending && !viable.contains(task.id.as_str()))
            .map(|task| task.id.clone())
            .collect()
    }

    /// First dependency cycle found, as an id path ending where it started.
    pub fn detect_cycle(tasks: &[Task]) -> Option<Vec<String>> {
        let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        for task in tasks {
            let mut visited = HashSet::new();
            let mut path = Vec::new();
            if Self::dfs_cycle(&task.id, &task_map, &mut visited, &mut path) {
                return Some(path);
            }
        }

        None
    }

    fn dfs_cycle(
        task_id: &str,
        task_map: &HashMap<&str, &Task>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if path.iter().any(|id| id == task_id) {
            path.push(task_id.to_string());
            return true;
        }
        if visited.contains(task_id) {
            return false;
        }

        visited.insert(task_id.to_string());
        path.push(task_id.to_string());

        if let Some(task) = task_map.get(task_id) {
            for dep in &task.depends_on {
                if Self::dfs_cycle(dep, task_map, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::DEFAULT_TASK_PRIORITY;

    fn make_task(id: &str, deps: Vec<&str>, status: TaskStatus) -> Task {
        let mut task = Task::new(format!("Task {}", id), "", DEFAULT_TASK_PRIORITY);
        task.id = id.to_string();
        task.depends_on = deps.into_iter().map(String::from).collect();
        task.status = status;
        task
    }

    #[test]
    fn test_ready_respects_dependencies() {
        let tasks = vec![
            make_task("1", vec![], TaskStatus::Completed),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec!["2"], TaskStatus::Pending),
        ];

        let ready = TaskGraph::ready(&tasks);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "2");
    }

    #[test]
    fn test_ready_orders_by_priority_then_creation() {
        let mut low = make_task("1", vec![], TaskStatus::Pending);
        low.priority = 9;
        let mut high = make_task("2", vec![], TaskStatus::Pending);
        high.priority = 1;
        let mut tied = make_task("3", vec![], TaskStatus::Pending);
        tied.priority = 9;

        let tasks = vec![low, high, tied];
        let ready = TaskGraph::ready(&tasks);
        let ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "3"]);
    }

    #[test]
    fn test_blocked_by_failure() {
        let tasks = vec![
            make_task("1", vec![], TaskStatus::Failed),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec![], TaskStatus::Pending),
            make_task("4", vec!["5"], TaskStatus::Pending),
            make_task("5", vec![], TaskStatus::Cancelled),
        ];

        let mut blocked = TaskGraph::blocked_by_failure(&tasks);
        blocked.sort();
        assert_eq!(blocked, vec!["2", "4"]);
    }

    #[test]
    fn test_doomed_covers_chains_and_cycles() {
        let tasks = vec![
            make_task("1", vec![], TaskStatus::Failed),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec!["2"], TaskStatus::Pending),
            make_task("4", vec!["5"], TaskStatus::Pending),
            make_task("5", vec!["4"], TaskStatus::Pending),
            make_task("6", vec![], TaskStatus::Pending),
        ];

        let mut doomed = TaskGraph::doomed(&tasks);
        doomed.sort();
        assert_eq!(doomed, vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn test_detect_cycle() {
        let no_cycle = vec![
            make_task("1", vec![], TaskStatus::Pending),
            make_task("2", vec!["1"], TaskStatus::Pending),
        ];
        assert!(TaskGraph::detect_cycle(&no_cycle).is_none());

        let cycle = vec![
            make_task("1", vec!["3"], TaskStatus::Pending),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec!["2"], TaskStatus::Pending),
        ];
        assert!(TaskGraph::detect_cycle(&cycle).is_some());
    }
}
