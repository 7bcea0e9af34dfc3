// Engine tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on per-run worker parallelism.
pub const MAX_WORKERS_LIMIT: usize = 10;

/// Configuration for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Worker parallelism used when a run does not specify one
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
    /// Seconds between background snapshots of every known run
    #[serde(default = "default_autosave_secs")]
    pub autosave_interval_secs: u64,
    /// Milliseconds the scheduler sleeps when nothing is running but
    /// pending tasks are still waiting on the judge
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Milliseconds between judge-queue drain checks during finalization
    #[serde(default = "default_judge_poll_ms")]
    pub judge_poll_ms: u64,
}

fn default_max_workers() -> usize {
    3
}

fn default_autosave_secs() -> u64 {
    10
}

fn default_idle_poll_ms() -> u64 {
    250
}

fn default_judge_poll_ms() -> u64 {
    100
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            default_max_workers: default_max_workers(),
            autosave_interval_secs: default_autosave_secs(),
            idle_poll_ms: default_idle_poll_ms(),
            judge_poll_ms: default_judge_poll_ms(),
        }
    }
}

impl ForemanConfig {
    /// Resolve a requested worker parallelism, clamping to `1..=10`.
    pub fn clamp_max_workers(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_max_workers)
            .clamp(1, MAX_WORKERS_LIMIT)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs.max(1))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.clamp(10, 1_000))
    }

    pub fn judge_poll(&self) -> Duration {
        Duration::from_millis(self.judge_poll_ms.clamp(10, 500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_max_workers() {
        let config = ForemanConfig::default();
        assert_eq!(config.clamp_max_workers(None), 3);
        assert_eq!(config.clamp_max_workers(Some(0)), 1);
        assert_eq!(config.clamp_max_workers(Some(7)), 7);
        assert_eq!(config.clamp_max_workers(Some(50)), 10);
    }

    #[test]
    fn test_poll_bounds() {
        let config = ForemanConfig {
            idle_poll_ms: 10_000,
            judge_poll_ms: 10_000,
            ..ForemanConfig::default()
        };
        assert_eq!(config.idle_poll(), Duration::from_millis(1_000));
        assert_eq!(config.judge_poll(), Duration::from_millis(500));
    }
}
