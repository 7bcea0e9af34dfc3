// Lifecycle Reaper
// Startup restoration and orderly shutdown around a RunManager

use tokio::task::JoinHandle;

use crate::error::Result;
use crate::orchestrator::manager::RunManager;

/// Holds the background autosave ticker between startup and shutdown.
pub struct Lifecycle {
    autosave: Option<JoinHandle<()>>,
}

impl Lifecycle {
    /// Restore persisted runs into the manager and start the autosave
    /// ticker. Loaded records arrive already reconciled: no run is left
    /// planning/executing/judging, no worker running, no task in progress.
    pub async fn startup(manager: &RunManager) -> Result<Self> {
        let runs = manager.store().load_all()?;
        let restored = runs.len();
        for run in runs {
            manager.adopt(run).await;
        }
        if restored > 0 {
            tracing::info!("Restored {} persisted runs", restored);
        }

        let ticker = {
            let manager = manager.clone();
            let period = manager.config().autosave_interval();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    manager.persist_all().await;
                }
            })
        };

        Ok(Self {
            autosave: Some(ticker),
        })
    }

    /// Stop the ticker, abort every pipeline, cancel all workers, and
    /// persist final state. Runs keep their statuses; the next startup's
    /// reconciliation turns interrupted ones into paused, resumable runs.
    pub async fn shutdown(mut self, manager: &RunManager) {
        if let Some(ticker) = self.autosave.take() {
            ticker.abort();
        }
        manager.suspend_all().await;
        tracing::info!("Orchestrator shut down");
    }
}
