//! Periodic cleanup of expired session associations

use chrono::Duration as ChronoDuration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use super::progress::ProgressReporter;
use crate::config::SessionConfig;
use crate::database::Database;
use crate::errors::StorageResult;

pub struct SessionSweeper {
    database: Database,
    progress: Option<ProgressReporter>,
    max_age: ChronoDuration,
    period: Duration,
}

impl SessionSweeper {
    pub fn new(database: Database, config: &SessionConfig) -> Self {
        Self {
            database,
            progress: None,
            max_age: config.association_max_age(),
            period: config.sweep_interval(),
        }
    }

    /// Also drop progress channels nobody listens to on every sweep
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Override the configured sweep period
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// One sweep. Returns the number of associations removed.
    pub async fn run_once(&self) -> StorageResult<u64> {
        let removed = self
            .database
            .sweep_expired_session_associations(self.max_age)
            .await?;

        if let Some(progress) = &self.progress {
            let pruned = progress.prune();
            if pruned > 0 {
                debug!("Pruned {} idle progress scopes", pruned);
            }
        }
        Ok(removed)
    }

    /// Sweep on a fixed interval until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Session sweeper started (every {}ms, max age {}h)",
                self.period.as_millis(),
                self.max_age.num_hours()
            );
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(removed) => debug!("Session sweep removed {} associations", removed),
                    Err(e) => error!("Session sweep failed: {}", e),
                }
            }
        })
    }
}
