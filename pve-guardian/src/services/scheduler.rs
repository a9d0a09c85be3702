use crate::services::backup_engine::{self, BackupOutcome};
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Delay before the start-up backup, so the listener is up first
const RUN_ON_START_DELAY: Duration = Duration::from_secs(3);

/// Accept standard 5-field cron by prepending a seconds field; 6-field
/// expressions pass through.
pub fn normalize_cron(expression: &str) -> anyhow::Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => anyhow::bail!("invalid cron expression '{expression}': expected 5 or 6 fields, got {n}"),
    }
}

/// Run one backup on a blocking thread. A dropped trigger is logged by the
/// engine and ends here.
pub async fn trigger_backup(state: Arc<AppState>, origin: &'static str) {
    tracing::info!(origin, "Backup triggered");
    match tokio::task::spawn_blocking(move || backup_engine::run_backup_job(&state)).await {
        Ok(BackupOutcome::Finished(report)) => {
            tracing::debug!(origin, success = report.success, attempts = report.attempts, "Backup trigger finished")
        }
        Ok(BackupOutcome::Rejected(reason)) => tracing::info!(origin, reason = %reason, "Backup trigger dropped"),
        Err(e) => tracing::error!(origin, error = %e, "Backup task panicked"),
    }
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule_backup(&self, cron_expression: &str) -> anyhow::Result<()> {
        let cron = normalize_cron(cron_expression)?;
        let state = self.state.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(reason) = state.coordinator.check_admission() {
                    tracing::warn!(reason = %reason, "Skipping scheduled backup");
                    return;
                }
                trigger_backup(state, "schedule").await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron, "Backup scheduled");
        Ok(())
    }

    /// Register the configured schedule, if any.
    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let schedule = &self.state.config.schedule;
        if !schedule.enabled {
            tracing::info!("Scheduled backups disabled");
            return Ok(());
        }
        self.schedule_backup(&schedule.cron).await
    }

    /// One backup shortly after start-up when configured.
    pub fn spawn_run_on_start(&self) {
        if !self.state.config.schedule.run_on_start {
            return;
        }
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RUN_ON_START_DELAY).await;
            trigger_backup(state, "startup").await;
        });
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::Harness;

    #[test]
    fn test_normalize_five_field_cron() {
        assert_eq!(normalize_cron("0 3 * * *").unwrap(), "0 0 3 * * *");
        assert_eq!(normalize_cron("  30   2 * * 1-5 ").unwrap(), "0 30 2 * * 1-5");
    }

    #[test]
    fn test_normalize_keeps_six_fields() {
        assert_eq!(normalize_cron("15 0 3 * * *").unwrap(), "15 0 3 * * *");
    }

    #[test]
    fn test_normalize_rejects_other_shapes() {
        assert!(normalize_cron("").is_err());
        assert!(normalize_cron("* * *").is_err());
        assert!(normalize_cron("0 0 3 * * * 2025").is_err());
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_expression() {
        let h = Harness::new(|_| {});
        let scheduler = BackupScheduler::new(h.state.clone()).await.unwrap();
        assert!(scheduler.schedule_backup("every night").await.is_err());
        assert!(scheduler.schedule_backup("0 3 * * *").await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_backup_records_one_entry() {
        let h = Harness::new(|c| c.ssh.password.clear());
        trigger_backup(h.state.clone(), "test").await;
        let entries =
            crate::models::history::list(&h.state.store, crate::models::history::HistoryKind::Backup).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
    }
}
