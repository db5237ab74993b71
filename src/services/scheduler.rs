use crate::engine::BackupEngine;
use crate::models::backup_config::{BackupConfig, Frequency};
use crate::models::backup_job::TriggeredBy;
use chrono::{DateTime, Datelike, Local, Timelike};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Clock seam so tests can evaluate ticks at a fixed instant instead of
/// waiting on real timers.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// One cooperative loop owning all trigger evaluation. Reads active configs
/// from the store on every tick, so schedule edits take effect without any
/// timer bookkeeping.
pub struct Scheduler {
    engine: Arc<BackupEngine>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        Self::with_clock(engine, Arc::new(SystemClock))
    }

    pub fn with_clock(engine: Arc<BackupEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    /// Trigger predicate: wall-clock minute matches the schedule.
    pub fn should_fire(config: &BackupConfig, now: &DateTime<Local>) -> bool {
        let schedule = &config.schedule;
        if !schedule.enabled || !config.active {
            return false;
        }
        let hhmm = format!("{:02}:{:02}", now.hour(), now.minute());
        if hhmm != schedule.time {
            return false;
        }
        match schedule.frequency {
            Frequency::Daily => true,
            Frequency::Weekly => {
                schedule.day_of_week == Some(now.weekday().num_days_from_sunday() as u8)
            }
            Frequency::Monthly => schedule.day_of_month == Some(now.day() as u8),
        }
    }

    /// Evaluate every active config once. Idempotent per minute: a config
    /// that already fired in the current minute is not fired again, however
    /// often ticks overlap.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let minute_key = now.format("%Y-%m-%d %H:%M").to_string();

        let configs = match self.engine.active_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!(error = %e, "Scheduler could not load configs");
                return;
            }
        };

        for config in configs {
            if !Self::should_fire(&config, &now) {
                continue;
            }
            let already_fired = self
                .engine
                .last_fired
                .get(&config.id)
                .map(|m| *m == minute_key)
                .unwrap_or(false);
            if already_fired {
                continue;
            }
            self.engine
                .last_fired
                .insert(config.id.clone(), minute_key.clone());

            match self
                .engine
                .clone()
                .start_backup(&config.id, TriggeredBy::Schedule, None)
                .await
            {
                Ok(job_id) => {
                    tracing::info!(config_id = %config.id, job_id = %job_id, "Scheduled backup triggered");
                }
                Err(e) => {
                    // Overlap skips and transient faults stay in the loop
                    tracing::warn!(config_id = %config.id, error = %e, "Scheduled trigger not started");
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.engine.config.scheduler_tick_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => self.tick().await,
                }
            }
            tracing::info!("Scheduler stopped");
        })
    }
}
