//! Schedule Manager (§4.7): cron registry with missed-run recovery.
//!
//! On startup, every enabled schedule is loaded and registered with the
//! cron runtime; any whose `next_run_at` already lies in the past gets one
//! immediate dispatch (guarded against restart storms by the Coordinator's
//! single-in-progress-per-connection invariant). A background poll ticker
//! (`spawn_ticker`) keeps firing schedules as their cron time arrives for
//! the remaining lifetime of the process. Retention is enforced at run end
//! (Open Question ii resolved in favor of run-end over a periodic sweep).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::error::{BackupError, Result};
use crate::model::Schedule;
use crate::repository::Repository;

/// Owns the set of registered schedules and dispatches runs through a
/// [`Coordinator`].
pub struct ScheduleManager {
    repository: Arc<Repository>,
    coordinator: Arc<Coordinator>,
}

impl ScheduleManager {
    pub fn new(repository: Arc<Repository>, coordinator: Arc<Coordinator>) -> Self {
        Self { repository, coordinator }
    }

    /// Startup recovery sweep: load every enabled schedule, dispatch
    /// exactly one immediate run for any whose `next_run_at` is already
    /// past, and compute the next scheduled `next_run_at` for every
    /// schedule. Returns the number of immediate runs dispatched.
    pub async fn recover(&self) -> Result<usize> {
        let schedules = self.repository.list_enabled_schedules().await?;
        let now = Utc::now();
        let mut dispatched = 0;

        for schedule in schedules {
            let due_now = is_due(schedule.next_run_at, now, true);
            let next_run_at = next_fire_after(&schedule.cron_expression, now)?;

            if due_now {
                match self.dispatch(&schedule, next_run_at).await {
                    Ok(()) => dispatched += 1,
                    Err(e) => tracing::warn!(
                        connection_id = %schedule.connection_id,
                        error = %e,
                        "recovery sweep: schedule failed to dispatch, continuing with the rest"
                    ),
                }
            } else {
                self.repository
                    .set_schedule_run_times(schedule.connection_id, Some(next_run_at), schedule.last_run_at)
                    .await?;
            }
        }

        Ok(dispatched)
    }

    /// Register (or re-register) a schedule, reparsing its cron
    /// expression.
    pub async fn register(&self, schedule: Schedule) -> Result<()> {
        parse_cron(&schedule.cron_expression)?;
        self.repository.create_schedule(schedule).await
    }

    /// Reparse `cron_expression` and re-register, updating `retention_days`.
    pub async fn update_schedule(
        &self,
        connection_id: Uuid,
        cron_expression: String,
        retention_days: Option<u32>,
    ) -> Result<()> {
        parse_cron(&cron_expression)?;
        self.repository.update_schedule(connection_id, cron_expression, retention_days).await
    }

    pub async fn disable_schedule(&self, connection_id: Uuid) -> Result<()> {
        self.repository.disable_schedule(connection_id).await
    }

    /// Spawn the recurring cron-fire ticker: every `poll_interval`, loads
    /// every enabled schedule and dispatches any whose `next_run_at` has
    /// arrived, then recomputes its next fire time. This is what keeps a
    /// schedule firing for the lifetime of the process after the one-shot
    /// `recover()` sweep at startup; intended to run as a detached task for
    /// as long as the embedding application is up.
    pub fn spawn_ticker(self: &Arc<Self>, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if let Err(e) = manager.fire_due_schedules().await {
                    tracing::warn!(error = %e, "schedule ticker: sweep failed, will retry next interval");
                }
            }
        })
    }

    /// One sweep: dispatch every enabled schedule whose `next_run_at` has
    /// already arrived, and advance `next_run_at` for each of them.
    /// Schedules not yet due are left untouched.
    async fn fire_due_schedules(&self) -> Result<usize> {
        let schedules = self.repository.list_enabled_schedules().await?;
        let now = Utc::now();
        let mut dispatched = 0;

        for schedule in schedules {
            if !is_due(schedule.next_run_at, now, false) {
                continue;
            }

            let next_run_at = next_fire_after(&schedule.cron_expression, now)?;
            match self.dispatch(&schedule, next_run_at).await {
                Ok(()) => dispatched += 1,
                Err(e) => tracing::warn!(
                    connection_id = %schedule.connection_id,
                    error = %e,
                    "schedule ticker: schedule failed to dispatch, continuing with the rest"
                ),
            }
        }

        Ok(dispatched)
    }

    /// Dispatch one run for `schedule`, recording `next_run_at` as its
    /// following scheduled fire time, then apply the run-end retention
    /// sweep once the run reaches a terminal state.
    async fn dispatch(&self, schedule: &Schedule, next_run_at: DateTime<Utc>) -> Result<()> {
        let sink_ids = if schedule.sink_ids.is_empty() { None } else { Some(schedule.sink_ids.clone()) };
        let (backup_id, _accepted_at) = self
            .coordinator
            .start_backup(schedule.connection_id, sink_ids, Some(schedule.id))
            .await?;

        self.repository
            .set_schedule_run_times(schedule.connection_id, Some(next_run_at), Some(Utc::now()))
            .await?;

        if let Some(retention_days) = schedule.retention_days {
            let coordinator = self.coordinator.clone();
            let repository = self.repository.clone();
            let connection_id = schedule.connection_id;
            tokio::spawn(async move {
                if coordinator.wait_for_terminal(backup_id).await.is_ok() {
                    let _ = apply_retention(&repository, &coordinator, connection_id, retention_days).await;
                }
            });
        }

        Ok(())
    }
}

/// Delete completed backups older than `retention_days` for `connection_id`,
/// best-effort removing their objects from every recorded binding first.
/// A removal failure (provider unreachable, credentials revoked) is logged
/// and does not stop the sweep; the backup row is deleted regardless so
/// retention always converges.
pub async fn apply_retention(
    repository: &Repository,
    coordinator: &Coordinator,
    connection_id: Uuid,
    retention_days: u32,
) -> Result<()> {
    let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
    let expired = repository.list_backups_older_than(connection_id, cutoff).await?;

    for backup in expired {
        let bindings = repository.list_bindings(backup.id).await.unwrap_or_default();
        for binding in bindings {
            if let Err(e) = coordinator.remove_object(binding.provider_id, &binding.object_key).await {
                tracing::warn!(
                    backup_id = %backup.id,
                    provider_id = %binding.provider_id,
                    object_key = %binding.object_key,
                    error = %e,
                    "retention: failed to remove object, deleting backup row anyway"
                );
            }
        }
        repository.delete_backup(backup.id).await?;
    }

    Ok(())
}

/// Whether a schedule with `next_run_at` is due for a run at `now`.
/// `never_scheduled_is_due` governs the startup-recovery case, where a
/// schedule with no recorded `next_run_at` yet (freshly created) is treated
/// as due; the recurring ticker sweep treats it as not-yet-due instead,
/// since `recover()` runs first and always assigns one before the ticker's
/// first tick.
fn is_due(next_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>, never_scheduled_is_due: bool) -> bool {
    next_run_at.map(|t| t <= now).unwrap_or(never_scheduled_is_due)
}

fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expr).map_err(|e| BackupError::Scheduling(e.to_string()))
}

fn next_fire_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(expr)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| BackupError::Scheduling("cron expression has no future occurrences".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cron_rejects_malformed_expression() {
        assert!(parse_cron("not a cron expression").is_err());
    }

    #[test]
    fn parse_cron_accepts_six_field_expression() {
        assert!(parse_cron("0 0 3 * * *").is_ok());
    }

    #[test]
    fn next_fire_after_returns_a_future_time() {
        let now = Utc::now();
        let next = next_fire_after("0 0 3 * * *", now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn is_due_fires_once_next_run_at_has_passed() {
        let now = Utc::now();
        assert!(is_due(Some(now - ChronoDuration::seconds(1)), now, false));
        assert!(is_due(Some(now), now, false));
        assert!(!is_due(Some(now + ChronoDuration::seconds(1)), now, false));
    }

    #[test]
    fn is_due_treats_unscheduled_differently_for_recovery_vs_ticker() {
        let now = Utc::now();
        assert!(is_due(None, now, true));
        assert!(!is_due(None, now, false));
    }
}
