use crate::db::{self, Db, StatusUpdate};
use crate::error::Result;
use crate::evaluator::Evaluation;
use crate::models::{Service, ServiceStatus};
use crate::probe::ProbeResult;
use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use std::sync::Arc;

/// Writes one check's outcome: service status, log row, metric row, uptime.
pub struct HistoryRecorder {
    db: Arc<Db>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedCheck {
    pub log_id: i64,
    pub metric_id: i64,
    pub checked_at: DateTime<Utc>,
    pub uptime: f64,
    pub total_monitored_time: i64,
    pub online_time: i64,
}

impl HistoryRecorder {
    pub fn new(db: Arc<Db>) -> Self {
        HistoryRecorder { db }
    }

    /// All writes land in one transaction; on error nothing is persisted.
    pub fn record(
        &self,
        service: &Service,
        evaluation: &Evaluation,
        probe: &ProbeResult,
        checked_at: DateTime<Utc>,
    ) -> Result<RecordedCheck> {
        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let counters = db::load_counters(&tx, &service.id)?;
        let accrued = accrued_seconds(counters.last_checked, checked_at, service.check_interval);
        let total_monitored_time = counters.total_monitored_time + accrued;
        let online_time = counters.online_time
            + if evaluation.status == ServiceStatus::Online { accrued } else { 0 };
        let uptime = uptime_percentage(online_time, total_monitored_time);

        db::update_service_status(
            &tx,
            &StatusUpdate {
                service_id: &service.id,
                status: evaluation.status,
                response_time: evaluation.response_time,
                checked_at,
                total_monitored_time,
                online_time,
                uptime,
                ssl_expiry_date: probe.ssl.as_ref().map(|c| c.expires_at),
                ssl_days_remaining: probe.ssl.as_ref().map(|c| c.days_remaining),
            },
        )?;
        let log_id = db::append_log(
            &tx,
            &service.id,
            checked_at,
            evaluation.status,
            evaluation.response_time,
            &evaluation.message,
        )?;
        let metric_id = db::append_metric(
            &tx,
            &service.id,
            checked_at,
            evaluation.response_time,
            evaluation.status,
            uptime,
        )?;
        tx.commit()?;

        Ok(RecordedCheck {
            log_id,
            metric_id,
            checked_at,
            uptime,
            total_monitored_time,
            online_time,
        })
    }
}

/// Seconds credited to the monitored-time counters for a check at `now`.
/// The gap since the previous check counts, capped at two intervals so
/// downtime of the engine itself is not attributed to the service. The
/// first check credits one interval. Never negative.
pub fn accrued_seconds(last_checked: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: u32) -> i64 {
    let interval = i64::from(interval.max(1));
    match last_checked {
        None => interval,
        Some(last) => (now - last).num_seconds().clamp(0, interval * 2),
    }
}

/// Online share of monitored time as a percentage, two decimals.
pub fn uptime_percentage(online: i64, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    let pct = online as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
