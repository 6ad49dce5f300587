use crate::db::Db;
use crate::error::Result;
use crate::models::{MaintenanceWindow, Recurrence};
use chrono::{DateTime, Datelike, Duration, Months, Utc};
use std::sync::Arc;

impl MaintenanceWindow {
    /// Whether `now` falls inside this window, or inside the latest occurrence
    /// of it when the window recurs. Both ends are inclusive.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match (self.is_recurring, self.recurrence) {
            (true, Some(pattern)) => {
                let length = self.ends_at - self.starts_at;
                self.occurrence_start(pattern, now)
                    .map(|start| now <= start + length)
                    .unwrap_or(false)
            }
            _ => self.starts_at <= now && now <= self.ends_at,
        }
    }

    /// Start of the latest occurrence beginning at or before `now`.
    fn occurrence_start(&self, pattern: Recurrence, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now < self.starts_at {
            return None;
        }
        match pattern {
            Recurrence::Daily | Recurrence::Weekly => {
                let period = if pattern == Recurrence::Daily { Duration::days(1) } else { Duration::weeks(1) };
                let periods = (now - self.starts_at).num_seconds() / period.num_seconds();
                Some(self.starts_at + period * periods as i32)
            }
            Recurrence::Monthly => {
                let months = (now.year() - self.starts_at.year()) * 12
                    + now.month() as i32
                    - self.starts_at.month() as i32;
                (0..=months.max(0) as u32)
                    .rev()
                    .filter_map(|m| self.starts_at.checked_add_months(Months::new(m)))
                    .find(|start| *start <= now)
            }
        }
    }
}

/// Answers whether notification dispatch for a service is currently withheld.
/// Checks and history recording never consult it.
#[derive(Clone)]
pub struct MaintenanceGate {
    db: Arc<Db>,
}

impl MaintenanceGate {
    pub fn new(db: Arc<Db>) -> Self {
        MaintenanceGate { db }
    }

    /// Every window covering `now`, for any service.
    pub fn covering_windows(&self, now: DateTime<Utc>) -> Result<Vec<MaintenanceWindow>> {
        Ok(self
            .db
            .get_active_maintenance_windows(now)?
            .into_iter()
            .filter(|w| w.covers(now))
            .collect())
    }

    /// Windows covering `now` that apply to this service (its own or global ones).
    pub fn windows_for(&self, service_id: &str, now: DateTime<Utc>) -> Result<Vec<MaintenanceWindow>> {
        Ok(self
            .covering_windows(now)?
            .into_iter()
            .filter(|w| w.service_id.as_deref().map_or(true, |id| id == service_id))
            .collect())
    }

    pub fn is_suppressed(&self, service_id: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(!self.windows_for(service_id, now)?.is_empty())
    }
}
