use crate::error::{Error, Result};
use crate::models::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Db { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Exclusive access to the connection. Critical sections stay within one call.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                check_type TEXT NOT NULL,
                target TEXT NOT NULL,
                check_interval INTEGER NOT NULL DEFAULT 60,
                content_match TEXT,
                headers TEXT,
                status TEXT NOT NULL DEFAULT 'unknown',
                response_time INTEGER,
                uptime REAL NOT NULL DEFAULT 100,
                total_monitored_time INTEGER NOT NULL DEFAULT 0,
                online_time INTEGER NOT NULL DEFAULT 0,
                last_checked TEXT,
                ssl_expiry_date TEXT,
                ssl_days_remaining INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS service_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id TEXT NOT NULL REFERENCES services(id) ON DELETE CASCADE,
                checked_at TEXT NOT NULL,
                status TEXT NOT NULL,
                response_time INTEGER,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_service_logs_service ON service_logs(service_id, id DESC);

            CREATE TABLE IF NOT EXISTS performance_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id TEXT NOT NULL REFERENCES services(id) ON DELETE CASCADE,
                recorded_at TEXT NOT NULL,
                response_time INTEGER,
                status TEXT NOT NULL,
                uptime REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_service ON performance_metrics(service_id, recorded_at);

            CREATE TABLE IF NOT EXISTS notification_channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                config TEXT NOT NULL,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS notification_rules (
                id TEXT PRIMARY KEY,
                service_id TEXT REFERENCES services(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES notification_channels(id) ON DELETE CASCADE,
                events TEXT NOT NULL,
                threshold INTEGER NOT NULL DEFAULT 1,
                cooldown INTEGER NOT NULL DEFAULT 300,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_rules_service ON notification_rules(service_id);

            CREATE TABLE IF NOT EXISTS notification_rule_state (
                rule_id TEXT NOT NULL REFERENCES notification_rules(id) ON DELETE CASCADE,
                service_id TEXT NOT NULL REFERENCES services(id) ON DELETE CASCADE,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_notified TEXT,
                event_marks TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (rule_id, service_id)
            );

            CREATE TABLE IF NOT EXISTS notification_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                service_id TEXT,
                rule_id TEXT,
                event TEXT NOT NULL,
                message TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_service ON notification_history(service_id, id DESC);

            CREATE TABLE IF NOT EXISTS maintenance_windows (
                id TEXT PRIMARY KEY,
                service_id TEXT REFERENCES services(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                starts_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                recurrence_pattern TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        ")?;
        Ok(())
    }

    // ── Services ──

    pub fn create_service(&self, input: &NewService) -> Result<Service> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO services (id, name, check_type, target, check_interval, content_match, headers)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    input.name.trim(),
                    input.check_type,
                    input.target.trim(),
                    input.check_interval.max(1),
                    input.content_match,
                    headers_to_string(&input.headers)?,
                ],
            )?;
        }
        self.get_service(&id)?
            .ok_or_else(|| Error::not_found(format!("service {}", id)))
    }

    /// Replace a service's check configuration. Status and counters are untouched.
    pub fn update_service_config(&self, id: &str, input: &NewService) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE services SET name = ?1, check_type = ?2, target = ?3, check_interval = ?4,
                    content_match = ?5, headers = ?6, updated_at = datetime('now')
             WHERE id = ?7 AND is_deleted = 0",
            params![
                input.name.trim(),
                input.check_type,
                input.target.trim(),
                input.check_interval.max(1),
                input.content_match,
                headers_to_string(&input.headers)?,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("service {}", id)));
        }
        Ok(())
    }

    pub fn set_service_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE services SET is_active = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![active, id],
        )?;
        Ok(())
    }

    /// Logical removal: the row stays but is excluded from scheduling and listing.
    pub fn soft_delete_service(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE services SET is_deleted = 1, updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Physical removal, cascading to logs, metrics, rules and windows.
    pub fn purge_service(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM services WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn get_service(&self, id: &str) -> Result<Option<Service>> {
        let conn = self.conn();
        let service = conn
            .query_row(
                &format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS),
                params![id],
                row_to_service,
            )
            .optional()?;
        Ok(service)
    }

    pub fn get_active_services(&self) -> Result<Vec<Service>> {
        self.query_services("WHERE is_active = 1 AND is_deleted = 0")
    }

    pub fn list_services(&self) -> Result<Vec<Service>> {
        self.query_services("WHERE is_deleted = 0")
    }

    fn query_services(&self, filter: &str) -> Result<Vec<Service>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services {} ORDER BY name ASC",
            SERVICE_COLUMNS, filter
        ))?;
        let services = stmt
            .query_map([], row_to_service)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(services)
    }

    pub fn get_service_logs(&self, service_id: &str, limit: u32) -> Result<Vec<ServiceLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, service_id, checked_at, status, response_time, message
             FROM service_logs WHERE service_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let logs = stmt
            .query_map(params![service_id, limit], |row| {
                Ok(ServiceLog {
                    id: row.get(0)?,
                    service_id: row.get(1)?,
                    checked_at: row.get(2)?,
                    status: row.get(3)?,
                    response_time: row.get(4)?,
                    message: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    pub fn get_service_metrics(&self, service_id: &str, since: DateTime<Utc>) -> Result<Vec<PerformanceMetric>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, service_id, recorded_at, response_time, status, uptime
             FROM performance_metrics WHERE service_id = ?1 AND recorded_at >= ?2 ORDER BY id ASC",
        )?;
        let metrics = stmt
            .query_map(params![service_id, since], |row| {
                Ok(PerformanceMetric {
                    id: row.get(0)?,
                    service_id: row.get(1)?,
                    recorded_at: row.get(2)?,
                    response_time: row.get(3)?,
                    status: row.get(4)?,
                    uptime: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metrics)
    }

    // ── Channels & Rules ──

    pub fn create_channel(&self, input: &NewChannel) -> Result<NotificationChannel> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO notification_channels (id, name, channel_type, config, is_default) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, input.name, input.channel_type.to_lowercase(), input.config.to_string(), input.is_default],
        )?;
        Ok(NotificationChannel {
            id,
            name: input.name.clone(),
            channel_type: input.channel_type.to_lowercase(),
            config: input.config.clone(),
            is_enabled: true,
            is_default: input.is_default,
        })
    }

    pub fn set_channel_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE notification_channels SET is_enabled = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        Ok(())
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<NotificationChannel>> {
        let conn = self.conn();
        let channel = conn
            .query_row(
                "SELECT id, name, channel_type, config, is_enabled, is_default FROM notification_channels WHERE id = ?1",
                params![id],
                row_to_channel,
            )
            .optional()?;
        Ok(channel)
    }

    pub fn create_rule(&self, input: &NewRule) -> Result<NotificationRule> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO notification_rules (id, service_id, channel_id, events, threshold, cooldown) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, input.service_id, input.channel_id, events_to_string(&input.events), input.threshold, input.cooldown],
        )?;
        Ok(NotificationRule {
            id,
            service_id: input.service_id.clone(),
            channel_id: input.channel_id.clone(),
            events: input.events.clone(),
            threshold: input.threshold,
            cooldown: input.cooldown,
            is_enabled: true,
        })
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE notification_rules SET is_enabled = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        Ok(())
    }

    /// Enabled rules bound to this service or global, whose channel is enabled,
    /// paired with that channel.
    pub fn get_rules_for(&self, service_id: &str) -> Result<Vec<(NotificationRule, NotificationChannel)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.service_id, r.channel_id, r.events, r.threshold, r.cooldown, r.is_enabled,
                    c.id, c.name, c.channel_type, c.config, c.is_enabled, c.is_default
             FROM notification_rules r
             JOIN notification_channels c ON c.id = r.channel_id
             WHERE r.is_enabled = 1 AND c.is_enabled = 1
               AND (r.service_id IS NULL OR r.service_id = ?1)
             ORDER BY r.created_at ASC, r.id ASC",
        )?;
        let rules = stmt
            .query_map(params![service_id], |row| {
                let events: String = row.get(3)?;
                let rule = NotificationRule {
                    id: row.get(0)?,
                    service_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    events: parse_events(&events),
                    threshold: row.get(4)?,
                    cooldown: row.get(5)?,
                    is_enabled: row.get(6)?,
                };
                let config: String = row.get(10)?;
                let channel = NotificationChannel {
                    id: row.get(7)?,
                    name: row.get(8)?,
                    channel_type: row.get(9)?,
                    config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
                    is_enabled: row.get(11)?,
                    is_default: row.get(12)?,
                };
                Ok((rule, channel))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    pub fn get_rule_state(&self, rule_id: &str, service_id: &str) -> Result<RuleState> {
        let conn = self.conn();
        Ok(load_rule_state(&conn, rule_id, service_id)?
            .unwrap_or_else(|| RuleState::fresh(rule_id, service_id)))
    }

    /// Read-modify-write a rule's runtime state inside one immediate transaction,
    /// so concurrent evaluations of a shared rule serialize on it.
    pub fn with_rule_state<T>(
        &self,
        rule_id: &str,
        service_id: &str,
        f: impl FnOnce(&mut RuleState) -> T,
    ) -> Result<T> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut state = load_rule_state(&tx, rule_id, service_id)?
            .unwrap_or_else(|| RuleState::fresh(rule_id, service_id));
        let before = state.clone();
        let out = f(&mut state);
        if state != before {
            update_rule_state(&tx, &state)?;
        }
        tx.commit()?;
        Ok(out)
    }

    /// Zero every failure streak tracked for a service.
    pub fn reset_rule_failures(&self, service_id: &str) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE notification_rule_state SET consecutive_failures = 0
             WHERE service_id = ?1 AND consecutive_failures > 0",
            params![service_id],
        )?;
        Ok(n)
    }

    // ── Notification History ──

    pub fn append_notification_history(&self, entry: &NewHistory) -> Result<NotificationHistory> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO notification_history (channel_id, service_id, rule_id, event, message, status, error_message, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.channel_id,
                entry.service_id,
                entry.rule_id,
                entry.event,
                entry.message,
                entry.status,
                entry.error_message,
                entry.sent_at,
            ],
        )?;
        Ok(NotificationHistory {
            id: conn.last_insert_rowid(),
            channel_id: entry.channel_id.clone(),
            service_id: entry.service_id.clone(),
            rule_id: entry.rule_id.clone(),
            event: entry.event,
            message: entry.message.clone(),
            status: entry.status,
            error_message: entry.error_message.clone(),
            sent_at: entry.sent_at,
        })
    }

    pub fn list_notification_history(&self, service_id: Option<&str>, limit: u32) -> Result<Vec<NotificationHistory>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, service_id, rule_id, event, message, status, error_message, sent_at
             FROM notification_history
             WHERE (?1 IS NULL OR service_id = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let history = stmt
            .query_map(params![service_id, limit], |row| {
                Ok(NotificationHistory {
                    id: row.get(0)?,
                    channel_id: row.get(1)?,
                    service_id: row.get(2)?,
                    rule_id: row.get(3)?,
                    event: row.get(4)?,
                    message: row.get(5)?,
                    status: row.get(6)?,
                    error_message: row.get(7)?,
                    sent_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(history)
    }

    // ── Maintenance Windows ──

    pub fn create_maintenance_window(&self, input: &NewMaintenanceWindow) -> Result<MaintenanceWindow> {
        if input.ends_at <= input.starts_at {
            return Err(Error::config("ends_at must be after starts_at"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO maintenance_windows (id, service_id, title, starts_at, ends_at, is_recurring, recurrence_pattern)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                input.service_id,
                input.title.trim(),
                input.starts_at,
                input.ends_at,
                input.recurrence.is_some(),
                input.recurrence,
            ],
        )?;
        Ok(MaintenanceWindow {
            id,
            service_id: input.service_id.clone(),
            title: input.title.trim().to_string(),
            starts_at: input.starts_at,
            ends_at: input.ends_at,
            is_recurring: input.recurrence.is_some(),
            recurrence: input.recurrence,
            is_active: true,
        })
    }

    pub fn set_maintenance_window_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE maintenance_windows SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(())
    }

    /// Active windows that have started by `now`. Recurring windows are returned
    /// unexpanded; callers decide coverage.
    pub fn get_active_maintenance_windows(&self, now: DateTime<Utc>) -> Result<Vec<MaintenanceWindow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, service_id, title, starts_at, ends_at, is_recurring, recurrence_pattern, is_active
             FROM maintenance_windows
             WHERE is_active = 1 AND starts_at <= ?1
             ORDER BY starts_at ASC",
        )?;
        let windows = stmt
            .query_map(params![now], |row| {
                let pattern: Option<String> = row.get(6)?;
                Ok(MaintenanceWindow {
                    id: row.get(0)?,
                    service_id: row.get(1)?,
                    title: row.get(2)?,
                    starts_at: row.get(3)?,
                    ends_at: row.get(4)?,
                    is_recurring: row.get(5)?,
                    recurrence: pattern.and_then(|p| p.parse().ok()),
                    is_active: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(windows)
    }
}

// ── Per-check writes (run inside the recorder's transaction) ──

/// Running counters read before a status update.
#[derive(Debug, Clone)]
pub struct ServiceCounters {
    pub last_checked: Option<DateTime<Utc>>,
    pub total_monitored_time: i64,
    pub online_time: i64,
}

pub struct StatusUpdate<'a> {
    pub service_id: &'a str,
    pub status: ServiceStatus,
    pub response_time: Option<u32>,
    pub checked_at: DateTime<Utc>,
    pub total_monitored_time: i64,
    pub online_time: i64,
    pub uptime: f64,
    pub ssl_expiry_date: Option<DateTime<Utc>>,
    pub ssl_days_remaining: Option<i64>,
}

pub fn load_counters(conn: &Connection, service_id: &str) -> Result<ServiceCounters> {
    conn.query_row(
        "SELECT last_checked, total_monitored_time, online_time FROM services WHERE id = ?1",
        params![service_id],
        |row| {
            Ok(ServiceCounters {
                last_checked: row.get(0)?,
                total_monitored_time: row.get(1)?,
                online_time: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("service {}", service_id)))
}

pub fn update_service_status(conn: &Connection, update: &StatusUpdate<'_>) -> Result<()> {
    conn.execute(
        "UPDATE services SET status = ?1, response_time = ?2, last_checked = ?3,
                total_monitored_time = ?4, online_time = ?5, uptime = ?6,
                ssl_expiry_date = COALESCE(?7, ssl_expiry_date),
                ssl_days_remaining = COALESCE(?8, ssl_days_remaining)
         WHERE id = ?9",
        params![
            update.status,
            update.response_time,
            update.checked_at,
            update.total_monitored_time,
            update.online_time,
            update.uptime,
            update.ssl_expiry_date,
            update.ssl_days_remaining,
            update.service_id,
        ],
    )?;
    Ok(())
}

pub fn append_log(
    conn: &Connection,
    service_id: &str,
    checked_at: DateTime<Utc>,
    status: ServiceStatus,
    response_time: Option<u32>,
    message: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO service_logs (service_id, checked_at, status, response_time, message) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![service_id, checked_at, status, response_time, message],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn append_metric(
    conn: &Connection,
    service_id: &str,
    recorded_at: DateTime<Utc>,
    response_time: Option<u32>,
    status: ServiceStatus,
    uptime: f64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO performance_metrics (service_id, recorded_at, response_time, status, uptime) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![service_id, recorded_at, response_time, status, uptime],
    )?;
    Ok(conn.last_insert_rowid())
}

fn load_rule_state(conn: &Connection, rule_id: &str, service_id: &str) -> Result<Option<RuleState>> {
    let row = conn
        .query_row(
            "SELECT consecutive_failures, last_notified, event_marks FROM notification_rule_state
             WHERE rule_id = ?1 AND service_id = ?2",
            params![rule_id, service_id],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, Option<DateTime<Utc>>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((consecutive_failures, last_notified, marks)) => Ok(Some(RuleState {
            rule_id: rule_id.to_string(),
            service_id: service_id.to_string(),
            consecutive_failures,
            last_notified,
            event_marks: serde_json::from_str(&marks)?,
        })),
        None => Ok(None),
    }
}

pub fn update_rule_state(conn: &Connection, state: &RuleState) -> Result<()> {
    conn.execute(
        "INSERT INTO notification_rule_state (rule_id, service_id, consecutive_failures, last_notified, event_marks)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(rule_id, service_id) DO UPDATE SET
           consecutive_failures = excluded.consecutive_failures,
           last_notified = excluded.last_notified,
           event_marks = excluded.event_marks",
        params![
            state.rule_id,
            state.service_id,
            state.consecutive_failures,
            state.last_notified,
            serde_json::to_string(&state.event_marks)?,
        ],
    )?;
    Ok(())
}

const SERVICE_COLUMNS: &str = "id, name, check_type, target, check_interval, content_match, headers, status, response_time, uptime, total_monitored_time, online_time, last_checked, ssl_expiry_date, ssl_days_remaining, is_active, is_deleted";

fn row_to_service(row: &Row) -> rusqlite::Result<Service> {
    let headers: Option<String> = row.get(6)?;
    Ok(Service {
        id: row.get(0)?,
        name: row.get(1)?,
        check_type: row.get(2)?,
        target: row.get(3)?,
        check_interval: row.get(4)?,
        content_match: row.get::<_, Option<String>>(5)?.filter(|s| !s.is_empty()),
        headers: headers
            .and_then(|h| serde_json::from_str(&h).ok())
            .unwrap_or_default(),
        status: row.get(7)?,
        response_time: row.get(8)?,
        uptime: row.get(9)?,
        total_monitored_time: row.get(10)?,
        online_time: row.get(11)?,
        last_checked: row.get(12)?,
        ssl_expiry_date: row.get(13)?,
        ssl_days_remaining: row.get(14)?,
        is_active: row.get(15)?,
        is_deleted: row.get(16)?,
    })
}

fn row_to_channel(row: &Row) -> rusqlite::Result<NotificationChannel> {
    let config: String = row.get(3)?;
    Ok(NotificationChannel {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_type: row.get(2)?,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        is_enabled: row.get(4)?,
        is_default: row.get(5)?,
    })
}

fn headers_to_string(headers: &BTreeMap<String, String>) -> Result<Option<String>> {
    if headers.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(headers)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(db: &Db) -> Service {
        db.create_service(&NewService::new("API", CheckType::Http, "https://example.com")).unwrap()
    }

    #[test]
    fn test_create_and_get_service() {
        let db = Db::open_in_memory().unwrap();
        let mut input = NewService::new("API", CheckType::Http, "https://example.com/health");
        input.headers.insert("X-Token".into(), "abc".into());
        input.content_match = Some("/ok/i".into());
        let created = db.create_service(&input).unwrap();

        let fetched = db.get_service(&created.id).unwrap().unwrap();
        assert_eq!(fetched.status, ServiceStatus::Unknown);
        assert_eq!(fetched.uptime, 100.0);
        assert_eq!(fetched.headers.get("X-Token").map(String::as_str), Some("abc"));
        assert_eq!(fetched.content_match.as_deref(), Some("/ok/i"));
        assert!(fetched.is_active);
    }

    #[test]
    fn test_active_services_exclude_inactive_and_deleted() {
        let db = Db::open_in_memory().unwrap();
        let a = service(&db);
        let b = service(&db);
        let c = service(&db);
        db.set_service_active(&b.id, false).unwrap();
        db.soft_delete_service(&c.id).unwrap();

        let active: Vec<String> = db.get_active_services().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(active, vec![a.id.clone()]);
        assert_eq!(db.list_services().unwrap().len(), 2);
        // Soft-deleted rows still exist until purged
        assert!(db.get_service(&c.id).unwrap().unwrap().is_deleted);
    }

    #[test]
    fn test_purge_cascades_history() {
        let db = Db::open_in_memory().unwrap();
        let s = service(&db);
        {
            let conn = db.conn();
            append_log(&conn, &s.id, Utc::now(), ServiceStatus::Online, Some(12), "ok").unwrap();
            append_metric(&conn, &s.id, Utc::now(), Some(12), ServiceStatus::Online, 100.0).unwrap();
        }
        assert_eq!(db.get_service_logs(&s.id, 10).unwrap().len(), 1);

        assert!(db.purge_service(&s.id).unwrap());
        assert!(db.get_service(&s.id).unwrap().is_none());
        let conn = db.conn();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM performance_metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_rules_for_service_include_global_and_skip_disabled_channels() {
        let db = Db::open_in_memory().unwrap();
        let s = service(&db);
        let other = service(&db);
        let ch = db.create_channel(&NewChannel {
            name: "hook".into(),
            channel_type: "webhook".into(),
            config: serde_json::json!({"url": "http://localhost/hook"}),
            is_default: false,
        }).unwrap();
        let muted = db.create_channel(&NewChannel {
            name: "muted".into(),
            channel_type: "webhook".into(),
            config: serde_json::json!({"url": "http://localhost/muted"}),
            is_default: false,
        }).unwrap();
        db.set_channel_enabled(&muted.id, false).unwrap();

        let rule = |service_id: Option<&str>, channel_id: &str| NewRule {
            service_id: service_id.map(String::from),
            channel_id: channel_id.to_string(),
            events: vec![NotifyEvent::Down],
            threshold: 1,
            cooldown: 60,
        };
        db.create_rule(&rule(Some(&s.id), &ch.id)).unwrap();
        db.create_rule(&rule(None, &ch.id)).unwrap();
        db.create_rule(&rule(Some(&other.id), &ch.id)).unwrap();
        db.create_rule(&rule(Some(&s.id), &muted.id)).unwrap();
        let disabled = db.create_rule(&rule(Some(&s.id), &ch.id)).unwrap();
        db.set_rule_enabled(&disabled.id, false).unwrap();

        let rules = db.get_rules_for(&s.id).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|(r, _)| r.service_id.is_none()));
        assert!(rules.iter().all(|(_, c)| c.id == ch.id));
    }

    #[test]
    fn test_rule_state_read_modify_write() {
        let db = Db::open_in_memory().unwrap();
        let s = service(&db);
        let ch = db.create_channel(&NewChannel {
            name: "hook".into(),
            channel_type: "webhook".into(),
            config: serde_json::json!({"url": "http://localhost/hook"}),
            is_default: false,
        }).unwrap();
        let rule = db.create_rule(&NewRule {
            service_id: None,
            channel_id: ch.id.clone(),
            events: vec![NotifyEvent::Down],
            threshold: 2,
            cooldown: 60,
        }).unwrap();

        let at = Utc::now();
        let count = db.with_rule_state(&rule.id, &s.id, |state| {
            state.consecutive_failures += 1;
            state.mark_notified(NotifyEvent::Down, at);
            state.consecutive_failures
        }).unwrap();
        assert_eq!(count, 1);

        let stored = db.get_rule_state(&rule.id, &s.id).unwrap();
        assert_eq!(stored.consecutive_failures, 1);
        assert_eq!(stored.last_notified_for(NotifyEvent::Down), Some(at));

        assert_eq!(db.reset_rule_failures(&s.id).unwrap(), 1);
        assert_eq!(db.get_rule_state(&rule.id, &s.id).unwrap().consecutive_failures, 0);
        // lastNotified survives a reset
        assert!(db.get_rule_state(&rule.id, &s.id).unwrap().last_notified.is_some());
    }

    #[test]
    fn test_history_filter_by_service() {
        let db = Db::open_in_memory().unwrap();
        let entry = |service_id: Option<&str>| NewHistory {
            channel_id: "ch".into(),
            service_id: service_id.map(String::from),
            rule_id: None,
            event: NotifyEvent::Down,
            message: "down".into(),
            status: DeliveryStatus::Sent,
            error_message: None,
            sent_at: Utc::now(),
        };
        db.append_notification_history(&entry(Some("a"))).unwrap();
        db.append_notification_history(&entry(Some("b"))).unwrap();
        db.append_notification_history(&entry(None)).unwrap();

        assert_eq!(db.list_notification_history(None, 10).unwrap().len(), 3);
        let only_a = db.list_notification_history(Some("a"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_maintenance_window_requires_positive_duration() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        let err = db.create_maintenance_window(&NewMaintenanceWindow {
            service_id: None,
            title: "bad".into(),
            starts_at: now,
            ends_at: now,
            recurrence: None,
        });
        assert!(err.is_err());
    }
}
