use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Text-backed enums: stored as their lowercase name in SQLite and JSON.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Tcp,
    Dns,
    Db,
}

text_enum!(CheckType { Http => "http", Tcp => "tcp", Dns => "dns", Db => "db" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Unknown,
    Online,
    Degraded,
    Offline,
    Timeout,
}

text_enum!(ServiceStatus {
    Unknown => "unknown",
    Online => "online",
    Degraded => "degraded",
    Offline => "offline",
    Timeout => "timeout",
});

impl ServiceStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Degraded | Self::Offline | Self::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    Down,
    Up,
    Degraded,
    SslExpiry,
    SslWarning,
    Test,
}

text_enum!(NotifyEvent {
    Down => "down",
    Up => "up",
    Degraded => "degraded",
    SslExpiry => "ssl_expiry",
    SslWarning => "ssl_warning",
    Test => "test",
});

impl NotifyEvent {
    pub fn is_ssl(&self) -> bool {
        matches!(self, Self::SslExpiry | Self::SslWarning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

text_enum!(DeliveryStatus { Sent => "sent", Failed => "failed" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
}

text_enum!(Recurrence { Daily => "daily", Weekly => "weekly", Monthly => "monthly" });

#[derive(Debug, Serialize, Clone)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub check_type: CheckType,
    pub target: String,
    pub check_interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_match: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u32>,
    pub uptime: f64,
    pub total_monitored_time: i64,
    pub online_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_expiry_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_days_remaining: Option<i64>,
    pub is_active: bool,
    pub is_deleted: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NewService {
    pub name: String,
    pub check_type: CheckType,
    pub target: String,
    #[serde(default = "default_interval")]
    pub check_interval: u32,
    pub content_match: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_interval() -> u32 { 60 }

impl NewService {
    pub fn new(name: &str, check_type: CheckType, target: &str) -> Self {
        NewService {
            name: name.to_string(),
            check_type,
            target: target.to_string(),
            check_interval: default_interval(),
            content_match: None,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ServiceLog {
    pub id: i64,
    pub service_id: String,
    pub checked_at: DateTime<Utc>,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u32>,
    pub message: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct PerformanceMetric {
    pub id: i64,
    pub service_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u32>,
    pub status: ServiceStatus,
    pub uptime: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
    pub is_enabled: bool,
    pub is_default: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NewChannel {
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
    #[serde(default)]
    pub is_default: bool,
}

/// Declarative rule definition. Runtime counters live in [`RuleState`].
#[derive(Debug, Serialize, Clone)]
pub struct NotificationRule {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub channel_id: String,
    pub events: Vec<NotifyEvent>,
    pub threshold: u32,
    /// Seconds between repeat firings of the same event.
    pub cooldown: u32,
    pub is_enabled: bool,
}

impl NotificationRule {
    pub fn listens_to(&self, event: NotifyEvent) -> bool {
        self.events.contains(&event)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NewRule {
    pub service_id: Option<String>,
    pub channel_id: String,
    pub events: Vec<NotifyEvent>,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown: u32,
}

fn default_threshold() -> u32 { 1 }
fn default_cooldown() -> u32 { 300 }

/// Mutable per-(rule, service) bookkeeping, written only by the notification engine.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RuleState {
    pub rule_id: String,
    pub service_id: String,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_notified: Option<DateTime<Utc>>,
    /// Last attempted dispatch per event name.
    pub event_marks: BTreeMap<String, DateTime<Utc>>,
}

impl RuleState {
    pub fn fresh(rule_id: &str, service_id: &str) -> Self {
        RuleState {
            rule_id: rule_id.to_string(),
            service_id: service_id.to_string(),
            consecutive_failures: 0,
            last_notified: None,
            event_marks: BTreeMap::new(),
        }
    }

    pub fn last_notified_for(&self, event: NotifyEvent) -> Option<DateTime<Utc>> {
        self.event_marks.get(event.as_str()).copied()
    }

    pub fn mark_notified(&mut self, event: NotifyEvent, at: DateTime<Utc>) {
        self.last_notified = Some(at);
        self.event_marks.insert(event.as_str().to_string(), at);
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct NotificationHistory {
    pub id: i64,
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub event: NotifyEvent,
    pub message: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHistory {
    pub channel_id: String,
    pub service_id: Option<String>,
    pub rule_id: Option<String>,
    pub event: NotifyEvent,
    pub message: String,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone)]
pub struct MaintenanceWindow {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub is_recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    pub is_active: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NewMaintenanceWindow {
    pub service_id: Option<String>,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

/// Parse a comma-separated event list, dropping unknown names.
pub(crate) fn parse_events(raw: &str) -> Vec<NotifyEvent> {
    raw.split(',')
        .filter_map(|s| s.parse().ok())
        .collect()
}

pub(crate) fn events_to_string(events: &[NotifyEvent]) -> String {
    events.iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
