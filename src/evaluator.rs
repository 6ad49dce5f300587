use crate::config::EngineConfig;
use crate::models::{NotifyEvent, ServiceStatus};
use crate::probe::{ProbeOutcome, ProbeResult};
use serde::Serialize;

/// Pure status policy: turns a probe result into a service status.
#[derive(Debug, Clone, Copy)]
pub struct StatusEvaluator {
    pub degraded_response_ms: Option<u32>,
    pub ssl_warning_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub previous: ServiceStatus,
    pub status: ServiceStatus,
    pub transitioned: bool,
    pub is_failure: bool,
    pub response_time: Option<u32>,
    pub message: String,
}

impl Evaluation {
    /// Status event raised by this check, if any. Failure events fire on every
    /// failing check (rules count the streak); `up` only on recovery.
    pub fn status_event(&self) -> Option<NotifyEvent> {
        match self.status {
            ServiceStatus::Offline | ServiceStatus::Timeout => Some(NotifyEvent::Down),
            ServiceStatus::Degraded => Some(NotifyEvent::Degraded),
            ServiceStatus::Online if self.previous.is_failure() => Some(NotifyEvent::Up),
            _ => None,
        }
    }
}

impl StatusEvaluator {
    pub fn from_config(config: &EngineConfig) -> Self {
        StatusEvaluator {
            degraded_response_ms: config.degraded_response_ms,
            ssl_warning_days: config.ssl_warning_days,
        }
    }

    pub fn evaluate(&self, previous: ServiceStatus, probe: &ProbeResult) -> Evaluation {
        let (status, message) = match &probe.outcome {
            ProbeOutcome::Online { response_time_ms, detail } => match self.degraded_response_ms {
                Some(limit) if *response_time_ms > limit => (
                    ServiceStatus::Degraded,
                    format!("{} (slow: {}ms > {}ms)", detail, response_time_ms, limit),
                ),
                _ => (ServiceStatus::Online, detail.clone()),
            },
            ProbeOutcome::Degraded { detail, .. } => (ServiceStatus::Degraded, detail.clone()),
            ProbeOutcome::Offline { detail, .. } => (ServiceStatus::Offline, detail.clone()),
            ProbeOutcome::Timeout { .. } => (ServiceStatus::Timeout, probe.outcome.detail()),
        };

        Evaluation {
            previous,
            status,
            transitioned: status != previous,
            is_failure: status.is_failure(),
            response_time: Some(probe.outcome.response_time_ms()),
            message,
        }
    }

    /// Certificate event for the days left, if inside a notification band.
    pub fn ssl_event(&self, days_remaining: Option<i64>) -> Option<NotifyEvent> {
        match days_remaining? {
            d if d <= 0 => Some(NotifyEvent::SslExpiry),
            d if d <= self.ssl_warning_days => Some(NotifyEvent::SslWarning),
            _ => None,
        }
    }
}
