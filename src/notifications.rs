use crate::channels::{ChannelConfig, ChannelSender, DeliveryOutcome, RenderedMessage};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::evaluator::Evaluation;
use crate::maintenance::MaintenanceGate;
use crate::models::{
    DeliveryStatus, NewHistory, NotificationChannel, NotificationHistory, NotificationRule,
    NotifyEvent, RuleState, Service, ServiceStatus,
};
use crate::sse::{self, EngineEvent, EventBroadcaster};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a rule does with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Fire,
    BelowThreshold,
    CoolingDown,
}

/// Apply one event to a rule's state and decide whether it fires.
///
/// Failure events grow the streak; the rule fires when the streak first
/// reaches the threshold, then again only once the cooldown for that event
/// has passed. `up` clears the streak and always fires. Certificate events
/// are gated by cooldown alone. The caller marks the state as notified when
/// it actually dispatches.
pub fn decide(rule: &NotificationRule, state: &mut RuleState, event: NotifyEvent, now: DateTime<Utc>) -> Decision {
    match event {
        NotifyEvent::Down | NotifyEvent::Degraded => {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let threshold = rule.threshold.max(1);
            if state.consecutive_failures < threshold {
                Decision::BelowThreshold
            } else if state.consecutive_failures == threshold || cooled_down(rule, state, event, now) {
                Decision::Fire
            } else {
                Decision::CoolingDown
            }
        }
        NotifyEvent::Up => {
            state.consecutive_failures = 0;
            Decision::Fire
        }
        NotifyEvent::SslExpiry | NotifyEvent::SslWarning => {
            if cooled_down(rule, state, event, now) {
                Decision::Fire
            } else {
                Decision::CoolingDown
            }
        }
        NotifyEvent::Test => Decision::Fire,
    }
}

fn cooled_down(rule: &NotificationRule, state: &RuleState, event: NotifyEvent, now: DateTime<Utc>) -> bool {
    match state.last_notified_for(event) {
        None => true,
        Some(last) => now - last >= Duration::seconds(i64::from(rule.cooldown)),
    }
}

/// Turns check evaluations into channel deliveries.
pub struct NotificationEngine {
    db: Arc<Db>,
    gate: MaintenanceGate,
    sender: Arc<dyn ChannelSender>,
    broadcaster: Arc<EventBroadcaster>,
}

impl NotificationEngine {
    pub fn new(
        db: Arc<Db>,
        gate: MaintenanceGate,
        sender: Arc<dyn ChannelSender>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        NotificationEngine { db, gate, sender, broadcaster }
    }

    /// Run every matching rule for the events raised by one check. Returns
    /// the history rows written for deliveries attempted.
    pub async fn handle_check(
        &self,
        service: &Service,
        evaluation: &Evaluation,
        ssl_event: Option<NotifyEvent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationHistory>> {
        if evaluation.status == ServiceStatus::Online {
            self.db.reset_rule_failures(&service.id)?;
        }

        let events: Vec<NotifyEvent> = evaluation.status_event().into_iter().chain(ssl_event).collect();
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let rules = self.db.get_rules_for(&service.id)?;
        let candidates: Vec<(NotifyEvent, &NotificationRule, &NotificationChannel)> = events
            .iter()
            .flat_map(|&event| {
                rules
                    .iter()
                    .filter(move |(rule, _)| rule.listens_to(event))
                    .map(move |(rule, channel)| (event, rule, channel))
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let suppressed = self.gate.is_suppressed(&service.id, now)?;
        let mut sent = Vec::new();

        for (event, rule, channel) in candidates {
            let decision = self.db.with_rule_state(&rule.id, &service.id, |state| {
                let decision = decide(rule, state, event, now);
                if decision == Decision::Fire && !suppressed {
                    state.mark_notified(event, now);
                }
                (decision, state.consecutive_failures)
            });

            let (decision, streak) = match decision {
                Ok(d) => d,
                Err(e) => {
                    warn!(rule_id = %rule.id, service_id = %service.id, "rule state update failed: {}", e);
                    continue;
                }
            };
            debug!(rule_id = %rule.id, service_id = %service.id, %event, ?decision, streak, "rule evaluated");

            match decision {
                Decision::Fire if suppressed => {
                    info!(rule_id = %rule.id, service_id = %service.id, %event, "notification suppressed by maintenance window");
                }
                Decision::Fire => {
                    let message = RenderedMessage::for_service(
                        event,
                        service,
                        evaluation,
                        service_ssl_days(service, event),
                        now,
                    );
                    match self.dispatch(Some(&rule.id), channel, Some(&service.id), &message, now).await {
                        Ok(record) => sent.push(record),
                        Err(e) => warn!(rule_id = %rule.id, channel_id = %channel.id, "notification history write failed: {}", e),
                    }
                }
                Decision::BelowThreshold | Decision::CoolingDown => {}
            }
        }

        Ok(sent)
    }

    /// Send a test message over a channel, bypassing rules and maintenance.
    pub async fn test_channel(&self, channel_id: &str, now: DateTime<Utc>) -> Result<NotificationHistory> {
        let channel = self
            .db
            .get_channel(channel_id)?
            .ok_or_else(|| Error::not_found(format!("channel {}", channel_id)))?;
        let message = RenderedMessage::test(&channel.name, now);
        self.dispatch(None, &channel, None, &message, now).await
    }

    async fn dispatch(
        &self,
        rule_id: Option<&str>,
        channel: &NotificationChannel,
        service_id: Option<&str>,
        message: &RenderedMessage,
        now: DateTime<Utc>,
    ) -> Result<NotificationHistory> {
        let outcome = match ChannelConfig::from_channel(channel) {
            Ok(config) => self.sender.send(&config, message).await,
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        };

        let (status, error_message) = match outcome {
            DeliveryOutcome::Sent => {
                info!(channel_id = %channel.id, channel = %channel.name, event = %message.event, "notification sent");
                (DeliveryStatus::Sent, None)
            }
            DeliveryOutcome::Failed(reason) => {
                warn!(channel_id = %channel.id, channel = %channel.name, event = %message.event, "notification delivery failed: {}", reason);
                (DeliveryStatus::Failed, Some(reason))
            }
        };

        let record = self.db.append_notification_history(&NewHistory {
            channel_id: channel.id.clone(),
            service_id: service_id.map(String::from),
            rule_id: rule_id.map(String::from),
            event: message.event,
            message: message.text(),
            status,
            error_message,
            sent_at: now,
        })?;

        self.broadcaster.send(EngineEvent::new(
            sse::NOTIFICATION_SENT,
            service_id,
            serde_json::to_value(&record).unwrap_or_default(),
        ));
        Ok(record)
    }
}

fn service_ssl_days(service: &Service, event: NotifyEvent) -> Option<i64> {
    if event.is_ssl() {
        service.ssl_days_remaining
    } else {
        None
    }
}
