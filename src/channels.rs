use crate::config::{SmtpConfig, TlsMode};
use crate::error::{Error, Result};
use crate::evaluator::Evaluation;
use crate::models::{NotificationChannel, NotifyEvent, Service, ServiceStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

const SENDER_NAME: &str = "Fleetwatch";
const TELEGRAM_API: &str = "https://api.telegram.org";
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload format for generic webhooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Structured JSON with event, service and message fields.
    #[default]
    Json,
    /// `{"content": "...", "sender": "Fleetwatch"}` for chat-style incoming webhooks.
    Chat,
}

/// Typed channel configuration, selected by the channel's `channel_type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Webhook {
        url: String,
        #[serde(default)]
        payload_format: PayloadFormat,
    },
    Discord {
        webhook_url: String,
    },
    Slack {
        webhook_url: String,
    },
    Telegram {
        bot_token: String,
        #[serde(deserialize_with = "string_or_number")]
        chat_id: String,
        #[serde(default)]
        api_url: Option<String>,
    },
    Email {
        #[serde(default)]
        to: Vec<String>,
        #[serde(default)]
        address: Option<String>,
    },
}

impl ChannelConfig {
    pub fn from_channel(channel: &NotificationChannel) -> Result<Self> {
        let mut value = channel.config.clone();
        let obj = value.as_object_mut().ok_or_else(|| {
            Error::InvalidChannelConfig(format!("{} channel config must be a JSON object", channel.channel_type))
        })?;
        obj.insert("type".into(), serde_json::Value::String(channel.channel_type.to_lowercase()));
        let config: ChannelConfig = serde_json::from_value(value)
            .map_err(|e| Error::InvalidChannelConfig(format!("{} channel: {}", channel.channel_type, e)))?;

        if let ChannelConfig::Email { .. } = &config {
            if config.recipients().is_empty() {
                return Err(Error::InvalidChannelConfig("email channel has no recipients".into()));
            }
        }
        Ok(config)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChannelConfig::Webhook { .. } => "webhook",
            ChannelConfig::Discord { .. } => "discord",
            ChannelConfig::Slack { .. } => "slack",
            ChannelConfig::Telegram { .. } => "telegram",
            ChannelConfig::Email { .. } => "email",
        }
    }

    fn recipients(&self) -> Vec<String> {
        match self {
            ChannelConfig::Email { to, address } => to
                .iter()
                .chain(address.iter())
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageService {
    pub id: String,
    pub name: String,
    pub target: String,
    pub status: ServiceStatus,
}

/// Channel-neutral notification content.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedMessage {
    pub event: NotifyEvent,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<MessageService>,
    pub timestamp: DateTime<Utc>,
}

impl RenderedMessage {
    pub fn for_service(
        event: NotifyEvent,
        service: &Service,
        evaluation: &Evaluation,
        ssl_days_remaining: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        let title = format!("{} {}: {}", event_emoji(event), event_label(event), service.name);
        let mut body = format!(
            "Service: {}\nTarget: {}\nStatus: {}",
            service.name, service.target, evaluation.status
        );
        if let Some(ms) = evaluation.response_time {
            body.push_str(&format!("\nResponse time: {}ms", ms));
        }
        if !evaluation.message.is_empty() {
            body.push_str(&format!("\nDetail: {}", evaluation.message));
        }
        if event.is_ssl() {
            if let Some(days) = ssl_days_remaining {
                body.push_str(&format!("\nCertificate days remaining: {}", days));
            }
        }
        body.push_str(&format!("\nTime: {}", now.to_rfc3339()));
        RenderedMessage {
            event,
            title,
            body,
            service: Some(MessageService {
                id: service.id.clone(),
                name: service.name.clone(),
                target: service.target.clone(),
                status: evaluation.status,
            }),
            timestamp: now,
        }
    }

    pub fn test(channel_name: &str, now: DateTime<Utc>) -> Self {
        RenderedMessage {
            event: NotifyEvent::Test,
            title: format!("{} {}: {}", event_emoji(NotifyEvent::Test), event_label(NotifyEvent::Test), channel_name),
            body: format!("This is a test notification from {}.", SENDER_NAME),
            service: None,
            timestamp: now,
        }
    }

    /// Single-string form used for chat channels and history rows.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }

    fn markdown(&self) -> String {
        format!("**{}**\n{}", self.title, self.body)
    }
}

fn event_emoji(event: NotifyEvent) -> &'static str {
    match event {
        NotifyEvent::Down => "🔴",
        NotifyEvent::Up => "🟢",
        NotifyEvent::Degraded => "🟡",
        NotifyEvent::SslExpiry => "🔒",
        NotifyEvent::SslWarning => "⚠️",
        NotifyEvent::Test => "🧪",
    }
}

fn event_label(event: NotifyEvent) -> &'static str {
    match event {
        NotifyEvent::Down => "DOWN",
        NotifyEvent::Up => "RECOVERED",
        NotifyEvent::Degraded => "DEGRADED",
        NotifyEvent::SslExpiry => "SSL EXPIRED",
        NotifyEvent::SslWarning => "SSL EXPIRING",
        NotifyEvent::Test => "TEST",
    }
}

fn event_color(event: NotifyEvent) -> &'static str {
    match event {
        NotifyEvent::Down | NotifyEvent::SslExpiry => "#e74c3c",
        NotifyEvent::Up => "#2ecc71",
        NotifyEvent::Degraded | NotifyEvent::SslWarning => "#f39c12",
        NotifyEvent::Test => "#3498db",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
}

/// Delivers a rendered message over one channel. One attempt, no retries.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, config: &ChannelConfig, message: &RenderedMessage) -> DeliveryOutcome;
}

/// Sends over HTTP webhooks and SMTP.
pub struct ChannelDispatcher {
    client: reqwest::Client,
    smtp: Option<SmtpConfig>,
}

impl ChannelDispatcher {
    pub fn new(smtp: Option<SmtpConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(ChannelDispatcher { client, smtp })
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> DeliveryOutcome {
        match self.client.post(url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => DeliveryOutcome::Sent,
            Ok(resp) => DeliveryOutcome::Failed(format!("HTTP {}", resp.status().as_u16())),
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }

    async fn send_email(&self, recipients: &[String], message: &RenderedMessage) -> DeliveryOutcome {
        let smtp = match &self.smtp {
            Some(c) => c,
            None => return DeliveryOutcome::Failed("SMTP not configured (set SMTP_HOST)".into()),
        };
        let transport = match build_transport(smtp) {
            Ok(t) => t,
            Err(e) => return DeliveryOutcome::Failed(format!("could not build SMTP transport: {}", e)),
        };
        let from: Mailbox = match smtp.from_address.parse() {
            Ok(m) => m,
            Err(e) => return DeliveryOutcome::Failed(format!("invalid SMTP_FROM '{}': {}", smtp.from_address, e)),
        };

        let mut failures = Vec::new();
        for address in recipients {
            let to: Mailbox = match address.parse() {
                Ok(a) => a,
                Err(e) => {
                    failures.push(format!("{}: {}", address, e));
                    continue;
                }
            };
            let email = Message::builder()
                .from(from.clone())
                .to(to)
                .subject(&message.title)
                .multipart(
                    MultiPart::alternative()
                        .singlepart(
                            SinglePart::builder()
                                .header(ContentType::TEXT_PLAIN)
                                .body(format!("{}\n\n--\nSent by {}\n", message.body, SENDER_NAME)),
                        )
                        .singlepart(
                            SinglePart::builder()
                                .header(ContentType::TEXT_HTML)
                                .body(email_body_html(message)),
                        ),
                );
            let email = match email {
                Ok(m) => m,
                Err(e) => {
                    failures.push(format!("{}: {}", address, e));
                    continue;
                }
            };
            if let Err(e) = transport.send(email).await {
                failures.push(format!("{}: {}", address, e));
            }
        }

        if failures.is_empty() {
            DeliveryOutcome::Sent
        } else {
            DeliveryOutcome::Failed(failures.join("; "))
        }
    }
}

#[async_trait]
impl ChannelSender for ChannelDispatcher {
    async fn send(&self, config: &ChannelConfig, message: &RenderedMessage) -> DeliveryOutcome {
        match config {
            ChannelConfig::Webhook { url, payload_format } => {
                let body = match payload_format {
                    PayloadFormat::Chat => serde_json::json!({
                        "content": message.markdown(),
                        "sender": SENDER_NAME,
                    }),
                    PayloadFormat::Json => serde_json::json!({
                        "event": message.event,
                        "title": message.title,
                        "message": message.body,
                        "service": message.service,
                        "timestamp": message.timestamp,
                    }),
                };
                self.post_json(url, &body).await
            }
            ChannelConfig::Discord { webhook_url } => {
                let body = serde_json::json!({ "content": message.markdown(), "username": SENDER_NAME });
                self.post_json(webhook_url, &body).await
            }
            ChannelConfig::Slack { webhook_url } => {
                let body = serde_json::json!({ "text": format!("*{}*\n{}", message.title, message.body) });
                self.post_json(webhook_url, &body).await
            }
            ChannelConfig::Telegram { bot_token, chat_id, api_url } => {
                let base = api_url.as_deref().unwrap_or(TELEGRAM_API).trim_end_matches('/');
                let url = format!("{}/bot{}/sendMessage", base, bot_token);
                let body = serde_json::json!({
                    "chat_id": chat_id,
                    "text": message.text(),
                    "disable_web_page_preview": true,
                });
                self.post_json(&url, &body).await
            }
            ChannelConfig::Email { .. } => self.send_email(&config.recipients(), message).await,
        }
    }
}

fn email_body_html(message: &RenderedMessage) -> String {
    let rows: String = message
        .body
        .lines()
        .map(|line| match line.split_once(": ") {
            Some((k, v)) => format!(
                r#"<tr><td style="padding: 6px 0; color: #8899aa;">{}</td><td style="padding: 6px 0;">{}</td></tr>"#,
                html_escape(k),
                html_escape(v)
            ),
            None => format!(r#"<tr><td colspan="2" style="padding: 6px 0;">{}</td></tr>"#, html_escape(line)),
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif; background: #1a1a2e; color: #e0e0e0; padding: 24px;">
<div style="max-width: 560px; margin: 0 auto;">
  <div style="background: {color}; color: #fff; padding: 16px 20px; border-radius: 8px 8px 0 0; font-size: 18px; font-weight: 600;">{title}</div>
  <div style="background: #16213e; padding: 20px; border-radius: 0 0 8px 8px; border: 1px solid #0f3460; border-top: none;">
    <table style="width: 100%; border-collapse: collapse; color: #e0e0e0;">{rows}</table>
    <p style="color: #8899aa; font-size: 13px;">{time}</p>
  </div>
  <div style="text-align: center; margin-top: 16px; color: #555; font-size: 12px;">Sent by {sender}</div>
</div>
</body>
</html>"#,
        color = event_color(message.event),
        title = html_escape(&message.title),
        rows = rows,
        time = message.timestamp.to_rfc3339(),
        sender = SENDER_NAME,
    )
}

/// Minimal HTML escaping for email body.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn build_transport(config: &SmtpConfig) -> std::result::Result<AsyncSmtpTransport<Tokio1Executor>, String> {
    let builder = match config.tls_mode {
        TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| format!("TLS relay error: {}", e))?
            .port(config.port),
        TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| format!("STARTTLS relay error: {}", e))?
            .port(config.port),
        TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port),
    };

    let builder = if config.username.is_empty() {
        builder
    } else {
        builder.credentials(Credentials::new(config.username.clone(), config.password.clone()))
    };

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckType;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn channel(channel_type: &str, config: serde_json::Value) -> NotificationChannel {
        NotificationChannel {
            id: "ch1".into(),
            name: "ops".into(),
            channel_type: channel_type.into(),
            config,
            is_enabled: true,
            is_default: false,
        }
    }

    fn service() -> Service {
        Service {
            id: "svc1".into(),
            name: "Billing API".into(),
            check_type: CheckType::Http,
            target: "https://billing.example.com/health".into(),
            check_interval: 60,
            content_match: None,
            headers: BTreeMap::new(),
            status: ServiceStatus::Offline,
            response_time: None,
            uptime: 100.0,
            total_monitored_time: 0,
            online_time: 0,
            last_checked: None,
            ssl_expiry_date: None,
            ssl_days_remaining: None,
            is_active: true,
            is_deleted: false,
        }
    }

    #[test]
    fn test_parse_each_channel_type() {
        let webhook = ChannelConfig::from_channel(&channel("webhook", json!({"url": "http://hook", "payload_format": "chat"}))).unwrap();
        assert_eq!(webhook, ChannelConfig::Webhook { url: "http://hook".into(), payload_format: PayloadFormat::Chat });

        let telegram = ChannelConfig::from_channel(&channel("telegram", json!({"bot_token": "t", "chat_id": -100123}))).unwrap();
        assert!(matches!(telegram, ChannelConfig::Telegram { ref chat_id, .. } if chat_id == "-100123"));

        let email = ChannelConfig::from_channel(&channel("email", json!({"address": "ops@example.com"}))).unwrap();
        assert_eq!(email.recipients(), vec!["ops@example.com".to_string()]);

        assert_eq!(ChannelConfig::from_channel(&channel("Slack", json!({"webhook_url": "http://s"}))).unwrap().kind(), "slack");
    }

    #[test]
    fn test_malformed_configs_rejected() {
        assert!(matches!(
            ChannelConfig::from_channel(&channel("webhook", json!({"href": "http://hook"}))),
            Err(Error::InvalidChannelConfig(_))
        ));
        assert!(ChannelConfig::from_channel(&channel("pager", json!({}))).is_err());
        assert!(ChannelConfig::from_channel(&channel("email", json!({"to": []}))).is_err());
        assert!(ChannelConfig::from_channel(&channel("discord", json!("not an object"))).is_err());
    }

    fn evaluation(status: ServiceStatus, message: &str) -> Evaluation {
        Evaluation {
            previous: ServiceStatus::Online,
            status,
            transitioned: true,
            is_failure: status.is_failure(),
            response_time: Some(42),
            message: message.into(),
        }
    }

    #[test]
    fn test_render_down_message() {
        let eval = evaluation(ServiceStatus::Offline, "Connection failed");
        let msg = RenderedMessage::for_service(NotifyEvent::Down, &service(), &eval, None, Utc::now());
        assert!(msg.title.starts_with("🔴 DOWN"));
        assert!(msg.title.contains("Billing API"));
        assert!(msg.body.contains("Detail: Connection failed"));
        assert!(msg.body.contains("Response time: 42ms"));
        assert!(!msg.body.contains("Certificate"));
    }

    #[test]
    fn test_render_ssl_message_includes_days() {
        let eval = evaluation(ServiceStatus::Online, "HTTP 200");
        let msg = RenderedMessage::for_service(NotifyEvent::SslWarning, &service(), &eval, Some(10), Utc::now());
        assert!(msg.title.starts_with("⚠️ SSL EXPIRING"));
        assert!(msg.body.contains("Certificate days remaining: 10"));
    }

    #[test]
    fn test_html_escaping() {
        let mut svc = service();
        svc.name = "<script>".into();
        let eval = evaluation(ServiceStatus::Online, "");
        let msg = RenderedMessage::for_service(NotifyEvent::Up, &svc, &eval, None, Utc::now());
        let html = email_body_html(&msg);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[tokio::test]
    async fn test_email_without_smtp_fails() {
        let dispatcher = ChannelDispatcher::new(None).unwrap();
        let config = ChannelConfig::Email { to: vec!["ops@example.com".into()], address: None };
        let outcome = dispatcher.send(&config, &RenderedMessage::test("ops", Utc::now())).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(ref e) if e.contains("SMTP")));
    }
}
