mod content;
mod database;
mod http;

pub use content::ContentMatcher;

use crate::config::{EngineConfig, HttpErrorPolicy};
use crate::error::{Error, Result};
use crate::models::{CheckType, Service};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::warn;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Raw result of one probe, before any status policy is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ProbeOutcome {
    Online { response_time_ms: u32, detail: String },
    Degraded { response_time_ms: u32, detail: String },
    Offline { response_time_ms: u32, detail: String },
    Timeout { elapsed_ms: u32 },
}

impl ProbeOutcome {
    pub fn response_time_ms(&self) -> u32 {
        match self {
            ProbeOutcome::Online { response_time_ms, .. }
            | ProbeOutcome::Degraded { response_time_ms, .. }
            | ProbeOutcome::Offline { response_time_ms, .. } => *response_time_ms,
            ProbeOutcome::Timeout { elapsed_ms } => *elapsed_ms,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ProbeOutcome::Online { detail, .. }
            | ProbeOutcome::Degraded { detail, .. }
            | ProbeOutcome::Offline { detail, .. } => detail.clone(),
            ProbeOutcome::Timeout { elapsed_ms } => format!("Check timed out after {}ms", elapsed_ms),
        }
    }
}

/// Leaf certificate observed on an HTTPS probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SslCertificate {
    pub expires_at: DateTime<Utc>,
    /// Whole days left, rounded down; negative once expired.
    pub days_remaining: i64,
}

impl SslCertificate {
    pub fn new(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        SslCertificate {
            expires_at,
            days_remaining: (expires_at - now).num_seconds().div_euclid(86_400),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslCertificate>,
}

impl ProbeResult {
    pub fn online(started: Instant, detail: impl Into<String>) -> Self {
        Self::from(ProbeOutcome::Online { response_time_ms: elapsed_ms(started), detail: detail.into() })
    }

    pub fn degraded(started: Instant, detail: impl Into<String>) -> Self {
        Self::from(ProbeOutcome::Degraded { response_time_ms: elapsed_ms(started), detail: detail.into() })
    }

    pub fn offline(started: Instant, detail: impl Into<String>) -> Self {
        Self::from(ProbeOutcome::Offline { response_time_ms: elapsed_ms(started), detail: detail.into() })
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::from(ProbeOutcome::Timeout { elapsed_ms: duration_ms(elapsed) })
    }
}

impl From<ProbeOutcome> for ProbeResult {
    fn from(outcome: ProbeOutcome) -> Self {
        ProbeResult { outcome, ssl: None }
    }
}

fn elapsed_ms(started: Instant) -> u32 {
    duration_ms(started.elapsed())
}

fn duration_ms(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

/// Runs one network check for a service. Never fails: every problem is
/// folded into a [`ProbeOutcome`].
pub struct ProbeExecutor {
    client: reqwest::Client,
    /// Built on first DNS probe, inside the runtime.
    resolver: OnceLock<TokioAsyncResolver>,
    timeout: Duration,
    http_error_policy: HttpErrorPolicy,
    /// Last config problem warned about, per service id.
    reported: Mutex<HashMap<String, String>>,
}

impl ProbeExecutor {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.check_timeout)
            .tls_info(true)
            .user_agent(concat!("fleetwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(ProbeExecutor {
            client,
            resolver: OnceLock::new(),
            timeout: config.check_timeout,
            http_error_policy: config.http_error_policy,
            reported: Mutex::new(HashMap::new()),
        })
    }

    pub async fn probe(&self, service: &Service) -> ProbeResult {
        match tokio::time::timeout(self.timeout, self.dispatch(service)).await {
            Ok(result) => result,
            Err(_) => ProbeResult::timeout(self.timeout),
        }
    }

    async fn dispatch(&self, service: &Service) -> ProbeResult {
        let started = Instant::now();
        match service.check_type {
            CheckType::Http => {
                let matcher = match service.content_match.as_deref() {
                    None | Some("") => None,
                    Some(raw) => match ContentMatcher::parse(raw) {
                        Ok(m) => Some(m),
                        Err(e) => {
                            let detail = format!("Invalid content match pattern: {}", e);
                            self.report_config_error(service, &detail);
                            return ProbeResult::offline(started, detail);
                        }
                    },
                };
                self.clear_config_error(&service.id);
                http::probe_http(&self.client, service, matcher.as_ref(), self.http_error_policy, started).await
            }
            CheckType::Tcp => {
                self.clear_config_error(&service.id);
                probe_tcp(&service.target, started).await
            }
            CheckType::Dns => {
                self.clear_config_error(&service.id);
                self.probe_dns(&service.target, started).await
            }
            CheckType::Db => {
                if let Some(problem) = database::config_problem(&service.target) {
                    self.report_config_error(service, &problem);
                    return ProbeResult::offline(started, problem);
                }
                self.clear_config_error(&service.id);
                database::probe_database(&service.target, started).await
            }
        }
    }

    async fn probe_dns(&self, target: &str, started: Instant) -> ProbeResult {
        let host = strip_scheme(target, "dns");
        let resolver = self.resolver.get_or_init(|| {
            let mut opts = ResolverOpts::default();
            opts.timeout = self.timeout;
            opts.attempts = 1;
            TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
        });
        match resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let addrs: Vec<String> = lookup.iter().map(|ip| ip.to_string()).collect();
                if addrs.is_empty() {
                    ProbeResult::offline(started, format!("No addresses for {}", host))
                } else {
                    ProbeResult::online(started, format!("Resolved {} to {}", host, addrs.join(", ")))
                }
            }
            Err(e) => ProbeResult::offline(started, format!("DNS lookup failed: {}", e)),
        }
    }

    /// Misconfigured services are logged once per distinct problem, not every tick.
    fn report_config_error(&self, service: &Service, detail: &str) {
        let previous = self
            .reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.id.clone(), detail.to_string());
        if previous.as_deref() != Some(detail) {
            warn!(service_id = %service.id, service = %service.name, "{}", detail);
        }
    }

    fn clear_config_error(&self, service_id: &str) {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service_id);
    }
}

async fn probe_tcp(target: &str, started: Instant) -> ProbeResult {
    let addr = strip_scheme(target, "tcp");
    match TcpStream::connect(addr).await {
        Ok(_) => ProbeResult::online(started, format!("Connected to {}", addr)),
        Err(e) => ProbeResult::offline(started, format!("Connection failed: {}", e)),
    }
}

fn strip_scheme<'a>(target: &'a str, scheme: &str) -> &'a str {
    let trimmed = target.trim();
    trimmed
        .strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix("://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/')
}
