use crate::error::{Error, Result};
use std::str::FromStr;
use std::time::Duration;

/// How an HTTP response outside 200-399 is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorPolicy {
    Offline,
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TlsMode {
    StartTls,
    Tls,
    None,
}

/// SMTP relay used by email channels.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub tls_mode: TlsMode,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: String,
    pub check_timeout: Duration,
    pub max_concurrent_checks: usize,
    /// Online probes slower than this are evaluated as degraded. `None` disables the cutoff.
    pub degraded_response_ms: Option<u32>,
    pub http_error_policy: HttpErrorPolicy,
    pub ssl_warning_days: i64,
    pub shutdown_grace: Duration,
    pub reconcile_interval: Duration,
    pub max_stagger: Duration,
    pub smtp: Option<SmtpConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: "fleetwatch.db".into(),
            check_timeout: Duration::from_secs(10),
            max_concurrent_checks: 16,
            degraded_response_ms: Some(5000),
            http_error_policy: HttpErrorPolicy::Offline,
            ssl_warning_days: 14,
            shutdown_grace: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(30),
            max_stagger: Duration::from_secs(30),
            smtp: None,
        }
    }
}

impl EngineConfig {
    /// Load settings from the process environment (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = EngineConfig::default();

        let degraded_response_ms = match parse_var::<u32>(&get, "DEGRADED_RESPONSE_MS")? {
            Some(0) => None,
            Some(ms) => Some(ms),
            None => defaults.degraded_response_ms,
        };

        let http_error_policy = match get("HTTP_ERROR_STATUS").map(|v| v.to_lowercase()) {
            None => defaults.http_error_policy,
            Some(v) if v == "offline" => HttpErrorPolicy::Offline,
            Some(v) if v == "degraded" => HttpErrorPolicy::Degraded,
            Some(v) => {
                return Err(Error::config(format!(
                    "HTTP_ERROR_STATUS must be 'offline' or 'degraded', got '{}'",
                    v
                )))
            }
        };

        let max_concurrent_checks = parse_var::<usize>(&get, "MAX_CONCURRENT_CHECKS")?
            .unwrap_or(defaults.max_concurrent_checks);
        if max_concurrent_checks == 0 {
            return Err(Error::config("MAX_CONCURRENT_CHECKS must be at least 1"));
        }

        let check_timeout = parse_var::<u64>(&get, "CHECK_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.check_timeout);
        if check_timeout.is_zero() {
            return Err(Error::config("CHECK_TIMEOUT_SECS must be at least 1"));
        }

        Ok(EngineConfig {
            database_path: get("DATABASE_PATH").unwrap_or(defaults.database_path),
            check_timeout,
            max_concurrent_checks,
            degraded_response_ms,
            http_error_policy,
            ssl_warning_days: parse_var(&get, "SSL_WARNING_DAYS")?.unwrap_or(defaults.ssl_warning_days),
            shutdown_grace: parse_var::<u64>(&get, "SHUTDOWN_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            reconcile_interval: parse_var::<u64>(&get, "RECONCILE_INTERVAL_SECS")?
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(defaults.reconcile_interval),
            max_stagger: parse_var::<u64>(&get, "MAX_STAGGER_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_stagger),
            smtp: smtp_from_lookup(&get)?,
        })
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match get(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value: '{}'", key, raw))),
    }
}

/// SMTP settings. Returns None if SMTP_HOST is not set.
fn smtp_from_lookup(get: &impl Fn(&str) -> Option<String>) -> Result<Option<SmtpConfig>> {
    let host = match get("SMTP_HOST") {
        Some(h) if !h.trim().is_empty() => h,
        _ => return Ok(None),
    };
    let port = parse_var(get, "SMTP_PORT")?.unwrap_or(587);
    let username = get("SMTP_USERNAME").unwrap_or_default();
    let password = get("SMTP_PASSWORD").unwrap_or_default();
    let from_address = get("SMTP_FROM").unwrap_or_else(|| format!("fleetwatch@{}", host));
    let tls_mode = match get("SMTP_TLS").unwrap_or_default().to_lowercase().as_str() {
        "tls" | "implicit" => TlsMode::Tls,
        "none" | "off" | "false" => TlsMode::None,
        _ => TlsMode::StartTls,
    };

    Ok(Some(SmtpConfig {
        host,
        port,
        username,
        password,
        from_address,
        tls_mode,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_empty() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.database_path, "fleetwatch.db");
        assert_eq!(cfg.check_timeout, Duration::from_secs(10));
        assert_eq!(cfg.degraded_response_ms, Some(5000));
        assert_eq!(cfg.http_error_policy, HttpErrorPolicy::Offline);
        assert_eq!(cfg.ssl_warning_days, 14);
        assert!(cfg.smtp.is_none());
    }

    #[test]
    fn test_overrides() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("DATABASE_PATH", "/tmp/x.db"),
            ("CHECK_TIMEOUT_SECS", "3"),
            ("MAX_CONCURRENT_CHECKS", "4"),
            ("DEGRADED_RESPONSE_MS", "0"),
            ("HTTP_ERROR_STATUS", "Degraded"),
        ]))
        .unwrap();
        assert_eq!(cfg.database_path, "/tmp/x.db");
        assert_eq!(cfg.check_timeout, Duration::from_secs(3));
        assert_eq!(cfg.max_concurrent_checks, 4);
        assert_eq!(cfg.degraded_response_ms, None);
        assert_eq!(cfg.http_error_policy, HttpErrorPolicy::Degraded);
    }

    #[test]
    fn test_malformed_number_is_config_error() {
        let err = EngineConfig::from_lookup(lookup(&[("CHECK_TIMEOUT_SECS", "ten")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("CHECK_TIMEOUT_SECS"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("MAX_CONCURRENT_CHECKS", "0")])).is_err());
    }

    #[test]
    fn test_smtp_settings() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("SMTP_HOST", "mail.example.com"),
            ("SMTP_TLS", "implicit"),
        ]))
        .unwrap();
        let smtp = cfg.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.from_address, "fleetwatch@mail.example.com");
        assert_eq!(smtp.tls_mode, TlsMode::Tls);
    }
}
