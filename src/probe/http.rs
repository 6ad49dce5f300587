use super::{ContentMatcher, ProbeResult, SslCertificate};
use crate::config::HttpErrorPolicy;
use crate::models::Service;
use chrono::{DateTime, Utc};
use std::time::Instant;

pub(super) async fn probe_http(
    client: &reqwest::Client,
    service: &Service,
    matcher: Option<&ContentMatcher>,
    policy: HttpErrorPolicy,
    started: Instant,
) -> ProbeResult {
    let mut req = client.get(&service.target);
    for (name, value) in &service.headers {
        req = req.header(name.as_str(), value.as_str());
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => return ProbeResult::timeout(started.elapsed()),
        Err(e) if e.is_connect() => {
            return ProbeResult::offline(started, format!("Connection failed: {}", e))
        }
        Err(e) => return ProbeResult::offline(started, format!("Request failed: {}", e)),
    };

    let ssl = peer_certificate_expiry(&resp).map(|expires_at| SslCertificate::new(expires_at, Utc::now()));
    let code = resp.status().as_u16();

    let mut result = if !(200..400).contains(&code) {
        let detail = format!("HTTP {}", code);
        match policy {
            HttpErrorPolicy::Offline => ProbeResult::offline(started, detail),
            HttpErrorPolicy::Degraded => ProbeResult::degraded(started, detail),
        }
    } else if let Some(matcher) = matcher {
        match resp.text().await {
            Ok(body) if matcher.matches(&body) => {
                ProbeResult::online(started, format!("HTTP {}, content matched", code))
            }
            Ok(_) => ProbeResult::offline(
                started,
                format!("HTTP {}, expected content {} not found", code, matcher.describe()),
            ),
            Err(e) if e.is_timeout() => ProbeResult::timeout(started.elapsed()),
            Err(e) => ProbeResult::offline(started, format!("Body read error: {}", e)),
        }
    } else {
        ProbeResult::online(started, format!("HTTP {}", code))
    };

    result.ssl = ssl;
    result
}

/// `notAfter` of the leaf certificate, when the response came over TLS.
fn peer_certificate_expiry(resp: &reqwest::Response) -> Option<DateTime<Utc>> {
    let info = resp.extensions().get::<reqwest::tls::TlsInfo>()?;
    let der = info.peer_certificate()?;
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
}
