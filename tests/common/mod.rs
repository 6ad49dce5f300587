#![allow(dead_code)]

use async_trait::async_trait;
use fleetwatch::channels::{ChannelConfig, ChannelSender, DeliveryOutcome, RenderedMessage};
use fleetwatch::models::NotifyEvent;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Test double for channel delivery: records every message it is handed.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(String, NotifyEvent, String)>>,
    pub fail_with: Option<String>,
}

impl RecordingSender {
    pub fn failing(reason: &str) -> Self {
        RecordingSender { sent: Mutex::new(Vec::new()), fail_with: Some(reason.to_string()) }
    }

    pub fn events(&self) -> Vec<NotifyEvent> {
        self.sent.lock().unwrap().iter().map(|(_, e, _)| *e).collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send(&self, config: &ChannelConfig, message: &RenderedMessage) -> DeliveryOutcome {
        self.sent
            .lock()
            .unwrap()
            .push((config.kind().to_string(), message.event, message.title.clone()));
        match &self.fail_with {
            Some(reason) => DeliveryOutcome::Failed(reason.clone()),
            None => DeliveryOutcome::Sent,
        }
    }
}

/// Connection counters kept by [`http_server`].
#[derive(Default)]
pub struct ServerStats {
    pub total: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    per_path: Mutex<HashMap<String, (usize, usize)>>,
}

impl ServerStats {
    /// Highest number of simultaneous requests seen for any single path.
    pub fn max_active_per_path(&self) -> usize {
        self.per_path.lock().unwrap().values().map(|(_, max)| *max).max().unwrap_or(0)
    }

    fn enter(&self, path: &str) {
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let mut paths = self.per_path.lock().unwrap();
        let entry = paths.entry(path.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
    }

    fn leave(&self, path: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(entry) = self.per_path.lock().unwrap().get_mut(path) {
            entry.0 -= 1;
        }
    }
}

/// Minimal HTTP/1.1 server answering every request with `status` and `body`
/// after `delay`.
pub async fn http_server(status: &'static str, body: &'static str, delay: Duration, stats: Arc<ServerStats>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let stats = stats.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                stats.enter(&path);
                tokio::time::sleep(delay).await;
                stats.leave(&path);
                let reply = format!(
                    "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
