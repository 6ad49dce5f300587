use rocket::response::stream::{Event, EventStream};
use rocket::tokio::sync::broadcast;
use serde::Serialize;

pub const CHECK_COMPLETED: &str = "check.completed";
pub const STATUS_CHANGED: &str = "status.changed";
pub const NOTIFICATION_SENT: &str = "notification.sent";

/// Engine event pushed to live subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub data: serde_json::Value,
}

impl EngineEvent {
    pub fn new(event_type: &str, service_id: Option<&str>, data: serde_json::Value) -> Self {
        EngineEvent {
            event_type: event_type.to_string(),
            service_id: service_id.map(String::from),
            data,
        }
    }
}

/// Global event broadcaster. Subscribers receive all events.
pub struct EventBroadcaster {
    pub sender: broadcast::Sender<EngineEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBroadcaster { sender }
    }

    pub fn send(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

/// SSE stream of every engine event.
pub fn global_stream(broadcaster: &EventBroadcaster) -> EventStream![Event + '_] {
    let mut rx = broadcaster.subscribe();
    EventStream! {
        loop {
            match rx.recv().await {
                Ok(evt) => {
                    let data = serde_json::to_string(&serde_json::json!({
                        "service_id": evt.service_id,
                        "data": evt.data,
                    })).unwrap_or_default();
                    yield Event::data(data).event(evt.event_type);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Event::data(format!("{{\"skipped\":{}}}", n)).event("lag");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// SSE stream filtered to one service.
pub fn service_stream<'a>(broadcaster: &'a EventBroadcaster, service_id: String) -> EventStream![Event + 'a] {
    let mut rx = broadcaster.subscribe();
    EventStream! {
        loop {
            match rx.recv().await {
                Ok(evt) if evt.service_id.as_deref() == Some(service_id.as_str()) => {
                    let data = serde_json::to_string(&evt.data).unwrap_or_default();
                    yield Event::data(data).event(evt.event_type);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Event::data(format!("{{\"skipped\":{}}}", n)).event("lag");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
