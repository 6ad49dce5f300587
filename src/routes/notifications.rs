use super::{api_error, ApiResult};
use crate::db::Db;
use crate::models::NotificationHistory;
use crate::notifications::NotificationEngine;
use chrono::Utc;
use rocket::{get, post, serde::json::Json, State};
use std::sync::Arc;

const DEFAULT_HISTORY_LIMIT: u32 = 100;
const MAX_HISTORY_LIMIT: u32 = 1000;

#[get("/notifications/history?<limit>&<service_id>")]
pub fn notification_history(
    limit: Option<u32>,
    service_id: Option<&str>,
    db: &State<Arc<Db>>,
) -> ApiResult<Vec<NotificationHistory>> {
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    db.list_notification_history(service_id, limit).map(Json).map_err(api_error)
}

/// Send a synthetic `test` event through a channel. The attempt is recorded
/// in history whether or not delivery succeeds.
#[post("/channels/<id>/test")]
pub async fn test_channel(id: &str, engine: &State<Arc<NotificationEngine>>) -> ApiResult<NotificationHistory> {
    engine.test_channel(id, Utc::now()).await.map(Json).map_err(api_error)
}
