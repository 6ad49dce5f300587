use super::services::ensure_service;
use super::{api_error, ApiResult};
use crate::db::Db;
use crate::maintenance::MaintenanceGate;
use crate::models::MaintenanceWindow;
use chrono::Utc;
use rocket::{get, serde::json::Json, State};
use std::sync::Arc;

// ── Maintenance Windows ──

/// Every window covering the current instant.
#[get("/maintenance/active")]
pub fn active_maintenance(gate: &State<MaintenanceGate>) -> ApiResult<Vec<MaintenanceWindow>> {
    gate.covering_windows(Utc::now()).map(Json).map_err(api_error)
}

/// Whether notifications for a service are currently withheld, and by which windows.
#[get("/services/<id>/maintenance")]
pub fn service_maintenance(
    id: &str,
    db: &State<Arc<Db>>,
    gate: &State<MaintenanceGate>,
) -> ApiResult<serde_json::Value> {
    ensure_service(db, id)?;
    let windows = gate.windows_for(id, Utc::now()).map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "service_id": id,
        "suppressed": !windows.is_empty(),
        "windows": windows,
    })))
}
