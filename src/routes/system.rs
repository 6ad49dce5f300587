use super::{api_error, ApiResult};
use crate::scheduler::{ReconcileSummary, Scheduler};
use rocket::{get, post, serde::json::Json, State};
use std::sync::Arc;

// ── Health ──

#[get("/health")]
pub fn health(scheduler: &State<Arc<Scheduler>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "fleetwatch",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduled_services": scheduler.scheduled_count(),
    }))
}

// ── Engine control ──

/// Apply stored configuration to the scheduler now rather than at the next
/// periodic reconcile.
#[post("/engine/reload")]
pub fn reload_engine(scheduler: &State<Arc<Scheduler>>) -> ApiResult<ReconcileSummary> {
    scheduler.reconcile().map(Json).map_err(api_error)
}
