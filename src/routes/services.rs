use super::{api_error, not_found, ApiResult};
use crate::db::Db;
use crate::models::{PerformanceMetric, Service, ServiceLog};
use chrono::{Duration, Utc};
use rocket::{get, serde::json::Json, State};
use std::sync::Arc;

const DEFAULT_LOG_LIMIT: u32 = 50;
const MAX_LOG_LIMIT: u32 = 1000;
const DEFAULT_METRIC_HOURS: u32 = 24;
const MAX_METRIC_HOURS: u32 = 24 * 30;

#[get("/services")]
pub fn list_services(db: &State<Arc<Db>>) -> ApiResult<Vec<Service>> {
    db.list_services().map(Json).map_err(api_error)
}

#[get("/services/<id>")]
pub fn get_service(id: &str, db: &State<Arc<Db>>) -> ApiResult<Service> {
    match db.get_service(id).map_err(api_error)? {
        Some(service) if !service.is_deleted => Ok(Json(service)),
        _ => Err(not_found("Service")),
    }
}

#[get("/services/<id>/logs?<limit>")]
pub fn get_service_logs(id: &str, limit: Option<u32>, db: &State<Arc<Db>>) -> ApiResult<Vec<ServiceLog>> {
    ensure_service(db, id)?;
    let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    db.get_service_logs(id, limit).map(Json).map_err(api_error)
}

#[get("/services/<id>/metrics?<hours>")]
pub fn get_service_metrics(id: &str, hours: Option<u32>, db: &State<Arc<Db>>) -> ApiResult<Vec<PerformanceMetric>> {
    ensure_service(db, id)?;
    let hours = hours.unwrap_or(DEFAULT_METRIC_HOURS).clamp(1, MAX_METRIC_HOURS);
    let since = Utc::now() - Duration::hours(i64::from(hours));
    db.get_service_metrics(id, since).map(Json).map_err(api_error)
}

pub(super) fn ensure_service(db: &Db, id: &str) -> Result<Service, super::ApiError> {
    match db.get_service(id).map_err(api_error)? {
        Some(service) if !service.is_deleted => Ok(service),
        _ => Err(not_found("Service")),
    }
}
