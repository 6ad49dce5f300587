// Read/trigger API, mounted at /api/v1.

mod maintenance;
mod notifications;
mod services;
mod stream;
mod system;

pub use maintenance::{active_maintenance, service_maintenance};
pub use notifications::{notification_history, test_channel};
pub use services::{get_service, get_service_logs, get_service_metrics, list_services};
pub use stream::{global_events, service_events};
pub use system::{health, reload_engine};

use crate::error::Error;
use rocket::{http::Status, routes, serde::json::Json, Route};

pub type ApiError = (Status, Json<serde_json::Value>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn all() -> Vec<Route> {
    routes![
        health,
        reload_engine,
        list_services,
        get_service,
        get_service_logs,
        get_service_metrics,
        service_maintenance,
        active_maintenance,
        notification_history,
        test_channel,
        global_events,
        service_events,
    ]
}

pub(crate) fn api_error(err: Error) -> ApiError {
    let (status, code) = match &err {
        Error::NotFound(_) => (Status::NotFound, "NOT_FOUND"),
        Error::Config(_) | Error::InvalidChannelConfig(_) => (Status::BadRequest, "VALIDATION_ERROR"),
        _ => (Status::InternalServerError, "INTERNAL_ERROR"),
    };
    (status, Json(serde_json::json!({ "error": err.to_string(), "code": code })))
}

pub(crate) fn not_found(what: &str) -> ApiError {
    (Status::NotFound, Json(serde_json::json!({
        "error": format!("{} not found", what), "code": "NOT_FOUND"
    })))
}
