use rocket::serde::json::Json;
use rocket::{catch, catchers, Catcher, Request};

pub fn all() -> Vec<Catcher> {
    catchers![bad_request, not_found, unprocessable_entity, internal_error]
}

fn body(error: impl Into<String>, code: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": error.into(), "code": code }))
}

#[catch(400)]
fn bad_request(_req: &Request) -> Json<serde_json::Value> {
    body("Bad request", "BAD_REQUEST")
}

#[catch(404)]
fn not_found(req: &Request) -> Json<serde_json::Value> {
    body(format!("No route for {} {}", req.method(), req.uri().path()), "NOT_FOUND")
}

/// A matched route whose parameters failed validation.
#[catch(422)]
fn unprocessable_entity(req: &Request) -> Json<serde_json::Value> {
    body(format!("Invalid parameters for {}", req.uri().path()), "UNPROCESSABLE_ENTITY")
}

#[catch(500)]
fn internal_error(_req: &Request) -> Json<serde_json::Value> {
    body("Internal server error", "INTERNAL_ERROR")
}
