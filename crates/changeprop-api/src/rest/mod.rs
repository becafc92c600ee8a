pub mod events;
pub mod health;
pub mod subscriptions;

use crate::AppState;
use axum::http::StatusCode;
use axum::{Json, Router};
use serde_json::{json, Value};

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(subscriptions::router())
        .merge(events::router())
        .merge(health::router())
}

pub type ApiError = (StatusCode, Json<Value>);

pub fn bad_request(detail: &str, event: Option<&Value>) -> ApiError {
    let mut body = json!({ "type": "bad_request", "detail": detail });
    if let Some(event) = event {
        body["event"] = event.clone();
    }
    (StatusCode::BAD_REQUEST, Json(body))
}

pub fn internal_error(detail: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "type": "internal_error", "detail": detail.to_string() })),
    )
}
