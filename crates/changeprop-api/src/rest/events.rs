use super::{bad_request, internal_error, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use changeprop_msg::publisher::PublishError;
use serde_json::Value;

pub fn router() -> Router<AppState> {
    Router::new().route("/events", post(produce_events))
}

/// Publishes a batch of events to their topics.
async fn produce_events(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let Value::Array(events) = body else {
        return Err(bad_request("Events should be a non-empty array", None));
    };

    match state.publisher.publish_events(events).await {
        Ok(()) => Ok(StatusCode::CREATED),
        Err(PublishError::Empty) => Err(bad_request("Events should be a non-empty array", None)),
        Err(PublishError::MissingTopic(event)) => Err(bad_request(
            "Event must have a meta.topic property",
            Some(&event),
        )),
        Err(PublishError::Produce(e)) => Err(internal_error(e)),
    }
}
