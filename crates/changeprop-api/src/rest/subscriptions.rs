use super::{bad_request, internal_error, ApiError};
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{post, put};
use axum::{Json, Router};
use changeprop_core::error::Error;
use changeprop_core::rule::RuleSpec;
use changeprop_executor::registry::Subscription;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/setup", put(setup))
        .route("/subscriptions", post(subscribe))
}

type SubscribeResponse = (StatusCode, Json<BTreeMap<String, Subscription>>);

/// Subscribes the statically configured rules.
async fn setup(State(state): State<AppState>) -> Result<SubscribeResponse, ApiError> {
    let outcome = state
        .registry
        .subscribe(&state.static_rules)
        .await
        .map_err(subscribe_error)?;
    info!(rules = outcome.len(), "static rules subscribed");
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Body maps rule names to rule specs.
async fn subscribe(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<SubscribeResponse, ApiError> {
    let specs: BTreeMap<String, RuleSpec> = serde_json::from_value(body)
        .map_err(|e| bad_request(&format!("invalid rule specs: {e}"), None))?;
    let outcome = state
        .registry
        .subscribe(&specs)
        .await
        .map_err(subscribe_error)?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

fn subscribe_error(e: Error) -> ApiError {
    match e {
        Error::InvalidRule { .. } => bad_request(&e.to_string(), None),
        other => internal_error(other),
    }
}
