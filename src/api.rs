//! Thin HTTP surface: deserialize subscribe/unsubscribe requests into bridge
//! calls and expose the read-only health snapshot.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::bridge::Bridge;
use crate::registry::SubscribeRequest;

pub fn app(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/subscribe", post(subscribe_handler))
        .route("/unsubscribe", post(unsubscribe_handler))
        .route("/health", get(health_handler))
        .with_state(bridge)
}

async fn subscribe_handler(
    State(bridge): State<Arc<Bridge>>,
    Json(request): Json<SubscribeRequest>,
) -> impl IntoResponse {
    match bridge.subscribe(request).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        ),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": error.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct UnsubscribeBody {
    subscriber_id: String,
}

async fn unsubscribe_handler(
    State(bridge): State<Arc<Bridge>>,
    Json(body): Json<UnsubscribeBody>,
) -> impl IntoResponse {
    // Idempotent: removing an absent subscriber is still a success.
    bridge.unsubscribe(&body.subscriber_id).await;
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn health_handler(State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    let stats = bridge.stats().await;
    let body = serde_json::json!({
        "status": "ok",
        "subscribers": stats.subscribers,
        "relays": stats.relays,
    });
    (StatusCode::OK, Json(body))
}
