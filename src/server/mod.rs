//! HTTP surface: the chat webhook, the confirmation feed and the read-only
//! dashboard API.

pub mod api;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::channels::{MediaFetcher, ReplySink};
use crate::confirm::ConfirmationQueue;
use crate::extract::IntentExtractor;
use crate::sequencer::ConfirmationSequencer;
use crate::store::Ledger;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
    pub queue: Arc<ConfirmationQueue>,
    pub sequencer: Arc<ConfirmationSequencer>,
    pub extractor: Arc<dyn IntentExtractor>,
    pub replies: Arc<dyn ReplySink>,
    /// Downloads attachment bytes; `None` when no transport token is set.
    pub media_fetcher: Option<Arc<dyn MediaFetcher>>,
    /// Expected `hub.verify_token`; the handshake is refused when unset.
    pub verify_token: Option<String>,
    /// Age limit for incomplete requests offered as context.
    pub incomplete_window: chrono::Duration,
}

/// Build the Axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhook",
            get(webhook::verify).post(webhook::receive),
        )
        .route("/ws", get(ws::ws_handler))
        .route("/api/confirmations", get(ws::list_confirmations))
        .route("/api/confirmations/{id}/accept", post(ws::accept_confirmation))
        .route("/api/confirmations/{id}/decline", post(ws::decline_confirmation))
        .route("/api/animals", get(api::roster))
        .route("/api/animals/present", get(api::present))
        .route("/api/expenses/{id}/allocations", get(api::allocations))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "shelter-ledger"
    }))
}
