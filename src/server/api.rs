//! Read-only dashboard endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use super::AppState;
use crate::error::StoreError;

fn store_failure(e: StoreError) -> Response {
    error!(error = %e, "Dashboard query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "store unavailable"})),
    )
        .into_response()
}

/// `GET /api/animals`: every active animal with its latest status,
/// location and presence.
pub async fn roster(State(state): State<AppState>) -> Response {
    match state.ledger.animal_roster().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_failure(e),
    }
}

/// `GET /api/animals/present`
pub async fn present(State(state): State<AppState>) -> Response {
    match state.ledger.present_animals().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_failure(e),
    }
}

/// `GET /api/expenses/{id}/allocations`
pub async fn allocations(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let expense = match state.ledger.get_expense(id).await {
        Ok(Some(expense)) => expense,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Expense not found"})),
            )
                .into_response();
        }
        Err(e) => return store_failure(e),
    };
    match state.ledger.expense_allocations(id).await {
        Ok(allocations) => Json(json!({
            "expense": expense,
            "allocations": allocations,
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}
