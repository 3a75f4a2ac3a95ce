//! Confirmation feed: WebSocket events plus REST accept/decline.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::confirm::{ClientAction, ConfirmEvent, ConfirmationQueue, Decision};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.queue))
}

async fn send_event(socket: &mut WebSocket, event: &ConfirmEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Could not serialise confirmation event");
            true
        }
    }
}

async fn sync(socket: &mut WebSocket, queue: &ConfirmationQueue) -> bool {
    let event = ConfirmEvent::ConfirmationsSync {
        confirmations: queue.pending().await,
    };
    send_event(socket, &event).await
}

async fn handle_socket(mut socket: WebSocket, queue: Arc<ConfirmationQueue>) {
    // Subscribe before the initial sync so nothing slips in between.
    let mut rx = queue.subscribe();
    if !sync(&mut socket, &queue).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !sync(&mut socket, &queue).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_action(&text, &queue).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_action(text: &str, queue: &ConfirmationQueue) {
    let (id, decision) = match serde_json::from_str::<ClientAction>(text) {
        Ok(ClientAction::Accept { id }) => (id, Decision::Accept),
        Ok(ClientAction::Decline { id }) => (id, Decision::Decline),
        Err(e) => {
            debug!(error = %e, text, "Unrecognized WS message from client");
            return;
        }
    };
    if queue.resolve(id, decision).await.is_some() {
        info!(confirmation_id = %id, ?decision, "Confirmation answered via WS");
    } else {
        warn!(confirmation_id = %id, "Confirmation not found or no longer pending");
    }
}

pub async fn list_confirmations(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.queue.pending().await)
}

pub async fn accept_confirmation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    answer(&state.queue, &id, Decision::Accept).await
}

pub async fn decline_confirmation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    answer(&state.queue, &id, Decision::Decline).await
}

async fn answer(
    queue: &ConfirmationQueue,
    id: &str,
    decision: Decision,
) -> (StatusCode, Json<serde_json::Value>) {
    let Ok(id) = Uuid::parse_str(id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid confirmation ID"})),
        );
    };
    let answered = match decision {
        Decision::Accept => queue.accept(id).await,
        Decision::Decline => queue.decline(id).await,
    };
    match answered {
        Some(confirmation) => {
            info!(confirmation_id = %id, ?decision, "Confirmation answered via REST");
            (
                StatusCode::OK,
                Json(serde_json::to_value(confirmation).unwrap_or_default()),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Confirmation not found or not pending"})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::super::router;
    use super::super::test_support::*;
    use super::*;
    use crate::confirm::{ConfirmationRequest, ConfirmationStatus};
    use crate::intents::IntentKind;

    fn request() -> ConfirmationRequest {
        ConfirmationRequest {
            message_key: "wamid.1".into(),
            sender: "5491100000000".into(),
            sequence_index: 0,
            position: 1,
            total: 1,
            kind: IntentKind::Inquiry,
            fields: vec![("Topic".into(), "vaccines".into())],
        }
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn list_and_accept() {
        let (state, _) = state(Vec::new(), Arc::new(Outbox::default())).await;
        let queue = state.queue.clone();
        let app = router(state);
        let (id, rx) = queue.push(request()).await;

        let resp = app
            .clone()
            .oneshot(Request::get("/api/confirmations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = json_body(resp).await;
        assert_eq!(listed[0]["id"], id.to_string());
        assert_eq!(listed[0]["kind"], "inquiry");

        let resp = app
            .oneshot(
                Request::post(format!("/api/confirmations/{id}/accept"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(rx.await.unwrap(), Decision::Accept);
        assert_eq!(
            queue.get(id).await.unwrap().status,
            ConfirmationStatus::Accepted
        );
    }

    #[tokio::test]
    async fn decline_unknown_and_invalid_ids() {
        let (state, _) = state(Vec::new(), Arc::new(Outbox::default())).await;
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(
                Request::post(format!("/api/confirmations/{}/decline", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(
                Request::post("/api/confirmations/not-a-uuid/decline")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn client_action_resolves() {
        let (state, _) = state(Vec::new(), Arc::new(Outbox::default())).await;
        let (id, rx) = state.queue.push(request()).await;

        handle_client_action(
            &format!(r#"{{"action": "decline", "id": "{id}"}}"#),
            &state.queue,
        )
        .await;
        assert_eq!(rx.await.unwrap(), Decision::Decline);

        // Garbage is ignored.
        handle_client_action("hello", &state.queue).await;
    }
}
