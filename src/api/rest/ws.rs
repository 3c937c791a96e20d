use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SubscribeQuery {
    pub party_id: Uuid,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<SubscribeQuery>,
) -> Result<impl IntoResponse, DispatchError> {
    state.coordinator.get_order(order_id).await?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, order_id, query.party_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, order_id: Uuid, party_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.fanout.subscribe(order_id, party_id);

    info!(order_id = %order_id, party_id = %party_id, "websocket client connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(sequence = event.sequence(), error = %err, "failed to serialize order event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }

        if subscription.is_evicted() {
            warn!(order_id = %order_id, party_id = %party_id, "closing lagging websocket client");
            let _ = sender.send(Message::Close(None)).await;
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    // Aborting the sender drops the subscription, which detaches it.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(order_id = %order_id, party_id = %party_id, "websocket client disconnected");
}
