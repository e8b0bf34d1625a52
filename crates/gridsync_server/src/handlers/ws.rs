use crate::handlers::AppState;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

/// WebSocket upgrade handler for the live channel.
///
/// One connection subscribes to exactly one dataset for its lifetime.
/// The channel is receive-mostly: edits flow through the REST surface and
/// come back here as broadcasts after they are durably applied.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(dataset_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.repo.get_dataset(dataset_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(
                "WebSocket connection rejected: dataset not found: {}",
                dataset_id
            );
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            error!("Failed to resolve dataset {}: {}", dataset_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, dataset_id))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, dataset_id: i64) {
    let (conn_id, mut broadcast_rx) = state.hub.subscribe(dataset_id).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    info!(
        "WebSocket connected: dataset={}, connection={}",
        dataset_id, conn_id
    );

    loop {
        tokio::select! {
            // Push broadcasts from the hub to this client
            maybe = broadcast_rx.recv() => {
                match maybe {
                    Some(message) => {
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize broadcast: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                            debug!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    // Sender dropped: the hub evicted this connection
                    None => break,
                }
            }

            // Drain client frames; input beyond keepalive is ignored
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket closed: connection={}", conn_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Runs on every exit path, abnormal disconnects included
    state.hub.unsubscribe(dataset_id, conn_id).await;

    info!(
        "WebSocket disconnected: dataset={}, connection={}",
        dataset_id, conn_id
    );
}
