use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use orra_wire::Envelope;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    #[serde(rename = "serviceId")]
    service_id: String,
    #[serde(rename = "apiKey")]
    api_key: String,
}

/// Service channel handshake: `GET /ws?serviceId=…&apiKey=…`. The key and
/// the service's project membership are checked before the upgrade.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let project = match state.engine.projects.authenticate(&query.api_key).await {
        Ok(project) => project,
        Err(err) => return ApiError(err).into_response(),
    };
    let service = match state
        .engine
        .registry
        .lookup(&project.id, &query.service_id)
        .await
    {
        Ok(service) => service,
        Err(err) => return ApiError(err).into_response(),
    };
    let max_bytes = state.engine.config.message_max_bytes;
    ws.max_message_size(max_bytes)
        .on_upgrade(move |socket| service_channel(socket, state, project.id, service.id))
}

/// One long-lived bidirectional channel per service instance. Outbound
/// messages flow from the connection manager through an mpsc pump; inbound
/// envelopes are ACKed, deduplicated and routed to the owning orchestration.
async fn service_channel(socket: WebSocket, state: AppState, project_id: String, service_id: String) {
    let engine = state.engine;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let generation = engine
        .connections
        .attach(&project_id, &service_id, outbound_tx)
        .await;

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let max_bytes = engine.config.message_max_bytes;
    while let Some(Ok(frame)) = stream.next().await {
        let raw = match frame {
            WsMessage::Text(text) => text.as_bytes().to_vec(),
            WsMessage::Binary(bytes) => bytes.to_vec(),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if raw.len() > max_bytes {
            tracing::warn!(
                target: "orra.conn",
                service_id = %service_id,
                size = raw.len(),
                "oversized frame dropped"
            );
            continue;
        }
        match serde_json::from_slice::<Envelope>(&raw) {
            Ok(envelope) => {
                engine
                    .handle_envelope(&project_id, &service_id, envelope)
                    .await;
            }
            Err(err) => {
                tracing::warn!(
                    target: "orra.conn",
                    service_id = %service_id,
                    error = %err,
                    "unparseable frame dropped"
                );
            }
        }
    }

    engine.connections.detach(&service_id, generation).await;
    writer.abort();
    tracing::debug!(target: "orra.conn", service_id = %service_id, "service channel closed");
}
