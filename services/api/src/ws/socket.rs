//! Telephony WebSocket endpoint: upgrade, frame pumps and session startup.

use super::{
    protocol::{InboundFrame, OutboundFrame},
    provider::create_agent,
    session::Session,
};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Header carrying the client's session id.
pub const SESSION_ID_HEADER: &str = "audiohook-session-id";

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;

/// Axum handler to upgrade an HTTP connection to a session WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        warn!("Rejecting WebSocket upgrade without {SESSION_ID_HEADER} header");
        return (
            StatusCode::BAD_REQUEST,
            format!("{SESSION_ID_HEADER} header is required"),
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

#[instrument(name = "ws_session", skip_all, fields(session_id = %session_id))]
async fn handle_socket(socket: WebSocket, session_id: String, state: Arc<AppState>) {
    info!("WebSocket connection established");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let adapter = match create_agent(state.config.provider.as_str(), &state.config) {
        Ok(adapter) => adapter,
        Err(e) => {
            error!(error = %e, "Failed to create voice agent");
            let _ = socket_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CAPACITY);
    let session = match Session::new(
        session_id,
        state.config.session.clone(),
        adapter,
        state.handlers.clone(),
        outbound_tx,
    ) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Invalid session settings");
            let _ = socket_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let writer = tokio::spawn(
        async move {
            while let Some(frame) = outbound_rx.recv().await {
                let message = match frame {
                    OutboundFrame::Text(text) => Message::Text(text.into()),
                    OutboundFrame::Binary(bytes) => Message::Binary(bytes),
                };
                if let Err(e) = socket_tx.send(message).await {
                    warn!(error = %e, "Failed to write to client, stopping writer");
                    return;
                }
            }
            let _ = socket_tx.send(Message::Close(None)).await;
            debug!("Writer finished");
        }
        .in_current_span(),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundFrame>(INBOUND_CAPACITY);
    let reader = tokio::spawn(
        async move {
            while let Some(message) = socket_rx.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => InboundFrame::Text(text.to_string()),
                    Ok(Message::Binary(bytes)) => InboundFrame::Binary(bytes),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Client sent close frame");
                        InboundFrame::Close
                    }
                    Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                    Err(e) => {
                        warn!(error = %e, "WebSocket read error");
                        InboundFrame::Close
                    }
                };
                let is_close = matches!(frame, InboundFrame::Close);
                if inbound_tx.send(frame).await.is_err() || is_close {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    session.run(inbound_rx).await;

    reader.abort();
    if let Err(e) = writer.await {
        if !e.is_cancelled() {
            error!(error = %e, "Writer task failed");
        }
    }
    info!("WebSocket connection closed");
}
