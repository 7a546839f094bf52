//! A backend WebSocket connection driven by its own task.

use super::AgentError;
use crate::ws::handle::SessionHandle;
use futures_util::{SinkExt, StreamExt};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message as WsMessage, handshake::client::Request},
};
use tracing::{Instrument, debug, error, info, warn};

const WS_CHANNEL_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the writer side of a backend socket. Incoming messages are passed to
/// `on_message`, whose returned messages are written back in order.
pub(super) struct AgentConnection {
    name: &'static str,
    sender: mpsc::Sender<WsMessage>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl AgentConnection {
    pub(super) async fn open<F>(
        name: &'static str,
        request: Request,
        handle: SessionHandle,
        mut on_message: F,
    ) -> Result<Self, AgentError>
    where
        F: FnMut(WsMessage, &SessionHandle) -> Vec<WsMessage> + Send + 'static,
    {
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| AgentError::Connection(format!("{name}: {e}")))?;
        info!(provider = name, "Connected to voice agent");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (sender, mut rx) = mpsc::channel::<WsMessage>(WS_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        let task_connected = connected.clone();
        let task_closing = closing.clone();
        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        Some(outgoing) = rx.recv() => {
                            let is_close = matches!(outgoing, WsMessage::Close(_));
                            if let Err(e) = ws_sink.send(outgoing).await {
                                warn!(provider = name, error = %e, "Failed to write to voice agent");
                                break;
                            }
                            if is_close {
                                break;
                            }
                        }
                        incoming = ws_stream.next() => match incoming {
                            Some(Ok(WsMessage::Close(frame))) => {
                                info!(provider = name, ?frame, "Voice agent closed the connection");
                                break;
                            }
                            Some(Ok(WsMessage::Ping(data))) => {
                                if let Err(e) = ws_sink.send(WsMessage::Pong(data)).await {
                                    warn!(provider = name, error = %e, "Failed to answer ping");
                                }
                            }
                            Some(Ok(message)) => {
                                for reply in on_message(message, &handle) {
                                    if let Err(e) = ws_sink.send(reply).await {
                                        warn!(provider = name, error = %e, "Failed to reply to voice agent");
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                error!(provider = name, error = %e, "Voice agent socket error");
                                break;
                            }
                            None => break,
                        },
                    }
                }

                task_connected.store(false, Ordering::SeqCst);
                if !task_closing.load(Ordering::SeqCst) {
                    handle.report_error(AgentError::Connection(format!(
                        "{name} connection lost"
                    )));
                }
                debug!(provider = name, "Voice agent connection task finished");
            }
            .in_current_span(),
        );

        Ok(Self {
            name,
            sender,
            connected,
            closing,
            task,
        })
    }

    pub(super) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(super) async fn send(&self, message: WsMessage) -> Result<(), AgentError> {
        if !self.is_connected() {
            return Err(AgentError::NotConnected);
        }
        self.sender
            .send(message)
            .await
            .map_err(|e| AgentError::Send(e.to_string()))
    }

    pub(super) async fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<(), AgentError> {
        let text = serde_json::to_string(value)?;
        self.send(WsMessage::Text(text.into())).await
    }

    /// Sends a close frame and waits briefly for the task to finish.
    pub(super) async fn close(mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if self.is_connected() {
            info!(provider = self.name, "Closing voice agent connection");
            let _ = self.sender.try_send(WsMessage::Close(None));
        }
        self.connected.store(false, Ordering::SeqCst);
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            debug!(provider = self.name, "Voice agent did not close in time, aborting");
        }
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}
