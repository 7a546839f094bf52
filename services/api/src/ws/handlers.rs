//! Control-message handlers, keyed by message type.

use super::session::Session;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};
use voicebridge_core::{
    ProtocolError,
    protocol::{CloseParameters, ClientMessage, DtmfParameters, ErrorParameters, OpenParameters},
};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        session: &mut Session,
        message: &ClientMessage,
    ) -> Result<(), ProtocolError>;
}

/// Maps a message `type` to the handler that processes it.
#[derive(Default, Clone)]
pub struct MessageHandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl MessageHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in handlers for every client message type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("open", OpenHandler);
        registry.register("close", CloseHandler);
        registry.register("ping", PingHandler);
        registry.register("dtmf", DtmfHandler);
        registry.register("playback_started", PlaybackStartedHandler);
        registry.register("playback_completed", PlaybackCompletedHandler);
        registry.register("error", ErrorHandler);
        registry
    }

    /// Registers `handler` for `message_type`, replacing any existing one.
    pub fn register(&mut self, message_type: impl Into<String>, handler: impl MessageHandler + 'static) {
        let message_type = message_type.into();
        if self
            .handlers
            .insert(message_type.clone(), Arc::new(handler))
            .is_some()
        {
            debug!(message_type, "Replaced message handler");
        }
    }

    pub fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }
}

pub struct OpenHandler;

#[async_trait]
impl MessageHandler for OpenHandler {
    async fn handle(
        &self,
        session: &mut Session,
        message: &ClientMessage,
    ) -> Result<(), ProtocolError> {
        let params: OpenParameters = message.parameters_as()?;
        let media = session.apply_open(params);
        session.send_opened(media).await;
        session.connect_adapter().await;
        Ok(())
    }
}

pub struct CloseHandler;

#[async_trait]
impl MessageHandler for CloseHandler {
    async fn handle(
        &self,
        session: &mut Session,
        message: &ClientMessage,
    ) -> Result<(), ProtocolError> {
        let reason = message
            .parameters_as::<CloseParameters>()
            .ok()
            .and_then(|p| p.reason);
        info!(?reason, "Client requested close");
        session.send_closed().await;
        session.close().await;
        Ok(())
    }
}

pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        session: &mut Session,
        _message: &ClientMessage,
    ) -> Result<(), ProtocolError> {
        session.send_keep_alive().await;
        Ok(())
    }
}

pub struct DtmfHandler;

#[async_trait]
impl MessageHandler for DtmfHandler {
    async fn handle(
        &self,
        session: &mut Session,
        message: &ClientMessage,
    ) -> Result<(), ProtocolError> {
        let params: DtmfParameters = message.parameters_as()?;
        session.process_dtmf(&params.digit).await
    }
}

pub struct PlaybackStartedHandler;

#[async_trait]
impl MessageHandler for PlaybackStartedHandler {
    async fn handle(
        &self,
        session: &mut Session,
        _message: &ClientMessage,
    ) -> Result<(), ProtocolError> {
        session.set_audio_playing(true);
        Ok(())
    }
}

pub struct PlaybackCompletedHandler;

#[async_trait]
impl MessageHandler for PlaybackCompletedHandler {
    async fn handle(
        &self,
        session: &mut Session,
        _message: &ClientMessage,
    ) -> Result<(), ProtocolError> {
        session.process_playback_completed().await;
        Ok(())
    }
}

pub struct ErrorHandler;

#[async_trait]
impl MessageHandler for ErrorHandler {
    async fn handle(
        &self,
        _session: &mut Session,
        message: &ClientMessage,
    ) -> Result<(), ProtocolError> {
        match message.parameters_as::<ErrorParameters>() {
            Ok(params) => warn!(code = ?params.code, message = ?params.message, "Client reported an error"),
            Err(_) => warn!(parameters = %message.parameters, "Client reported an error"),
        }
        Ok(())
    }
}
