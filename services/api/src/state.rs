//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the resources every
//! WebSocket session is built from.

use crate::{config::Config, ws::MessageHandlerRegistry};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub handlers: Arc<MessageHandlerRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            handlers: Arc::new(MessageHandlerRegistry::with_defaults()),
        }
    }
}
