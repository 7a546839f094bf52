//! Telephony Session Protocol over WebSockets
//!
//! This module contains the core logic for bridging a telephony audio stream to
//! a voice-AI backend. It is structured into submodules for clarity:
//!
//! - `protocol`: Frames exchanged between the socket pumps and the session task.
//! - `socket`: The WebSocket upgrade and the reader/writer pumps.
//! - `session`: The per-connection protocol engine.
//! - `handlers`: Control-message handlers keyed by message type.
//! - `handle`: The channel an adapter uses to call back into its session.
//! - `provider`: Connections to third-party voice agents (OpenAI, Deepgram).

pub mod handle;
pub mod handlers;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod socket;

pub use handle::SessionHandle;
pub use handlers::{MessageHandler, MessageHandlerRegistry};
pub use session::Session;
pub use socket::ws_handler;
