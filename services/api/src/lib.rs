//! Voice Bridge API Library Crate
//!
//! This library contains all the logic for the voice bridge web service:
//! configuration, the application state, HTTP routing and the WebSocket session
//! engine with its voice-agent adapters. The `api` binary is a thin wrapper
//! around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
