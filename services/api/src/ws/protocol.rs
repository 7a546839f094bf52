//! Transport-level frames exchanged between the socket tasks and a session.
//!
//! The control-message JSON model itself lives in `voicebridge_core::protocol`;
//! these types only say whether a frame is text, binary or a close.

use bytes::Bytes;

/// A frame read from the client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// A frame the session wants written to the client connection, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

impl OutboundFrame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutboundFrame::Text(text) => Some(text),
            OutboundFrame::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            OutboundFrame::Binary(bytes) => Some(bytes),
            OutboundFrame::Text(_) => None,
        }
    }
}
