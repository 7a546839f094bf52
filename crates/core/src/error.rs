//! Error taxonomy shared by the protocol engine and its building blocks.

use thiserror::Error;

/// Errors raised while validating or handling client control messages.
///
/// Sequencing and identity failures are fatal to the session: the engine sends
/// a `disconnect` before surfacing them. `MalformedMessage` is the only
/// non-fatal variant; the offending frame is dropped and the session continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `received` is `None` when `seq` is absent or not an unsigned integer.
    #[error(
        "Invalid client sequence number: expected {expected}, received {}",
        .received.map_or_else(|| "none".to_string(), |seq| seq.to_string())
    )]
    Sequence {
        expected: u64,
        received: Option<u64>,
    },

    /// `received` is `None` when `id` is absent or not a string.
    #[error(
        "Invalid client session id: expected '{expected}', received '{}'",
        .received.as_deref().unwrap_or("none")
    )]
    Identity {
        expected: String,
        received: Option<String>,
    },

    /// `acknowledged` is `None` when `serverseq` is present but not an
    /// unsigned integer.
    #[error(
        "Invalid server sequence number: {} was acknowledged but only {last_sent} were sent",
        .acknowledged.map_or_else(|| "none".to_string(), |seq| seq.to_string())
    )]
    ServerSequence {
        acknowledged: Option<u64>,
        last_sent: u64,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("DTMF capture failed: {0}")]
    DtmfCapture(#[from] DtmfCaptureError),

    #[error("Invalid session configuration: {0}")]
    Configuration(String),
}

/// Errors reported by the DTMF capture state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DtmfCaptureError {
    #[error("'{0}' is not a DTMF digit")]
    InvalidDigit(String),

    #[error("capture already completed")]
    CaptureComplete,
}

/// Errors raised when constructing an [`AudioChunkBuffer`](crate::audio_buffer::AudioChunkBuffer).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioBufferError {
    #[error("invalid frame size thresholds: min {min_size} must be non-zero and <= max {max_size}")]
    InvalidThresholds { min_size: usize, max_size: usize },
}

impl From<AudioBufferError> for ProtocolError {
    fn from(err: AudioBufferError) -> Self {
        ProtocolError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::Sequence {
            expected: 3,
            received: Some(4),
        };
        assert_eq!(
            err.to_string(),
            "Invalid client sequence number: expected 3, received 4"
        );

        let err = ProtocolError::Sequence {
            expected: 3,
            received: None,
        };
        assert_eq!(
            err.to_string(),
            "Invalid client sequence number: expected 3, received none"
        );

        let err = ProtocolError::Identity {
            expected: "abc".into(),
            received: None,
        };
        assert_eq!(
            err.to_string(),
            "Invalid client session id: expected 'abc', received 'none'"
        );

        let err = ProtocolError::ServerSequence {
            acknowledged: Some(9),
            last_sent: 2,
        };
        assert!(err.to_string().contains("9 was acknowledged"));
    }

    #[test]
    fn test_dtmf_error_converts_into_protocol_error() {
        let err: ProtocolError = DtmfCaptureError::InvalidDigit("x".into()).into();
        assert_eq!(
            err,
            ProtocolError::DtmfCapture(DtmfCaptureError::InvalidDigit("x".into()))
        );
    }

    #[test]
    fn test_buffer_error_becomes_configuration_error() {
        let err: ProtocolError = AudioBufferError::InvalidThresholds {
            min_size: 10,
            max_size: 5,
        }
        .into();
        assert!(matches!(err, ProtocolError::Configuration(msg) if msg.contains("min 10")));
    }
}
