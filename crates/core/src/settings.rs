use crate::{
    audio_buffer::AudioChunkBuffer, dtmf::DtmfPolicy, error::AudioBufferError,
};
use std::time::Duration;

pub const DEFAULT_MAX_BINARY_MESSAGE_SIZE: usize = 64_000;
pub const DEFAULT_MIN_BINARY_MESSAGE_SIZE: usize = 8_000;
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_NO_INPUT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Per-session tuning shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_binary_message_size: usize,
    pub min_binary_message_size: usize,
    /// How long undersized outbound audio may wait before it is sent anyway.
    pub flush_delay: Duration,
    pub no_input_timeout: Duration,
    pub dtmf: DtmfPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_binary_message_size: DEFAULT_MAX_BINARY_MESSAGE_SIZE,
            min_binary_message_size: DEFAULT_MIN_BINARY_MESSAGE_SIZE,
            flush_delay: DEFAULT_FLUSH_DELAY,
            no_input_timeout: DEFAULT_NO_INPUT_TIMEOUT,
            dtmf: DtmfPolicy::default(),
        }
    }
}

impl SessionSettings {
    /// Checks the frame-size thresholds. Called once at startup.
    pub fn validate(&self) -> Result<(), AudioBufferError> {
        self.audio_buffer().map(|_| ())
    }

    pub fn audio_buffer(&self) -> Result<AudioChunkBuffer, AudioBufferError> {
        AudioChunkBuffer::new(self.min_binary_message_size, self.max_binary_message_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = SessionSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_binary_message_size, 64_000);
        assert_eq!(settings.min_binary_message_size, 8_000);
        assert_eq!(settings.flush_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let settings = SessionSettings {
            min_binary_message_size: 70_000,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(AudioBufferError::InvalidThresholds {
                min_size: 70_000,
                max_size: 64_000
            })
        ));
    }
}
