//! Backend voice-agent adapters and the factory that selects one.

mod connection;
pub mod deepgram;
pub mod openai;

use super::handle::SessionHandle;
use crate::config::{AgentProvider, Config};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;

pub use deepgram::DeepgramVoiceAgent;
pub use openai::OpenAiRealtimeAgent;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Unknown voice agent provider: {0}")]
    UnknownProvider(String),

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Voice agent connection failed: {0}")]
    Connection(String),

    #[error("Voice agent is not connected")]
    NotConnected,

    #[error("Failed to send to voice agent: {0}")]
    Send(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The contract every voice-AI backend binding implements.
///
/// A session owns exactly one adapter. All methods are called from the session
/// task; an adapter reports back only through the [`SessionHandle`] it receives
/// in [`connect`](Self::connect).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceAgentAdapter: Send + Sync {
    fn provider(&self) -> AgentProvider;

    async fn connect(&mut self, handle: SessionHandle) -> Result<(), AgentError>;

    fn is_connected(&self) -> bool;

    /// Forwards caller audio. A no-op when not connected.
    async fn process_audio(&mut self, audio: Bytes) -> Result<(), AgentError>;

    async fn process_playback_completed(&mut self) -> Result<(), AgentError>;

    async fn send_keep_alive(&mut self) -> Result<(), AgentError>;

    /// Called when the no-input timer elapses.
    async fn handle_no_input(&mut self) -> Result<(), AgentError>;

    /// Tears down the backend connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Builds the adapter for `provider` (matched case-insensitively).
pub fn create_agent(
    provider: &str,
    config: &Config,
) -> Result<Box<dyn VoiceAgentAdapter>, AgentError> {
    let provider = AgentProvider::parse(provider)
        .ok_or_else(|| AgentError::UnknownProvider(provider.to_string()))?;
    info!(provider = provider.as_str(), "Creating voice agent");
    match provider {
        AgentProvider::OpenAI => Ok(Box::new(OpenAiRealtimeAgent::new(config)?)),
        AgentProvider::Deepgram => Ok(Box::new(DeepgramVoiceAgent::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_is_case_insensitive() {
        let config = Config::for_tests(AgentProvider::OpenAI);

        let agent = create_agent("OpenAI", &config).unwrap();
        assert_eq!(agent.provider(), AgentProvider::OpenAI);
        assert!(!agent.is_connected());

        let agent = create_agent("DEEPGRAM", &config).unwrap();
        assert_eq!(agent.provider(), AgentProvider::Deepgram);
    }

    #[test]
    fn test_factory_rejects_unknown_provider() {
        let config = Config::for_tests(AgentProvider::OpenAI);
        match create_agent("gemini", &config) {
            Err(AgentError::UnknownProvider(name)) => assert_eq!(name, "gemini"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("unknown provider must not build an agent"),
        }
    }

    #[test]
    fn test_factory_requires_credentials() {
        let mut config = Config::for_tests(AgentProvider::Deepgram);
        config.deepgram.api_key = None;
        assert!(matches!(
            create_agent("deepgram", &config),
            Err(AgentError::MissingCredential("DEEPGRAM_API_KEY"))
        ));
    }

    #[tokio::test]
    async fn test_adapters_ignore_audio_before_connect() {
        let config = Config::for_tests(AgentProvider::OpenAI);
        for name in ["openai", "deepgram"] {
            let mut agent = create_agent(name, &config).unwrap();
            agent
                .process_audio(Bytes::from_static(&[0xff; 160]))
                .await
                .unwrap();
            agent.send_keep_alive().await.unwrap();
            agent.close().await;
            agent.close().await;
            assert!(!agent.is_connected());
        }
    }
}
