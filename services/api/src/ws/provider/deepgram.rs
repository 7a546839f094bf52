//! Deepgram Voice Agent binding.
//!
//! Caller audio is forwarded as raw µ-law binary frames; agent speech comes back
//! the same way. Settings are sent in reply to the server's `Welcome`.

use super::{AgentError, VoiceAgentAdapter, connection::AgentConnection};
use crate::{
    config::{AgentProvider, Config},
    ws::handle::SessionHandle,
};
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{debug, error, info, warn};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
enum ClientMessage {
    Settings(Box<AgentSettings>),
    KeepAlive,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct AgentSettings {
    audio: AudioSettings,
    agent: AgentBehaviour,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct AudioSettings {
    input: AudioFormat,
    output: AudioFormat,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct AudioFormat {
    encoding: &'static str,
    sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    container: Option<&'static str>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct AgentBehaviour {
    greeting: String,
    listen: ProviderStage,
    think: ThinkStage,
    speak: ProviderStage,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct ProviderStage {
    provider: ProviderSpec,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct ThinkStage {
    provider: ProviderSpec,
    prompt: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct ProviderSpec {
    #[serde(rename = "type")]
    provider_type: String,
    model: String,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ServerMessage {
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    SettingsApplied,
    UserStartedSpeaking,
    AgentAudioDone,
    ConversationText {
        role: String,
        content: String,
    },
    Error {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    Warning {
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(other)]
    Other,
}

pub struct DeepgramVoiceAgent {
    api_key: SecretString,
    endpoint: String,
    settings: AgentSettings,
    connection: Option<AgentConnection>,
}

impl DeepgramVoiceAgent {
    pub fn new(config: &Config) -> Result<Self, AgentError> {
        let api_key = config
            .deepgram
            .api_key
            .clone()
            .ok_or(AgentError::MissingCredential("DEEPGRAM_API_KEY"))?;
        Ok(Self {
            api_key,
            endpoint: config.deepgram.endpoint.clone(),
            settings: agent_settings(config),
            connection: None,
        })
    }
}

fn agent_settings(config: &Config) -> AgentSettings {
    let deepgram = &config.deepgram;
    AgentSettings {
        audio: AudioSettings {
            input: AudioFormat {
                encoding: "mulaw",
                sample_rate: 8000,
                container: None,
            },
            output: AudioFormat {
                encoding: "mulaw",
                sample_rate: 8000,
                container: Some("none"),
            },
        },
        agent: AgentBehaviour {
            greeting: config.initial_greeting.clone(),
            listen: ProviderStage {
                provider: ProviderSpec {
                    provider_type: "deepgram".to_string(),
                    model: deepgram.listen_model.clone(),
                },
            },
            think: ThinkStage {
                provider: ProviderSpec {
                    provider_type: deepgram.think_provider_type.clone(),
                    model: deepgram.think_provider_model.clone(),
                },
                prompt: config.system_prompt.clone(),
            },
            speak: ProviderStage {
                provider: ProviderSpec {
                    provider_type: "deepgram".to_string(),
                    model: deepgram.speak_voice.clone(),
                },
            },
        },
    }
}

/// Applies one text event to the session. Returns messages to send back.
fn handle_server_message(
    message: ServerMessage,
    settings: &AgentSettings,
    handle: &SessionHandle,
) -> Vec<ClientMessage> {
    match message {
        ServerMessage::Welcome { request_id } => {
            info!(?request_id, "Deepgram welcome received, sending settings");
            vec![ClientMessage::Settings(Box::new(settings.clone()))]
        }
        ServerMessage::SettingsApplied => {
            debug!("Deepgram settings applied");
            Vec::new()
        }
        ServerMessage::UserStartedSpeaking => {
            if handle.is_audio_playing() {
                info!("Caller started speaking during playback, barging in");
                handle.send_barge_in();
            }
            handle.set_audio_playing(false);
            Vec::new()
        }
        ServerMessage::AgentAudioDone => {
            handle.flush_audio();
            Vec::new()
        }
        ServerMessage::ConversationText { role, content } => {
            if role == "user" {
                handle.send_transcript(content, 1.0, true);
            } else {
                debug!(%role, %content, "Deepgram conversation text");
            }
            Vec::new()
        }
        ServerMessage::Error { description, code } => {
            error!(?code, ?description, "Deepgram reported an error");
            Vec::new()
        }
        ServerMessage::Warning { description } => {
            warn!(?description, "Deepgram warning");
            Vec::new()
        }
        ServerMessage::Other => Vec::new(),
    }
}

fn on_message(message: WsMessage, settings: &AgentSettings, handle: &SessionHandle) -> Vec<WsMessage> {
    match message {
        WsMessage::Binary(audio) => {
            handle.send_audio(audio);
            Vec::new()
        }
        WsMessage::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
            Ok(event) => handle_server_message(event, settings, handle)
                .iter()
                .filter_map(|reply| match serde_json::to_string(reply) {
                    Ok(json) => Some(WsMessage::Text(json.into())),
                    Err(e) => {
                        error!(error = %e, "Failed to serialize Deepgram message");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to parse Deepgram message");
                Vec::new()
            }
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl VoiceAgentAdapter for DeepgramVoiceAgent {
    fn provider(&self) -> AgentProvider {
        AgentProvider::Deepgram
    }

    async fn connect(&mut self, handle: SessionHandle) -> Result<(), AgentError> {
        if self.is_connected() {
            return Ok(());
        }
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Connection(e.to_string()))?;
        let auth = format!("Token {}", self.api_key.expose_secret())
            .parse()
            .map_err(|_| AgentError::Connection("invalid Authorization header".to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let settings = self.settings.clone();
        let connection = AgentConnection::open("deepgram", request, handle, move |message, handle| {
            on_message(message, &settings, handle)
        })
        .await?;
        self.connection = Some(connection);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(AgentConnection::is_connected)
    }

    async fn process_audio(&mut self, audio: Bytes) -> Result<(), AgentError> {
        match &self.connection {
            Some(connection) if connection.is_connected() => {
                connection.send(WsMessage::Binary(audio)).await
            }
            _ => Ok(()),
        }
    }

    async fn process_playback_completed(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn send_keep_alive(&mut self) -> Result<(), AgentError> {
        match &self.connection {
            Some(connection) if connection.is_connected() => {
                debug!("Sending Deepgram KeepAlive");
                connection.send_json(&ClientMessage::KeepAlive).await
            }
            _ => Ok(()),
        }
    }

    async fn handle_no_input(&mut self) -> Result<(), AgentError> {
        info!("No input from caller; Deepgram has no prompt hook, ignoring");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::handle::{AgentEvent, SessionEvent};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn settings() -> AgentSettings {
        agent_settings(&Config::for_tests(AgentProvider::Deepgram))
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(SessionEvent::Agent(event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn text(value: serde_json::Value) -> WsMessage {
        WsMessage::Text(value.to_string().into())
    }

    #[test]
    fn test_welcome_is_answered_with_settings() {
        let (handle, _rx) = SessionHandle::detached("s");
        let replies = on_message(
            text(json!({"type": "Welcome", "request_id": "r-1"})),
            &settings(),
            &handle,
        );
        assert_eq!(replies.len(), 1);
        let WsMessage::Text(reply) = &replies[0] else {
            panic!("settings must be sent as text");
        };
        let value: serde_json::Value = serde_json::from_str(reply.as_str()).unwrap();
        assert_eq!(value["type"], "Settings");
        assert_eq!(value["audio"]["input"], json!({"encoding": "mulaw", "sample_rate": 8000}));
        assert_eq!(value["audio"]["output"]["container"], "none");
        assert_eq!(value["agent"]["greeting"], "Hello");
        assert_eq!(value["agent"]["listen"]["provider"]["model"], "nova-2-phonecall");
        assert_eq!(value["agent"]["think"]["provider"]["type"], "openai");
        assert_eq!(value["agent"]["speak"]["provider"]["model"], "aura-asteria-en");
    }

    #[test]
    fn test_keep_alive_shape() {
        assert_eq!(
            serde_json::to_value(ClientMessage::KeepAlive).unwrap(),
            json!({"type": "KeepAlive"})
        );
    }

    #[test]
    fn test_binary_frames_become_session_audio() {
        let (handle, mut rx) = SessionHandle::detached("s");
        let replies = on_message(
            WsMessage::Binary(Bytes::from_static(&[0x7f; 80])),
            &settings(),
            &handle,
        );
        assert!(replies.is_empty());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [AgentEvent::Audio(audio)] if audio.len() == 80
        ));
    }

    #[test]
    fn test_user_started_speaking_barges_in_only_while_playing() {
        let (handle, mut rx) = SessionHandle::detached("s");
        let settings = settings();

        on_message(text(json!({"type": "UserStartedSpeaking"})), &settings, &handle);
        assert!(drain(&mut rx).is_empty());

        handle.set_audio_playing(true);
        on_message(text(json!({"type": "UserStartedSpeaking"})), &settings, &handle);
        assert!(matches!(drain(&mut rx).as_slice(), [AgentEvent::BargeIn]));
        assert!(!handle.is_audio_playing());
    }

    #[test]
    fn test_audio_done_flushes_and_user_text_is_transcribed() {
        let (handle, mut rx) = SessionHandle::detached("s");
        let settings = settings();
        on_message(text(json!({"type": "AgentAudioDone"})), &settings, &handle);
        on_message(
            text(json!({"type": "ConversationText", "role": "assistant", "content": "Hi there"})),
            &settings,
            &handle,
        );
        on_message(
            text(json!({"type": "ConversationText", "role": "user", "content": "My order"})),
            &settings,
            &handle,
        );
        on_message(text(json!({"type": "AgentThinking", "content": ""})), &settings, &handle);

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::FlushAudio, AgentEvent::Transcript { text, .. }] if text == "My order"
        ));
    }
}
