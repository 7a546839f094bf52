//! OpenAI Realtime binding.
//!
//! Audio is exchanged as base64 G.711 µ-law in both directions so no
//! transcoding is needed on the telephony side. Server VAD drives barge-in and
//! the no-input timer; `end_call` and `transfer_to_agent` tool calls end the
//! session.

use super::{AgentError, VoiceAgentAdapter, connection::AgentConnection};
use crate::{
    config::{AgentProvider, Config},
    ws::handle::SessionHandle,
};
use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{debug, error, info, warn};
use voicebridge_core::protocol::{DisconnectReason, JsonStringMap};

use self::messages::{
    ClientEvent, ContentPart, ConversationItem, OutputItem, ServerEvent, SessionConfig, Tool,
    TurnDetection,
};

pub const END_CALL_TOOL: &str = "end_call";
pub const TRANSFER_TO_AGENT_TOOL: &str = "transfer_to_agent";

mod messages {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Serialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ClientEvent {
        #[serde(rename = "session.update")]
        SessionUpdate { session: SessionConfig },
        #[serde(rename = "input_audio_buffer.append")]
        InputAudioBufferAppend { audio: String },
        #[serde(rename = "conversation.item.create")]
        ConversationItemCreate { item: ConversationItem },
        #[serde(rename = "response.create")]
        ResponseCreate,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct SessionConfig {
        pub turn_detection: TurnDetection,
        pub input_audio_format: &'static str,
        pub output_audio_format: &'static str,
        pub input_audio_transcription: InputAudioTranscription,
        pub voice: String,
        pub instructions: String,
        pub tools: Vec<Tool>,
        pub tool_choice: &'static str,
        pub modalities: Vec<&'static str>,
        pub temperature: f32,
    }

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename = "server_vad")]
    pub(super) struct TurnDetection {
        pub threshold: f32,
        pub prefix_padding_ms: u32,
        pub silence_duration_ms: u32,
        pub create_response: bool,
        pub interrupt_response: bool,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct InputAudioTranscription {
        pub model: &'static str,
    }

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename = "function")]
    pub(super) struct Tool {
        pub name: &'static str,
        pub description: &'static str,
        pub parameters: Value,
    }

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum ConversationItem {
        Message {
            role: &'static str,
            content: Vec<ContentPart>,
        },
        FunctionCallOutput {
            call_id: String,
            output: String,
        },
    }

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum ContentPart {
        InputText { text: String },
    }

    #[derive(Deserialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ServerEvent {
        #[serde(rename = "response.audio.delta")]
        ResponseAudioDelta { delta: String },
        #[serde(rename = "response.done")]
        ResponseDone { response: ResponseResource },
        #[serde(rename = "input_audio_buffer.speech_started")]
        SpeechStarted {},
        #[serde(rename = "input_audio_buffer.speech_stopped")]
        SpeechStopped {},
        #[serde(rename = "conversation.item.input_audio_transcription.completed")]
        InputTranscriptionCompleted { transcript: String },
        #[serde(rename = "error")]
        Error { error: Value },
        #[serde(other)]
        Other,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ResponseResource {
        pub status: String,
        #[serde(default)]
        pub status_details: Option<Value>,
        #[serde(default)]
        pub output: Vec<OutputItem>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum OutputItem {
        #[serde(rename = "function_call")]
        FunctionCall {
            call_id: String,
            name: String,
            #[serde(default)]
            arguments: String,
        },
        #[serde(other)]
        Other,
    }
}

#[derive(Clone, Debug)]
struct OpenAiSettings {
    api_key: SecretString,
    endpoint: String,
    voice: String,
    instructions: String,
    greeting: String,
    no_input_message: String,
}

pub struct OpenAiRealtimeAgent {
    settings: OpenAiSettings,
    connection: Option<AgentConnection>,
    handle: Option<SessionHandle>,
}

impl OpenAiRealtimeAgent {
    pub fn new(config: &Config) -> Result<Self, AgentError> {
        let api_key = config
            .openai
            .api_key
            .clone()
            .ok_or(AgentError::MissingCredential("OPENAI_API_KEY"))?;
        Ok(Self {
            settings: OpenAiSettings {
                api_key,
                endpoint: config.openai.endpoint.clone(),
                voice: config.openai.voice.clone(),
                instructions: config.system_prompt.clone(),
                greeting: config.initial_greeting.clone(),
                no_input_message: config.no_input_message.clone(),
            },
            connection: None,
            handle: None,
        })
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<(), AgentError> {
        match &self.connection {
            Some(connection) => connection.send_json(event).await,
            None => Err(AgentError::NotConnected),
        }
    }

    async fn send_user_text(&self, text: &str) -> Result<(), AgentError> {
        self.send_event(&user_text_item(text)).await?;
        self.send_event(&ClientEvent::ResponseCreate).await
    }
}

fn session_update(settings: &OpenAiSettings) -> ClientEvent {
    ClientEvent::SessionUpdate {
        session: SessionConfig {
            turn_detection: TurnDetection {
                threshold: 0.9,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
                create_response: true,
                interrupt_response: true,
            },
            input_audio_format: "g711_ulaw",
            output_audio_format: "g711_ulaw",
            input_audio_transcription: messages::InputAudioTranscription { model: "whisper-1" },
            voice: settings.voice.clone(),
            instructions: settings.instructions.clone(),
            tools: call_control_tools(),
            tool_choice: "auto",
            modalities: vec!["text", "audio"],
            temperature: 0.8,
        },
    }
}

fn call_control_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: END_CALL_TOOL,
            description: "Ends the phone call once the caller's request is complete.",
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        },
        Tool {
            name: TRANSFER_TO_AGENT_TOOL,
            description: "Transfers the caller to a human agent.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "process": {
                        "type": "string",
                        "description": "What the caller needs help with."
                    }
                }
            }),
        },
    ]
}

fn user_text_item(text: &str) -> ClientEvent {
    ClientEvent::ConversationItemCreate {
        item: ConversationItem::Message {
            role: "user",
            content: vec![ContentPart::InputText {
                text: text.to_string(),
            }],
        },
    }
}

fn to_ws(event: &ClientEvent) -> Option<WsMessage> {
    match serde_json::to_string(event) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(e) => {
            error!(error = %e, "Failed to serialize OpenAI event");
            None
        }
    }
}

/// Applies one backend event to the session. Returns events to send back.
fn handle_server_event(event: ServerEvent, handle: &SessionHandle) -> Vec<ClientEvent> {
    match event {
        ServerEvent::ResponseAudioDelta { delta } => {
            match BASE64_STANDARD.decode(delta.as_bytes()) {
                Ok(audio) => handle.send_audio(Bytes::from(audio)),
                Err(e) => warn!(error = %e, "Discarding undecodable audio delta"),
            }
            Vec::new()
        }
        ServerEvent::ResponseDone { response } => match response.status.as_str() {
            "completed" => {
                handle.flush_audio();
                let mut replies = Vec::new();
                for item in response.output {
                    if let OutputItem::FunctionCall {
                        call_id,
                        name,
                        arguments,
                    } = item
                    {
                        replies.extend(handle_function_call(&call_id, &name, &arguments, handle));
                    }
                }
                replies
            }
            "failed" => {
                let info = response
                    .status_details
                    .as_ref()
                    .and_then(|d| d.pointer("/error/code").or_else(|| d.pointer("/error/type")))
                    .and_then(|v| v.as_str())
                    .unwrap_or("ResponseFailed")
                    .to_string();
                error!(%info, details = ?response.status_details, "OpenAI response failed");
                handle.send_disconnect(DisconnectReason::Error, info, JsonStringMap::new());
                Vec::new()
            }
            status => {
                debug!(status, "OpenAI response finished");
                Vec::new()
            }
        },
        ServerEvent::SpeechStarted {} => {
            info!("Caller started speaking, halting no-input timer and barging in");
            handle.timer().halt();
            handle.send_barge_in();
            Vec::new()
        }
        ServerEvent::SpeechStopped {} => {
            debug!("Caller stopped speaking, resuming no-input timer");
            handle.timer().resume();
            Vec::new()
        }
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            handle.send_transcript(transcript, 1.0, true);
            Vec::new()
        }
        ServerEvent::Error { error } => {
            warn!(?error, "OpenAI reported an error");
            Vec::new()
        }
        ServerEvent::Other => Vec::new(),
    }
}

fn handle_function_call(
    call_id: &str,
    name: &str,
    arguments: &str,
    handle: &SessionHandle,
) -> Vec<ClientEvent> {
    info!(call_id, name, arguments, "OpenAI function call");
    match name {
        END_CALL_TOOL => {
            handle.send_disconnect(DisconnectReason::Completed, "EndCall", JsonStringMap::new());
            Vec::new()
        }
        TRANSFER_TO_AGENT_TOOL => {
            let process = serde_json::from_str::<serde_json::Value>(arguments)
                .ok()
                .and_then(|args| args.get("process").and_then(|p| p.as_str()).map(str::to_owned))
                .unwrap_or_else(|| "TransferToAgent".to_string());
            handle.send_disconnect(DisconnectReason::Completed, process, JsonStringMap::new());
            Vec::new()
        }
        _ => vec![
            ClientEvent::ConversationItemCreate {
                item: ConversationItem::FunctionCallOutput {
                    call_id: call_id.to_string(),
                    output: serde_json::json!({"status": "unsupported"}).to_string(),
                },
            },
            ClientEvent::ResponseCreate,
        ],
    }
}

fn on_message(message: WsMessage, handle: &SessionHandle) -> Vec<WsMessage> {
    let WsMessage::Text(text) = message else {
        return Vec::new();
    };
    match serde_json::from_str::<ServerEvent>(text.as_str()) {
        Ok(event) => handle_server_event(event, handle)
            .iter()
            .filter_map(to_ws)
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to parse OpenAI event");
            Vec::new()
        }
    }
}

#[async_trait]
impl VoiceAgentAdapter for OpenAiRealtimeAgent {
    fn provider(&self) -> AgentProvider {
        AgentProvider::OpenAI
    }

    async fn connect(&mut self, handle: SessionHandle) -> Result<(), AgentError> {
        if self.is_connected() {
            return Ok(());
        }
        let mut request = self
            .settings
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Connection(e.to_string()))?;
        let key = self.settings.api_key.expose_secret();
        let headers = request.headers_mut();
        for (name, value) in [
            ("api-key", key.to_string()),
            ("Authorization", format!("Bearer {key}")),
            ("OpenAI-Beta", "realtime=v1".to_string()),
        ] {
            let value = value
                .parse()
                .map_err(|_| AgentError::Connection(format!("invalid {name} header")))?;
            headers.insert(name, value);
        }

        let connection =
            AgentConnection::open("openai", request, handle.clone(), on_message).await?;
        self.connection = Some(connection);
        self.handle = Some(handle);

        self.send_event(&session_update(&self.settings)).await?;
        let greeting = self.settings.greeting.clone();
        self.send_user_text(&greeting).await
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(AgentConnection::is_connected)
    }

    async fn process_audio(&mut self, audio: Bytes) -> Result<(), AgentError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.send_event(&ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(&audio),
        })
        .await
    }

    async fn process_playback_completed(&mut self) -> Result<(), AgentError> {
        if let (true, Some(handle)) = (self.is_connected(), self.handle.as_ref()) {
            debug!("Playback completed, starting no-input timer");
            handle.timer().start();
        }
        Ok(())
    }

    async fn send_keep_alive(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn handle_no_input(&mut self) -> Result<(), AgentError> {
        if !self.is_connected() {
            return Ok(());
        }
        info!("No input from caller, prompting the model");
        let message = self.settings.no_input_message.clone();
        self.send_user_text(&message).await
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.handle = None;
    }
}
