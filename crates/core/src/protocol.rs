//! Sequenced control-message model for the telephony audio WebSocket protocol.
//!
//! Every control message shares one envelope: `{id, version, seq, clientseq,
//! type, parameters}`. Client messages are parsed loosely (the `type` stays a
//! string so unknown types can be logged and ignored), while server messages
//! are built from the typed [`ServerMessageBody`] enum.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// Protocol version stamped on every server message.
pub const PROTOCOL_VERSION: &str = "2";

/// Opaque string-keyed map passed through between the client and the backend.
pub type JsonStringMap = Map<String, Value>;

// --- Client → Server ---

/// A control message received from the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ClientMessage {
    #[serde(default)]
    pub version: Option<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub seq: u64,
    /// The last server sequence number the client has seen, when provided.
    #[serde(default)]
    pub serverseq: Option<u64>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

impl ClientMessage {
    /// Deserializes the `parameters` object into a typed parameter struct.
    ///
    /// A missing or `null` parameters field is treated as an empty object.
    pub fn parameters_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = if self.parameters.is_null() {
            Value::Object(Map::new())
        } else {
            self.parameters.clone()
        };
        serde_json::from_value(value).map_err(|e| {
            ProtocolError::MalformedMessage(format!(
                "invalid parameters for '{}': {}",
                self.message_type, e
            ))
        })
    }
}

/// A negotiated (or offered) audio media descriptor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MediaParameter {
    #[serde(rename = "type")]
    pub media_type: String,
    pub format: String,
    pub channels: Vec<String>,
    pub rate: u32,
}

impl MediaParameter {
    /// Returns true for 8-bit µ-law audio.
    pub fn is_pcmu(&self) -> bool {
        self.format.eq_ignore_ascii_case("PCMU")
    }
}

/// Parameters of the client's `open` message.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenParameters {
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub participant: Option<Value>,
    #[serde(default)]
    pub media: Vec<MediaParameter>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub input_variables: JsonStringMap,
}

impl OpenParameters {
    /// Picks the media the bridge will use: the first µ-law offer, otherwise
    /// whatever was offered first.
    pub fn select_media(&self) -> Option<MediaParameter> {
        self.media
            .iter()
            .find(|m| m.is_pcmu())
            .or_else(|| self.media.first())
            .cloned()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DtmfParameters {
    pub digit: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CloseParameters {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ErrorParameters {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

// --- Server → Client ---

/// A control message sent to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ServerMessage {
    pub version: &'static str,
    pub id: String,
    pub seq: u64,
    pub clientseq: u64,
    #[serde(flatten)]
    pub body: ServerMessageBody,
}

impl ServerMessage {
    pub fn new(id: impl Into<String>, seq: u64, clientseq: u64, body: ServerMessageBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.into(),
            seq,
            clientseq,
            body,
        }
    }
}

/// The `type` and `parameters` of a server message.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum ServerMessageBody {
    Opened(OpenedParameters),
    Pong(EmptyParameters),
    Event(EventParameters),
    Disconnect(DisconnectParameters),
    Closed(EmptyParameters),
}

impl ServerMessageBody {
    /// A short label for logging: the message type, or the entity type for events.
    pub fn describe(&self) -> &'static str {
        match self {
            ServerMessageBody::Opened(_) => "opened",
            ServerMessageBody::Pong(_) => "pong",
            ServerMessageBody::Disconnect(_) => "disconnect",
            ServerMessageBody::Closed(_) => "closed",
            ServerMessageBody::Event(params) => match params.entities.first() {
                Some(EventEntity::Transcript(_)) => "event:transcript",
                Some(EventEntity::BargeIn(_)) => "event:barge_in",
                Some(EventEntity::BotTurnResponse(_)) => "event:bot_turn_response",
                None => "event",
            },
        }
    }

    pub fn event(entity: EventEntity) -> Self {
        ServerMessageBody::Event(EventParameters {
            entities: vec![entity],
        })
    }
}

/// Serializes as `{}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EmptyParameters {}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenedParameters {
    pub start_paused: bool,
    pub media: Vec<MediaParameter>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EventParameters {
    pub entities: Vec<EventEntity>,
}

/// Entity payloads carried by `event` messages.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventEntity {
    Transcript(TranscriptData),
    BargeIn(EmptyParameters),
    BotTurnResponse(BotTurnResponseData),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptData {
    pub id: String,
    pub channel: String,
    pub is_final: bool,
    pub alternatives: Vec<TranscriptAlternative>,
}

impl TranscriptData {
    /// Builds a single-alternative, normalized transcript with a fresh id.
    pub fn normalized(
        channel: impl Into<String>,
        transcript: impl Into<String>,
        confidence: f32,
        is_final: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            is_final,
            alternatives: vec![TranscriptAlternative {
                confidence,
                interpretations: vec![TranscriptInterpretation {
                    interpretation_type: "normalized".to_string(),
                    transcript: transcript.into(),
                }],
            }],
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptAlternative {
    pub confidence: f32,
    pub interpretations: Vec<TranscriptInterpretation>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptInterpretation {
    #[serde(rename = "type")]
    pub interpretation_type: String,
    pub transcript: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BotTurnDisposition {
    Match,
    NoMatch,
    NoInput,
    BargeIn,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BotTurnResponseData {
    pub disposition: BotTurnDisposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Completed,
    Unauthorized,
    Error,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectParameters {
    pub reason: DisconnectReason,
    pub info: String,
    pub output_variables: JsonStringMap,
}
