//! The adapter's way back into its session.
//!
//! Adapters run their backend connection on separate tasks and never touch
//! session state directly. Everything they want the session to do is queued as
//! an [`AgentEvent`] and applied, in order, by the session task.

use super::provider::AgentError;
use bytes::Bytes;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tracing::debug;
use voicebridge_core::protocol::{BotTurnDisposition, DisconnectReason, JsonStringMap};

/// Requests an adapter can make of the session.
#[derive(Debug)]
pub enum AgentEvent {
    Audio(Bytes),
    FlushAudio,
    BargeIn,
    Transcript {
        text: String,
        confidence: f32,
        is_final: bool,
    },
    TurnResponse {
        disposition: BotTurnDisposition,
        text: Option<String>,
        confidence: Option<f32>,
    },
    Disconnect {
        reason: DisconnectReason,
        info: String,
        output_variables: JsonStringMap,
    },
    Error(AgentError),
    Timer(TimerCommand),
}

/// No-input timer operations, applied by the session that owns the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Start,
    Stop,
    Halt,
    Resume,
}

/// Everything the session task reacts to besides inbound frames.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Agent(AgentEvent),
    /// The delayed audio flush with this generation is due.
    FlushDeadline(u64),
    /// The DTMF capture with this generation has been idle too long.
    DtmfIdle(u64),
    /// The no-input countdown started at this timer epoch elapsed.
    NoInputElapsed(u64),
}

/// Cloneable handle given to an adapter on `connect`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: Arc<str>,
    events: mpsc::UnboundedSender<SessionEvent>,
    audio_playing: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: Arc<str>,
        events: mpsc::UnboundedSender<SessionEvent>,
        audio_playing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session_id,
            events,
            audio_playing,
        }
    }

    /// A handle whose events land in the returned receiver instead of a session.
    #[cfg(test)]
    pub(crate) fn detached(session_id: &str) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::new(session_id.into(), tx, Arc::new(AtomicBool::new(false))),
            rx,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn emit(&self, event: AgentEvent) {
        if self.events.send(SessionEvent::Agent(event)).is_err() {
            debug!(session_id = %self.session_id, "Session is gone, dropping agent event");
        }
    }

    pub fn send_audio(&self, audio: Bytes) {
        self.emit(AgentEvent::Audio(audio));
    }

    pub fn flush_audio(&self) {
        self.emit(AgentEvent::FlushAudio);
    }

    pub fn send_barge_in(&self) {
        self.emit(AgentEvent::BargeIn);
    }

    pub fn send_transcript(&self, text: impl Into<String>, confidence: f32, is_final: bool) {
        self.emit(AgentEvent::Transcript {
            text: text.into(),
            confidence,
            is_final,
        });
    }

    pub fn send_turn_response(
        &self,
        disposition: BotTurnDisposition,
        text: Option<String>,
        confidence: Option<f32>,
    ) {
        self.emit(AgentEvent::TurnResponse {
            disposition,
            text,
            confidence,
        });
    }

    pub fn send_disconnect(
        &self,
        reason: DisconnectReason,
        info: impl Into<String>,
        output_variables: JsonStringMap,
    ) {
        self.emit(AgentEvent::Disconnect {
            reason,
            info: info.into(),
            output_variables,
        });
    }

    pub fn report_error(&self, error: AgentError) {
        self.emit(AgentEvent::Error(error));
    }

    /// Takes effect immediately, unlike the queued requests above.
    pub fn set_audio_playing(&self, playing: bool) {
        self.audio_playing.store(playing, Ordering::SeqCst);
    }

    pub fn is_audio_playing(&self) -> bool {
        self.audio_playing.load(Ordering::SeqCst)
    }

    pub fn timer(&self) -> TimerControl<'_> {
        TimerControl { handle: self }
    }
}

/// Queues no-input timer commands for the session.
pub struct TimerControl<'a> {
    handle: &'a SessionHandle,
}

impl TimerControl<'_> {
    pub fn start(&self) {
        self.handle.emit(AgentEvent::Timer(TimerCommand::Start));
    }

    pub fn stop(&self) {
        self.handle.emit(AgentEvent::Timer(TimerCommand::Stop));
    }

    pub fn halt(&self) {
        self.handle.emit(AgentEvent::Timer(TimerCommand::Halt));
    }

    pub fn resume(&self) {
        self.handle.emit(AgentEvent::Timer(TimerCommand::Resume));
    }
}
