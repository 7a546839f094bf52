//! The per-connection session protocol engine.
//!
//! A [`Session`] is owned by a single task. Inbound frames, adapter events and
//! timer deadlines are all funnelled through [`Session::run`], so session state
//! is never touched concurrently. Control messages are validated for sequence,
//! identity and acknowledged server sequence before dispatch; outbound audio is
//! buffered and cut into size-bounded binary frames.

use super::{
    handle::{AgentEvent, SessionEvent, SessionHandle, TimerCommand},
    handlers::MessageHandlerRegistry,
    protocol::{InboundFrame, OutboundFrame},
    provider::VoiceAgentAdapter,
};
use bytes::Bytes;
use futures_util::FutureExt;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};
use voicebridge_core::{
    AudioChunkBuffer, DtmfCapture, NoInputTimer, ProtocolError, SessionSettings, TimerCallback,
    protocol::{
        BotTurnDisposition, BotTurnResponseData, ClientMessage, DisconnectParameters,
        DisconnectReason, EmptyParameters, EventEntity, JsonStringMap, MediaParameter,
        OpenParameters, OpenedParameters, ServerMessage, ServerMessageBody, TranscriptData,
    },
};

pub const INVALID_CLIENT_SEQ_INFO: &str = "Invalid client sequence number.";
pub const INVALID_ID_INFO: &str = "Invalid ID specified.";
pub const INVALID_SERVER_SEQ_INFO: &str = "Invalid server sequence number.";
pub const DTMF_ERROR_INFO: &str = "Error during DTMF Capture.";
pub const AGENT_CONNECT_ERROR_INFO: &str = "Failed to connect to voice agent.";

const DEFAULT_CHANNEL: &str = "external";

pub struct Session {
    client_session_id: Arc<str>,
    conversation_id: Option<String>,
    last_client_seq: u64,
    last_server_seq: u64,
    selected_media: Option<MediaParameter>,
    input_variables: JsonStringMap,
    audio_playing: Arc<AtomicBool>,
    is_capturing_dtmf: bool,
    disconnecting: bool,
    closed: bool,

    settings: SessionSettings,
    audio: AudioChunkBuffer,
    flush_generation: u64,
    pending_flush: Option<JoinHandle<()>>,
    dtmf: Option<DtmfCapture>,
    dtmf_generation: u64,
    dtmf_idle: Option<JoinHandle<()>>,
    no_input: NoInputTimer,

    adapter: Option<Box<dyn VoiceAgentAdapter>>,
    handlers: Arc<MessageHandlerRegistry>,
    outbound: mpsc::Sender<OutboundFrame>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl Session {
    pub fn new(
        client_session_id: impl Into<String>,
        settings: SessionSettings,
        adapter: Box<dyn VoiceAgentAdapter>,
        handlers: Arc<MessageHandlerRegistry>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<Self, ProtocolError> {
        let audio = settings.audio_buffer()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let timer_tx = events_tx.clone();
        let callback: TimerCallback = Arc::new(move |epoch| {
            let tx = timer_tx.clone();
            async move {
                let _ = tx.send(SessionEvent::NoInputElapsed(epoch));
            }
            .boxed()
        });
        let no_input = NoInputTimer::new(settings.no_input_timeout, callback);

        let client_session_id: String = client_session_id.into();
        Ok(Self {
            client_session_id: client_session_id.into(),
            conversation_id: None,
            last_client_seq: 0,
            last_server_seq: 0,
            selected_media: None,
            input_variables: JsonStringMap::new(),
            audio_playing: Arc::new(AtomicBool::new(false)),
            is_capturing_dtmf: false,
            disconnecting: false,
            closed: false,
            settings,
            audio,
            flush_generation: 0,
            pending_flush: None,
            dtmf: None,
            dtmf_generation: 0,
            dtmf_idle: None,
            no_input,
            adapter: Some(adapter),
            handlers,
            outbound,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    // --- Accessors ---

    pub fn client_session_id(&self) -> &str {
        &self.client_session_id
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn last_client_seq(&self) -> u64 {
        self.last_client_seq
    }

    pub fn last_server_seq(&self) -> u64 {
        self.last_server_seq
    }

    pub fn selected_media(&self) -> Option<&MediaParameter> {
        self.selected_media.as_ref()
    }

    pub fn input_variables(&self) -> &JsonStringMap {
        &self.input_variables
    }

    pub fn is_audio_playing(&self) -> bool {
        self.audio_playing.load(Ordering::SeqCst)
    }

    pub fn set_audio_playing(&self, playing: bool) {
        self.audio_playing.store(playing, Ordering::SeqCst);
    }

    pub fn is_capturing_dtmf(&self) -> bool {
        self.is_capturing_dtmf
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn buffered_audio(&self) -> usize {
        self.audio.total_size()
    }

    /// A handle for the adapter to call back into this session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(
            self.client_session_id.clone(),
            self.events_tx.clone(),
            self.audio_playing.clone(),
        )
    }

    // --- Run loop ---

    /// Drives the session until the transport closes or the session is closed.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundFrame>) {
        let Some(mut events) = self.events_rx.take() else {
            error!("Session is already running");
            return;
        };
        info!(session_id = %self.client_session_id, "Session started");

        while !self.closed {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(InboundFrame::Text(text)) => {
                        if let Err(e) = self.process_text_message(&text).await {
                            warn!(error = %e, "Control message rejected");
                        }
                    }
                    Some(InboundFrame::Binary(bytes)) => self.process_binary_message(bytes).await,
                    Some(InboundFrame::Close) | None => {
                        info!("Client connection closed");
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        self.close().await;
        info!(
            session_id = %self.client_session_id,
            last_client_seq = self.last_client_seq,
            last_server_seq = self.last_server_seq,
            "Session finished"
        );
    }

    pub(crate) async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Agent(event) => self.handle_agent_event(event).await,
            SessionEvent::FlushDeadline(generation) => {
                if generation == self.flush_generation && self.pending_flush.is_some() {
                    self.pending_flush = None;
                    self.flush_buffer().await;
                }
            }
            SessionEvent::DtmfIdle(generation) => {
                if generation != self.dtmf_generation || self.closed || self.disconnecting {
                    return;
                }
                self.dtmf_idle = None;
                if let Some(digits) = self.dtmf.as_mut().and_then(DtmfCapture::finish) {
                    debug!("DTMF inter-digit timeout reached");
                    self.complete_dtmf(digits).await;
                }
            }
            SessionEvent::NoInputElapsed(epoch) => {
                if self.closed || self.disconnecting {
                    return;
                }
                if !self.no_input.is_current(epoch) {
                    debug!(epoch, "Stale no-input firing, ignoring");
                    return;
                }
                info!("No-input timeout elapsed");
                if let Some(adapter) = self.adapter.as_mut() {
                    if let Err(e) = adapter.handle_no_input().await {
                        warn!(error = %e, "Voice agent failed to handle no input");
                    }
                }
            }
        }
    }

    async fn handle_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Audio(bytes) => self.send_audio(bytes).await,
            AgentEvent::FlushAudio => {
                self.cancel_pending_flush();
                self.flush_buffer().await;
            }
            AgentEvent::BargeIn => self.send_barge_in().await,
            AgentEvent::Transcript {
                text,
                confidence,
                is_final,
            } => self.send_transcript(&text, confidence, is_final).await,
            AgentEvent::TurnResponse {
                disposition,
                text,
                confidence,
            } => self.send_turn_response(disposition, text, confidence).await,
            AgentEvent::Disconnect {
                reason,
                info,
                output_variables,
            } => self.send_disconnect(reason, &info, output_variables).await,
            AgentEvent::Error(e) => {
                error!(error = %e, "Voice agent error");
                self.send_disconnect(DisconnectReason::Error, &e.to_string(), JsonStringMap::new())
                    .await;
            }
            AgentEvent::Timer(command) => {
                if self.closed || self.disconnecting {
                    return;
                }
                match command {
                    TimerCommand::Start => {
                        self.no_input.start();
                    }
                    TimerCommand::Stop => self.no_input.stop(),
                    TimerCommand::Halt => self.no_input.halt(),
                    TimerCommand::Resume => self.no_input.resume(),
                }
            }
        }
    }

    /// Applies every event already queued. Lets tests step the session
    /// without running the full loop.
    #[cfg(test)]
    pub(crate) async fn process_pending_events(&mut self) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            self.handle_event(event).await;
        }
        self.events_rx = Some(events);
    }

    // --- Inbound ---

    /// Validates a client control message and dispatches it to its handler.
    ///
    /// Sequence, identity and server-sequence failures disconnect the session
    /// before the error is returned. An absent or mistyped `seq`, `id` or
    /// `serverseq` counts as such a failure. Text that is not JSON is returned
    /// as `MalformedMessage` without any side effect.
    pub async fn process_text_message(&mut self, raw: &str) -> Result<(), ProtocolError> {
        if self.closed {
            debug!("Session closed, ignoring control message");
            return Ok(());
        }

        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        let seq = value.get("seq").and_then(Value::as_u64);
        let id = value.get("id").and_then(Value::as_str);
        // Outer `None`: not sent. Inner `None`: sent but not an unsigned integer.
        let serverseq = match value.get("serverseq") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64()),
        };
        debug!(
            message_type = ?value.get("type"),
            seq = ?seq,
            serverseq = ?value.get("serverseq"),
            "Received control message"
        );

        let expected = self.last_client_seq + 1;
        if seq != Some(expected) {
            self.send_disconnect(
                DisconnectReason::Error,
                INVALID_CLIENT_SEQ_INFO,
                JsonStringMap::new(),
            )
            .await;
            return Err(ProtocolError::Sequence {
                expected,
                received: seq,
            });
        }

        if id != Some(&*self.client_session_id) {
            let received = id.map(str::to_string);
            self.send_disconnect(DisconnectReason::Error, INVALID_ID_INFO, JsonStringMap::new())
                .await;
            return Err(ProtocolError::Identity {
                expected: self.client_session_id.to_string(),
                received,
            });
        }

        let last_sent = self.last_server_seq;
        if let Some(acknowledged) =
            serverseq.filter(|ack| ack.is_none_or(|ack| ack > last_sent))
        {
            self.send_disconnect(
                DisconnectReason::Error,
                INVALID_SERVER_SEQ_INFO,
                JsonStringMap::new(),
            )
            .await;
            return Err(ProtocolError::ServerSequence {
                acknowledged,
                last_sent,
            });
        }

        self.last_client_seq = expected;

        let message: ClientMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;

        match self.handlers.get(&message.message_type) {
            Some(handler) => handler.handle(self, &message).await,
            None => {
                warn!(message_type = %message.message_type, "No handler for message type, ignoring");
                Ok(())
            }
        }
    }

    /// Forwards caller audio to the adapter unless DTMF capture owns the input.
    pub async fn process_binary_message(&mut self, bytes: Bytes) {
        if self.closed || self.disconnecting {
            return;
        }
        if self.is_capturing_dtmf {
            trace!(len = bytes.len(), "Capturing DTMF, dropping caller audio");
            return;
        }
        if let Some(adapter) = self.adapter.as_mut() {
            if let Err(e) = adapter.process_audio(bytes).await {
                warn!(error = %e, "Failed to forward caller audio");
            }
        }
    }

    pub async fn process_dtmf(&mut self, digit: &str) -> Result<(), ProtocolError> {
        if self.closed || self.disconnecting {
            return Ok(());
        }
        if self.is_audio_playing() {
            info!(digit, "DTMF received during playback, discarding capture");
            self.cancel_dtmf_idle();
            self.dtmf = None;
            self.is_capturing_dtmf = false;
            return Ok(());
        }

        if self.dtmf.as_ref().is_none_or(DtmfCapture::is_complete) {
            self.dtmf = Some(DtmfCapture::new(self.settings.dtmf.clone()));
        }
        self.is_capturing_dtmf = true;

        let outcome = match self.dtmf.as_mut() {
            Some(capture) => capture.process_digit(digit),
            None => Ok(None),
        };
        match outcome {
            Ok(Some(digits)) => {
                self.complete_dtmf(digits).await;
                Ok(())
            }
            Ok(None) => {
                self.arm_dtmf_idle();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, digit, "DTMF capture failed");
                self.cancel_dtmf_idle();
                self.dtmf = None;
                self.is_capturing_dtmf = false;
                self.send_disconnect(DisconnectReason::Error, DTMF_ERROR_INFO, JsonStringMap::new())
                    .await;
                Err(e.into())
            }
        }
    }

    async fn complete_dtmf(&mut self, digits: String) {
        self.cancel_dtmf_idle();
        self.is_capturing_dtmf = false;
        info!(digits = %digits, "DTMF capture complete");
        self.send_transcript(&digits, 1.0, true).await;
    }

    fn arm_dtmf_idle(&mut self) {
        self.cancel_dtmf_idle();
        let Some(timeout) = self.settings.dtmf.inter_digit_timeout else {
            return;
        };
        let generation = self.dtmf_generation;
        let tx = self.events_tx.clone();
        self.dtmf_idle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(SessionEvent::DtmfIdle(generation));
        }));
    }

    fn cancel_dtmf_idle(&mut self) {
        self.dtmf_generation += 1;
        if let Some(task) = self.dtmf_idle.take() {
            task.abort();
        }
    }

    // --- Lifecycle (used by the built-in handlers) ---

    /// Records the parameters of the client's `open` and returns the media the
    /// session will use.
    pub fn apply_open(&mut self, params: OpenParameters) -> Option<MediaParameter> {
        let media = params.select_media();
        if let Some(conversation_id) = params.conversation_id {
            self.conversation_id.get_or_insert(conversation_id);
        }
        self.input_variables = params.input_variables;
        self.selected_media = media.clone();
        info!(
            conversation_id = ?self.conversation_id,
            media = ?media,
            "Session opened"
        );
        media
    }

    pub async fn send_opened(&mut self, media: Option<MediaParameter>) {
        self.send_message(ServerMessageBody::Opened(OpenedParameters {
            start_paused: false,
            media: media.into_iter().collect(),
        }))
        .await;
    }

    /// Connects the adapter, disconnecting the session if that fails.
    pub async fn connect_adapter(&mut self) {
        if self.closed || self.disconnecting {
            return;
        }
        let handle = self.handle();
        let Some(adapter) = self.adapter.as_mut() else {
            return;
        };
        if adapter.is_connected() {
            debug!("Voice agent already connected");
            return;
        }
        if let Err(e) = adapter.connect(handle).await {
            error!(error = %e, provider = adapter.provider().as_str(), "Voice agent connection failed");
            self.send_disconnect(
                DisconnectReason::Error,
                AGENT_CONNECT_ERROR_INFO,
                JsonStringMap::new(),
            )
            .await;
        }
    }

    pub async fn process_playback_completed(&mut self) {
        self.set_audio_playing(false);
        if self.closed || self.disconnecting {
            return;
        }
        if let Some(adapter) = self.adapter.as_mut() {
            if let Err(e) = adapter.process_playback_completed().await {
                warn!(error = %e, "Voice agent failed to handle playback completion");
            }
        }
    }

    // --- Outbound ---

    async fn push(&self, frame: OutboundFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!("Outbound writer is gone, dropping frame");
        }
    }

    async fn send_message(&mut self, body: ServerMessageBody) {
        if self.closed {
            debug!(message_type = body.describe(), "Session closed, not sending");
            return;
        }
        self.last_server_seq += 1;
        let label = body.describe();
        let message = ServerMessage::new(
            &*self.client_session_id,
            self.last_server_seq,
            self.last_client_seq,
            body,
        );
        match serde_json::to_string(&message) {
            Ok(text) => {
                debug!(message_type = label, seq = self.last_server_seq, "Sending control message");
                self.push(OutboundFrame::Text(text)).await;
            }
            Err(e) => error!(error = %e, message_type = label, "Failed to serialize control message"),
        }
    }

    /// Buffers backend audio, sending it once enough has accumulated or after
    /// the flush delay.
    pub async fn send_audio(&mut self, bytes: Bytes) {
        if self.closed || self.disconnecting {
            return;
        }
        self.audio.append(bytes);
        if self.audio.reaches_min_size() {
            self.cancel_pending_flush();
            self.flush_buffer().await;
        } else if !self.audio.is_empty() {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&mut self) {
        if self.pending_flush.is_some() {
            return;
        }
        self.flush_generation += 1;
        let generation = self.flush_generation;
        let delay = self.settings.flush_delay;
        let tx = self.events_tx.clone();
        self.pending_flush = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionEvent::FlushDeadline(generation));
        }));
    }

    fn cancel_pending_flush(&mut self) {
        if let Some(task) = self.pending_flush.take() {
            task.abort();
            self.flush_generation += 1;
        }
    }

    pub async fn flush_buffer(&mut self) {
        if self.closed || self.audio.is_empty() {
            return;
        }
        let frames = self.audio.drain_as_frames();
        trace!(frames = frames.len(), "Flushing outbound audio");
        for frame in frames {
            self.push(OutboundFrame::Binary(frame)).await;
        }
    }

    pub async fn send_barge_in(&mut self) {
        if self.closed || self.disconnecting {
            return;
        }
        self.cancel_pending_flush();
        let discarded = self.audio.clear();
        info!(discarded_bytes = discarded, "Sending barge-in");
        self.send_message(ServerMessageBody::event(EventEntity::BargeIn(
            EmptyParameters {},
        )))
        .await;
    }

    pub async fn send_turn_response(
        &mut self,
        disposition: BotTurnDisposition,
        text: Option<String>,
        confidence: Option<f32>,
    ) {
        self.send_message(ServerMessageBody::event(EventEntity::BotTurnResponse(
            BotTurnResponseData {
                disposition,
                text,
                confidence,
            },
        )))
        .await;
    }

    /// Emits a transcript on the negotiated media's first channel.
    pub async fn send_transcript(&mut self, text: &str, confidence: f32, is_final: bool) {
        let Some(media) = self.selected_media.as_ref() else {
            warn!("No media negotiated, dropping transcript");
            return;
        };
        let channel = media
            .channels
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_CHANNEL)
            .to_string();
        self.send_message(ServerMessageBody::event(EventEntity::Transcript(
            TranscriptData::normalized(channel, text, confidence, is_final),
        )))
        .await;
    }

    /// Sends `disconnect` once, then stops timers and releases the adapter.
    pub async fn send_disconnect(
        &mut self,
        reason: DisconnectReason,
        info: &str,
        output_variables: JsonStringMap,
    ) {
        if self.closed {
            return;
        }
        if self.disconnecting {
            debug!(?reason, info, "Already disconnecting, suppressing disconnect");
            return;
        }
        self.disconnecting = true;
        self.cancel_timers();
        self.audio.clear();
        info!(?reason, info, "Sending disconnect");
        self.send_message(ServerMessageBody::Disconnect(DisconnectParameters {
            reason,
            info: info.to_string(),
            output_variables,
        }))
        .await;
        self.release_adapter().await;
    }

    pub async fn send_closed(&mut self) {
        self.send_message(ServerMessageBody::Closed(EmptyParameters {}))
            .await;
    }

    pub async fn send_keep_alive(&mut self) {
        self.send_message(ServerMessageBody::Pong(EmptyParameters {}))
            .await;
        if let Some(adapter) = self.adapter.as_mut() {
            if let Err(e) = adapter.send_keep_alive().await {
                warn!(error = %e, "Voice agent keepalive failed");
            }
        }
    }

    // --- Teardown ---

    fn cancel_timers(&mut self) {
        self.cancel_pending_flush();
        self.cancel_dtmf_idle();
        self.no_input.stop();
    }

    async fn release_adapter(&mut self) {
        if let Some(mut adapter) = self.adapter.take() {
            debug!(provider = adapter.provider().as_str(), "Releasing voice agent");
            adapter.close().await;
        }
    }

    /// Terminal. Cancels every timer and releases the adapter. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.cancel_timers();
        self.release_adapter().await;
        self.closed = true;
        debug!("Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.pending_flush.take() {
            task.abort();
        }
        if let Some(task) = self.dtmf_idle.take() {
            task.abort();
        }
    }
}
