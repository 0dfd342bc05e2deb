//! Session controller
//!
//! Single writer for one chat session. Owns the store, the in-flight
//! exchange and the recording state; every UI command, stream signal and
//! recorder result arrives here as a [`SessionEvent`] and is applied in
//! arrival order. `handle()` is synchronous and returns the effects the
//! caller must run, so the whole controller is testable without I/O.
//!
//! Exchange lifecycle:
//!
//! - send: snapshot, optimistic user + placeholder messages, `OpenStream`
//! - stream signals are routed while the exchange is live
//! - `done` finalizes; `error`, transport errors and early close go to the
//!   exchange's failure coordinator
//! - stop/new session cancels without rollback or report

use std::time::Duration;
use uuid::Uuid;

use crate::audio::encode_voice_payload;
use crate::metrics::MetricsCollector;
use crate::rollback::{FailureCoordinator, StoreRollback};
use crate::router::{
    route_signal, ExchangePhase, ExchangeTarget, RouteOutcome, DEFAULT_ERROR_MESSAGE,
};
use crate::sessions::SessionSummary;
use crate::settings::ChatSettings;
use crate::state_machine::{reduce, Effect, Notice, RecordingEvent, RecordingState};
use crate::store::{ExchangeMessages, SessionStore};
use crate::streaming::{
    ServerEvent, StreamController, StreamError, StreamRequest, StreamSignal, UnifiedChatRequest,
};

/// User message content for a voice send until the transcript arrives
pub const VOICE_PLACEHOLDER: &str = "[voice message]";

/// UI actions
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    SetInput(String),
    /// Send the current input box contents
    SubmitInput,
    /// Put `text` in the input box and send it
    SendText(String),
    StartRecording,
    StopRecording,
    CancelRecording,
    /// Cancel the in-flight response. Not a failure.
    StopStreaming,
    NewSession,
}

/// Everything the session loop consumes.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Command(SessionCommand),
    Stream {
        exchange_id: Uuid,
        signal: StreamSignal,
    },
    Recording(RecordingEvent),
    SessionsRefreshed(Vec<SessionSummary>),
    /// Application exit requested
    Exit,
}

/// Host-side view of the session. Rendering and toasts live here.
pub trait SessionObserver: Send + 'static {
    fn state_changed(&mut self, _store: &SessionStore, _recording: &RecordingState) {}

    fn notify(&mut self, notice: &Notice);
}

/// Per-session options taken from settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub chat_path: String,
    pub sample_rate: u32,
    pub max_recording: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_settings(&ChatSettings::default())
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &ChatSettings) -> Self {
        Self {
            chat_path: settings.chat_path.clone(),
            sample_rate: settings.sample_rate,
            max_recording: Duration::from_secs(settings.max_recording_secs),
        }
    }
}

/// The one in-flight (or last) exchange
#[derive(Debug)]
struct Exchange {
    id: Uuid,
    phase: ExchangePhase,
    messages: ExchangeMessages,
    voice: bool,
    coordinator: FailureCoordinator,
}

pub struct SessionController<O> {
    store: SessionStore,
    recording: RecordingState,
    exchange: Option<Exchange>,
    options: SessionOptions,
    metrics: MetricsCollector,
    observer: O,
}

impl<O: SessionObserver> SessionController<O> {
    pub fn new(store: SessionStore, options: SessionOptions, observer: O) -> Self {
        Self {
            store,
            recording: RecordingState::default(),
            exchange: None,
            options,
            metrics: MetricsCollector::new(),
            observer,
        }
    }

    pub fn from_settings(settings: &ChatSettings, observer: O) -> Self {
        Self::new(
            SessionStore::from_settings(settings),
            SessionOptions::from_settings(settings),
            observer,
        )
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn recording_state(&self) -> &RecordingState {
        &self.recording
    }

    /// Phase of the current exchange, `None` when idle
    pub fn exchange_phase(&self) -> Option<ExchangePhase> {
        self.exchange.as_ref().map(|e| e.phase)
    }

    pub fn exchange_id(&self) -> Option<Uuid> {
        self.exchange.as_ref().map(|e| e.id)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Apply one event. Returns the effects for the runner.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        let mut out = Vec::new();
        match event {
            SessionEvent::Command(command) => self.on_command(command, &mut out),
            SessionEvent::Stream {
                exchange_id,
                signal,
            } => self.on_stream_signal(exchange_id, signal, &mut out),
            SessionEvent::Recording(event) => self.apply_recording(event, &mut out),
            SessionEvent::SessionsRefreshed(sessions) => {
                log::debug!("Session: {} sessions listed", sessions.len());
                self.store.sessions = sessions;
            }
            SessionEvent::Exit => {}
        }
        self.observer.state_changed(&self.store, &self.recording);
        out
    }

    /// Called with the controller returned for an `OpenStream` effect.
    pub fn attach_stream(&mut self, exchange_id: Uuid, controller: StreamController) {
        match &self.exchange {
            Some(exchange) if exchange.id == exchange_id && exchange.phase.is_live() => {
                self.store.set_controller(controller);
            }
            _ => {
                log::debug!("Session: exchange {} no longer live, cancelling stream", exchange_id);
                controller.cancel();
            }
        }
    }

    /// Stop everything in flight. Returns effects that release the microphone.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        self.cancel_exchange();
        self.store.stop_streaming();
        let mut out = Vec::new();
        if !self.recording.is_idle() {
            self.apply_recording(RecordingEvent::Cancel, &mut out);
        }
        out
    }

    fn on_command(&mut self, command: SessionCommand, out: &mut Vec<Effect>) {
        match command {
            SessionCommand::SetInput(value) => self.store.input_value = value,
            SessionCommand::SubmitInput => self.submit_input(out),
            SessionCommand::SendText(text) => {
                if self.store.is_streaming {
                    self.notify(Notice::Busy);
                    return;
                }
                self.store.input_value = text;
                self.submit_input(out);
            }
            SessionCommand::StartRecording => {
                if self.store.is_streaming {
                    self.notify(Notice::Busy);
                    return;
                }
                let max_duration = self.options.max_recording;
                self.apply_recording(RecordingEvent::Start { max_duration }, out);
            }
            SessionCommand::StopRecording => self.apply_recording(RecordingEvent::Stop, out),
            SessionCommand::CancelRecording => self.apply_recording(RecordingEvent::Cancel, out),
            SessionCommand::StopStreaming => {
                self.cancel_exchange();
                self.store.stop_streaming();
            }
            SessionCommand::NewSession => {
                self.cancel_exchange();
                self.store.new_session();
                self.exchange = None;
                log::info!("Session: new session {}", self.store.session_id);
            }
        }
    }

    fn submit_input(&mut self, out: &mut Vec<Effect>) {
        let text = self.store.input_value.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.store.is_streaming {
            self.notify(Notice::Busy);
            return;
        }

        let snapshot = self.store.snapshot();
        let body = UnifiedChatRequest::text(
            &self.store.config,
            &self.store.session_id,
            self.store.wire_history(),
            text.clone(),
        );
        let coordinator = FailureCoordinator::new(snapshot).with_input_restore();
        self.start_exchange(text, body, coordinator, false, out);
    }

    fn submit_voice(&mut self, samples: Vec<f32>, out: &mut Vec<Effect>) {
        if self.store.is_streaming {
            self.notify(Notice::Busy);
            return;
        }
        let Some(audio_b64) = encode_voice_payload(&samples) else {
            self.notify(Notice::Warning("No audio captured".to_string()));
            return;
        };

        let snapshot = self.store.snapshot();
        let body = UnifiedChatRequest::voice(
            &self.store.config,
            &self.store.session_id,
            self.store.wire_history(),
            audio_b64,
            self.options.sample_rate,
        );
        self.start_exchange(
            VOICE_PLACEHOLDER.to_string(),
            body,
            FailureCoordinator::new(snapshot),
            true,
            out,
        );
    }

    fn start_exchange(
        &mut self,
        user_content: String,
        body: UnifiedChatRequest,
        coordinator: FailureCoordinator,
        voice: bool,
        out: &mut Vec<Effect>,
    ) {
        let messages = match self.store.begin_exchange(user_content) {
            Ok(messages) => messages,
            Err(rejected) => {
                log::warn!("Session: {}", rejected);
                self.notify(Notice::Busy);
                return;
            }
        };
        if !voice {
            self.store.input_value.clear();
        }

        let id = Uuid::new_v4();
        log::info!(
            "Session: exchange {} sending ({})",
            id,
            if voice { "voice" } else { "text" }
        );
        self.metrics.start_exchange(id, voice);
        self.exchange = Some(Exchange {
            id,
            phase: ExchangePhase::Sending,
            messages,
            voice,
            coordinator,
        });

        match StreamRequest::new(self.options.chat_path.clone(), &body) {
            Ok(request) => out.push(Effect::OpenStream {
                exchange_id: id,
                request,
            }),
            Err(e) => self.fail_exchange(e.to_string(), Some(e)),
        }
    }

    fn on_stream_signal(&mut self, exchange_id: Uuid, signal: StreamSignal, out: &mut Vec<Effect>) {
        let Some(exchange) = self.exchange.as_mut() else {
            log::debug!("Session: signal for {} with no exchange", exchange_id);
            return;
        };
        if exchange.id != exchange_id {
            log::debug!("Session: dropping stale signal for {}", exchange_id);
            return;
        }

        match exchange.phase {
            ExchangePhase::Finalized | ExchangePhase::Cancelled => {
                log::debug!("Session: ignoring signal for {:?} exchange", exchange.phase);
                return;
            }
            ExchangePhase::Failed => {
                // Same coordinator: stop again, nothing restored or re-reported
                if let Some((message, error)) = failure_of(signal) {
                    self.fail_exchange(message, error);
                }
                return;
            }
            ExchangePhase::Sending => {
                log::info!("Session: exchange {} streaming", exchange.id);
                exchange.phase = ExchangePhase::Streaming;
            }
            ExchangePhase::Streaming => {}
        }

        if let StreamSignal::Event(event) = &signal {
            self.metrics.event_received(event.event == "token");
        }

        let target = ExchangeTarget {
            user_message_id: &exchange.messages.user_id,
            assistant_message_id: &exchange.messages.assistant_id,
            voice: exchange.voice,
        };
        match route_signal(&mut self.store, target, signal) {
            RouteOutcome::Continue => {}
            RouteOutcome::Finalized(effects) => {
                exchange.phase = ExchangePhase::Finalized;
                self.metrics.exchange_completed();
                out.extend(effects);
            }
            RouteOutcome::Failed { message, error } => self.fail_exchange(message, error),
        }
    }

    fn fail_exchange(&mut self, message: String, error: Option<StreamError>) {
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        let first = !exchange.coordinator.has_failed();
        exchange.phase = ExchangePhase::Failed;

        let mut target = StoreRollback::new(&mut self.store);
        exchange
            .coordinator
            .handle_failure(&mut target, &message, error.as_ref());
        let reported = std::mem::take(&mut target.reported);

        for text in reported {
            self.notify(Notice::Error(text));
        }
        if first {
            self.metrics.exchange_failed(message);
        }
    }

    /// Cancel a live exchange. Partial content is kept.
    fn cancel_exchange(&mut self) {
        if let Some(exchange) = self.exchange.as_mut() {
            if exchange.phase.is_live() {
                log::info!("Session: exchange {} cancelled", exchange.id);
                exchange.phase = ExchangePhase::Cancelled;
                self.metrics.exchange_cancelled();
            }
        }
    }

    fn apply_recording(&mut self, event: RecordingEvent, out: &mut Vec<Effect>) {
        let (next, effects) = reduce(&self.recording, event);
        if std::mem::discriminant(&self.recording) != std::mem::discriminant(&next) {
            log::info!(
                "Session: recording {} -> {}",
                self.recording.label(),
                next.label()
            );
        }
        self.recording = next;

        for effect in effects {
            match effect {
                Effect::Notify(notice) => self.notify(notice),
                Effect::SubmitVoice { samples } => self.submit_voice(samples, out),
                Effect::EmitUi => {}
                other => out.push(other),
            }
        }
    }

    fn notify(&mut self, notice: Notice) {
        match &notice {
            Notice::Busy => log::info!("Session: busy, request ignored"),
            Notice::Warning(msg) => log::warn!("Session: {}", msg),
            Notice::Error(msg) => log::error!("Session: {}", msg),
        }
        self.observer.notify(&notice);
    }
}

/// Failure carried by a signal, if any. Used once an exchange has failed.
fn failure_of(signal: StreamSignal) -> Option<(String, Option<StreamError>)> {
    match signal {
        StreamSignal::Error(error) => Some((error.to_string(), Some(error))),
        StreamSignal::Event(event) => match ServerEvent::from_stream_event(&event) {
            ServerEvent::Error(message) => {
                Some((message.unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()), None))
            }
            _ => None,
        },
        StreamSignal::Closed => None,
    }
}
