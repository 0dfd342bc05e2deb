//! Stream event router
//!
//! Translates one exchange's stream signals into session store mutations.
//! The router does no I/O: it mutates `&mut SessionStore` and tells the
//! caller what happened through [`RouteOutcome`]. Failures are not handled
//! here; they are returned so the caller can hand them to the exchange's
//! [`FailureCoordinator`](crate::rollback::FailureCoordinator).
//!
//! ```text
//! Idle ──send──▶ Sending ──first event──▶ Streaming ──done──▶ Finalized
//!                   │                         │
//!                   └──────error/transport────┴──────────────▶ Failed
//! ```

use crate::state_machine::Effect;
use crate::store::{SessionStore, SpeechTranscriptMeta};
use crate::streaming::{DonePayload, ServerEvent, StreamError, StreamSignal};

/// Reported when an `error` event carries no usable message
pub const DEFAULT_ERROR_MESSAGE: &str = "The assistant could not complete the response";

/// Lifecycle of one exchange. "Idle" is the absence of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Sending,
    Streaming,
    Finalized,
    Failed,
    /// Stopped by the user; not a failure
    Cancelled,
}

impl ExchangePhase {
    /// Still waiting for a terminal event
    pub fn is_live(self) -> bool {
        matches!(self, ExchangePhase::Sending | ExchangePhase::Streaming)
    }
}

/// Messages the router writes to for one exchange
#[derive(Debug, Clone, Copy)]
pub struct ExchangeTarget<'a> {
    pub user_message_id: &'a str,
    pub assistant_message_id: &'a str,
    /// User message content is replaced by the transcript on `done`
    pub voice: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Applied (or a no-op); the exchange is still live
    Continue,
    /// `done` was applied. Effects are for the runner.
    Finalized(Vec<Effect>),
    /// Hand to the failure coordinator
    Failed {
        message: String,
        error: Option<StreamError>,
    },
}

/// Route one transport signal for a live exchange.
///
/// `Closed` here means the body ended before `done` or `error`, which is a
/// failure of the exchange.
pub fn route_signal(
    store: &mut SessionStore,
    target: ExchangeTarget<'_>,
    signal: StreamSignal,
) -> RouteOutcome {
    match signal {
        StreamSignal::Event(event) => {
            route_event(store, target, ServerEvent::from_stream_event(&event))
        }
        StreamSignal::Error(error) => RouteOutcome::Failed {
            message: error.to_string(),
            error: Some(error),
        },
        StreamSignal::Closed => {
            log::warn!("Router: stream closed before a terminal event");
            RouteOutcome::Failed {
                message: StreamError::ClosedEarly.to_string(),
                error: Some(StreamError::ClosedEarly),
            }
        }
    }
}

/// Apply one decoded application event.
pub fn route_event(
    store: &mut SessionStore,
    target: ExchangeTarget<'_>,
    event: ServerEvent,
) -> RouteOutcome {
    match event {
        ServerEvent::Token(Some(text)) => {
            match store.message_mut(target.assistant_message_id) {
                Some(message) => message.content.push_str(&text),
                None => log::warn!("Router: token for missing assistant message"),
            }
            RouteOutcome::Continue
        }
        ServerEvent::Token(None) => RouteOutcome::Continue,
        ServerEvent::Tool(Some(tool)) => {
            log::debug!("Router: tool {} {:?}", tool.tool, tool.status);
            store.tool_timeline.push(tool);
            RouteOutcome::Continue
        }
        ServerEvent::Tool(None) => {
            log::debug!("Router: ignoring malformed tool payload");
            RouteOutcome::Continue
        }
        ServerEvent::Log(Some(entry)) => {
            store.log_entries.push(entry);
            RouteOutcome::Continue
        }
        ServerEvent::Log(None) => {
            log::debug!("Router: ignoring malformed log payload");
            RouteOutcome::Continue
        }
        ServerEvent::Done(done) => RouteOutcome::Finalized(apply_done(store, target, done)),
        ServerEvent::Error(message) => RouteOutcome::Failed {
            message: message.unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            error: None,
        },
        ServerEvent::Other(name) => {
            log::debug!("Router: ignoring event '{}'", name);
            RouteOutcome::Continue
        }
    }
}

fn apply_done(
    store: &mut SessionStore,
    target: ExchangeTarget<'_>,
    done: DonePayload,
) -> Vec<Effect> {
    match store.message_mut(target.assistant_message_id) {
        Some(message) => {
            if let Some(final_text) = done.final_content() {
                message.content = final_text.to_string();
            }
            message.streaming = false;
        }
        None => log::warn!("Router: done for missing assistant message"),
    }

    store.tool_timeline.extend(done.tool_events());
    store.log_entries.extend(done.log_entries());

    if target.voice {
        if let Some(transcript) = done.transcript.as_deref().filter(|t| !t.trim().is_empty()) {
            if let Some(user) = store.message_mut(target.user_message_id) {
                user.content = transcript.to_string();
            }
        }
    }
    store.transcript = done.transcript.clone();
    store.stt_meta = SpeechTranscriptMeta {
        confidence: done.stt_confidence,
        language: done.stt_language.clone(),
    };

    store.is_streaming = false;
    store.clear_controller();
    log::info!("Router: exchange finalized");

    let mut effects = Vec::new();
    if let Some(audio_b64) = done.audio_b64.filter(|a| !a.is_empty()) {
        effects.push(Effect::PlayAudio { audio_b64 });
    }
    effects.push(Effect::RefreshSessions);
    effects
}
