//! Failure/rollback coordinator
//!
//! One exchange can fail more than once: the backend may send an `error`
//! event and the transport may then fail too, in either order. The
//! coordinator makes that idempotent:
//!
//! - state is restored from the pre-send snapshot on the first failure only
//! - the failure is reported (and the error object logged) at most once
//! - `stop_streaming` runs on every failure, so the session can never stay
//!   stuck in the streaming state

use crate::store::{
    ChatMessage, LogEntry, SessionStore, SpeechTranscriptMeta, StreamSnapshot, ToolEvent,
};
use crate::streaming::StreamError;

/// Setters and side channels the coordinator drives.
pub trait RollbackHandlers {
    fn set_messages(&mut self, messages: Vec<ChatMessage>);
    fn set_tool_timeline(&mut self, timeline: Vec<ToolEvent>);
    fn set_log_entries(&mut self, entries: Vec<LogEntry>);
    fn set_transcript(&mut self, transcript: Option<String>, meta: SpeechTranscriptMeta);
    /// Only called when input restore is enabled for the exchange
    fn set_input_value(&mut self, value: String);
    /// Must be idempotent
    fn stop_streaming(&mut self);
    fn report_error(&mut self, message: &str);
    fn log_error(&mut self, error: &StreamError);
}

/// Owns the snapshot for one exchange.
#[derive(Debug, Clone)]
pub struct FailureCoordinator {
    snapshot: StreamSnapshot,
    restore_input: bool,
    handled: bool,
    failure_count: u32,
}

impl FailureCoordinator {
    pub fn new(snapshot: StreamSnapshot) -> Self {
        Self {
            snapshot,
            restore_input: false,
            handled: false,
            failure_count: 0,
        }
    }

    /// Also restore the text input box on failure. Text sends only.
    pub fn with_input_restore(mut self) -> Self {
        self.restore_input = true;
        self
    }

    pub fn handle_failure(
        &mut self,
        handlers: &mut dyn RollbackHandlers,
        message: &str,
        error: Option<&StreamError>,
    ) {
        self.failure_count += 1;

        if !self.handled {
            self.handled = true;
            log::info!("Rollback: restoring pre-send state ({})", message);

            let snapshot = self.snapshot.clone();
            handlers.set_messages(snapshot.messages);
            handlers.set_tool_timeline(snapshot.tool_timeline);
            handlers.set_log_entries(snapshot.log_entries);
            handlers.set_transcript(snapshot.transcript, snapshot.stt_meta);
            if self.restore_input {
                handlers.set_input_value(snapshot.input_value);
            }
            if let Some(error) = error {
                handlers.log_error(error);
            }
            handlers.report_error(message);
        } else {
            log::debug!(
                "Rollback: repeated failure #{} ignored for restore ({})",
                self.failure_count,
                message
            );
        }

        handlers.stop_streaming();
    }

    pub fn has_failed(&self) -> bool {
        self.handled
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn snapshot(&self) -> &StreamSnapshot {
        &self.snapshot
    }
}

/// Restore target backed by the session store. Reports and error logs are
/// collected for the caller to forward.
pub struct StoreRollback<'a> {
    pub store: &'a mut SessionStore,
    pub reported: Vec<String>,
}

impl<'a> StoreRollback<'a> {
    pub fn new(store: &'a mut SessionStore) -> Self {
        Self {
            store,
            reported: Vec::new(),
        }
    }
}

impl RollbackHandlers for StoreRollback<'_> {
    fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.store.messages = messages;
    }

    fn set_tool_timeline(&mut self, timeline: Vec<ToolEvent>) {
        self.store.tool_timeline.replace(timeline);
    }

    fn set_log_entries(&mut self, entries: Vec<LogEntry>) {
        self.store.log_entries.replace(entries);
    }

    fn set_transcript(&mut self, transcript: Option<String>, meta: SpeechTranscriptMeta) {
        self.store.transcript = transcript;
        self.store.stt_meta = meta;
    }

    fn set_input_value(&mut self, value: String) {
        self.store.input_value = value;
    }

    fn stop_streaming(&mut self) {
        self.store.stop_streaming();
    }

    fn report_error(&mut self, message: &str) {
        self.reported.push(message.to_string());
    }

    fn log_error(&mut self, error: &StreamError) {
        log::error!("Rollback: exchange failed: {}", error);
    }
}
