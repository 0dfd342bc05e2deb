//! Session store for voxstream
//!
//! Holds the canonical mutable state of one chat session: the message list,
//! the streaming flag, tool/log timelines, the voice transcript and the
//! per-session configuration. The store is owned by the session loop and is
//! the only place session state lives; everything else reads or mutates it
//! through `&mut SessionStore`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::sessions::SessionSummary;
use crate::settings::ChatSettings;
use crate::streaming::{StreamController, WireMessage};

/// Default retention for the tool timeline
pub const DEFAULT_TOOL_TIMELINE_LIMIT: usize = 20;

/// Default retention for backend log entries
pub const DEFAULT_LOG_LIMIT: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// True only while an assistant message is receiving tokens
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            tool_call_name: None,
        }
    }

    /// Empty assistant message that will receive streamed tokens
    pub fn placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::new(Role::Assistant, String::new())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Start,
    Success,
    Error,
}

impl ToolStatus {
    /// Unknown or missing status strings normalize to `Start`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("success") | Some("ok") => ToolStatus::Success,
            Some("error") | Some("failed") => ToolStatus::Error,
            _ => ToolStatus::Start,
        }
    }
}

/// One lifecycle stage of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub msg: String,
}

impl LogEntry {
    pub fn info(msg: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            msg: msg.into(),
        }
    }
}

/// Speech-to-text metadata. Replaced wholesale, never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechTranscriptMeta {
    pub confidence: Option<f64>,
    pub language: Option<String>,
}

/// Append-only list that keeps only the most recent `limit` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    limit: usize,
}

impl<T: Clone> BoundedLog<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Append an entry, evicting the oldest ones past the limit.
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = T>) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Replace the contents wholesale (used by snapshot restore).
    pub fn replace(&mut self, entries: Vec<T>) {
        self.entries.clear();
        self.extend(entries);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Immutable copy of the state an optimistic send may need to restore.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub messages: Vec<ChatMessage>,
    pub tool_timeline: Vec<ToolEvent>,
    pub log_entries: Vec<LogEntry>,
    pub transcript: Option<String>,
    pub stt_meta: SpeechTranscriptMeta,
    pub input_value: String,
}

/// Per-session request configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    pub assistant_language: String,
    pub enable_tools: bool,
    pub expect_audio: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            assistant_language: "en".to_string(),
            enable_tools: true,
            expect_audio: false,
        }
    }
}

/// What survives a "new session" action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelinePolicy {
    pub reset_on_new_session: bool,
}

impl Default for TimelinePolicy {
    fn default() -> Self {
        Self {
            reset_on_new_session: true,
        }
    }
}

/// Returned when a send is attempted while a response is still streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRejected;

impl std::fmt::Display for SendRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A response is still streaming. Wait for it to finish or stop it first.")
    }
}

impl std::error::Error for SendRejected {}

/// Ids of the paired messages created by an optimistic send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMessages {
    pub user_id: String,
    pub assistant_id: String,
}

/// Canonical session state.
#[derive(Debug)]
pub struct SessionStore {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    pub is_streaming: bool,
    pub tool_timeline: BoundedLog<ToolEvent>,
    pub log_entries: BoundedLog<LogEntry>,
    pub transcript: Option<String>,
    pub stt_meta: SpeechTranscriptMeta,
    /// Current contents of the text input box
    pub input_value: String,
    pub config: SessionConfig,
    pub sessions: Vec<SessionSummary>,
    pub policy: TimelinePolicy,
    controller: Option<StreamController>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(
            SessionConfig::default(),
            DEFAULT_TOOL_TIMELINE_LIMIT,
            DEFAULT_LOG_LIMIT,
        )
    }
}

impl SessionStore {
    pub fn new(config: SessionConfig, tool_timeline_limit: usize, log_limit: usize) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            is_streaming: false,
            tool_timeline: BoundedLog::new(tool_timeline_limit),
            log_entries: BoundedLog::new(log_limit),
            transcript: None,
            stt_meta: SpeechTranscriptMeta::default(),
            input_value: String::new(),
            config,
            sessions: Vec::new(),
            policy: TimelinePolicy::default(),
            controller: None,
        }
    }

    pub fn from_settings(settings: &ChatSettings) -> Self {
        let mut store = Self::new(
            settings.session_config(),
            settings.tool_timeline_limit,
            settings.log_limit,
        );
        store.policy = TimelinePolicy {
            reset_on_new_session: settings.reset_timeline_on_new_session,
        };
        store
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            messages: self.messages.clone(),
            tool_timeline: self.tool_timeline.to_vec(),
            log_entries: self.log_entries.to_vec(),
            transcript: self.transcript.clone(),
            stt_meta: self.stt_meta.clone(),
            input_value: self.input_value.clone(),
        }
    }

    /// Optimistic part of a send: append the user message and an assistant
    /// placeholder, clear per-turn data, mark the store streaming.
    ///
    /// The tool timeline is kept; it spans turns within a session.
    pub fn begin_exchange(
        &mut self,
        user_content: impl Into<String>,
    ) -> Result<ExchangeMessages, SendRejected> {
        if self.is_streaming {
            return Err(SendRejected);
        }

        let user = ChatMessage::new(Role::User, user_content);
        let assistant = ChatMessage::placeholder();
        let ids = ExchangeMessages {
            user_id: user.id.clone(),
            assistant_id: assistant.id.clone(),
        };

        self.messages.push(user);
        self.messages.push(assistant);
        self.log_entries.clear();
        self.transcript = None;
        self.stt_meta = SpeechTranscriptMeta::default();
        self.is_streaming = true;

        Ok(ids)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Conversation history as sent to the backend. The in-flight placeholder
    /// is excluded.
    pub fn wire_history(&self) -> Vec<WireMessage> {
        self.messages
            .iter()
            .filter(|m| !m.streaming)
            .map(|m| WireMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    pub fn set_controller(&mut self, controller: StreamController) {
        self.controller = Some(controller);
    }

    pub fn clear_controller(&mut self) {
        self.controller = None;
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    /// Idempotent stop: cancel the active stream, clear the streaming flag,
    /// and force every message out of the streaming state.
    pub fn stop_streaming(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.cancel();
        }
        self.is_streaming = false;
        for message in self.messages.iter_mut().filter(|m| m.streaming) {
            message.streaming = false;
        }
    }

    /// Start a fresh session. Any in-flight stream is stopped first.
    pub fn new_session(&mut self) {
        self.stop_streaming();
        self.session_id = Uuid::new_v4().to_string();
        self.messages.clear();
        self.log_entries.clear();
        self.transcript = None;
        self.stt_meta = SpeechTranscriptMeta::default();
        self.input_value.clear();
        if self.policy.reset_on_new_session {
            self.tool_timeline.clear();
        }
    }

    /// Number of messages currently flagged as streaming
    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.streaming).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolEvent {
        ToolEvent {
            tool: name.to_string(),
            status: ToolStatus::Start,
            latency_ms: None,
            result_preview: None,
        }
    }

    #[test]
    fn bounded_log_keeps_most_recent_in_arrival_order() {
        let mut timeline = BoundedLog::new(20);
        for i in 0..21 {
            timeline.push(tool(&format!("t{}", i)));
        }

        assert_eq!(timeline.len(), 20);
        let names: Vec<String> = timeline.iter().map(|t| t.tool.clone()).collect();
        assert_eq!(names.first().map(String::as_str), Some("t1"));
        assert_eq!(names.last().map(String::as_str), Some("t20"));
    }

    #[test]
    fn bounded_log_replace_truncates_to_limit() {
        let mut logs = BoundedLog::new(2);
        logs.replace(vec![
            LogEntry::info("a"),
            LogEntry::info("b"),
            LogEntry::info("c"),
        ]);
        assert_eq!(logs.to_vec(), vec![LogEntry::info("b"), LogEntry::info("c")]);
    }

    #[test]
    fn begin_exchange_creates_pair_and_clears_turn_data() {
        let mut store = SessionStore::default();
        store.tool_timeline.push(tool("search"));
        store.log_entries.push(LogEntry::info("old"));
        store.transcript = Some("old transcript".to_string());
        store.stt_meta.confidence = Some(0.9);

        let ids = store.begin_exchange("hello").expect("send accepted");

        assert_eq!(store.messages.len(), 2);
        assert_eq!(store.messages[0].id, ids.user_id);
        assert_eq!(store.messages[0].role, Role::User);
        assert_eq!(store.messages[1].id, ids.assistant_id);
        assert!(store.messages[1].streaming);
        assert!(store.is_streaming);
        assert!(store.log_entries.is_empty());
        assert!(store.transcript.is_none());
        assert_eq!(store.stt_meta, SpeechTranscriptMeta::default());
        // Tool timeline persists across turns
        assert_eq!(store.tool_timeline.len(), 1);
    }

    #[test]
    fn begin_exchange_rejected_while_streaming() {
        let mut store = SessionStore::default();
        store.begin_exchange("first").expect("send accepted");
        let before = store.messages.clone();

        assert_eq!(store.begin_exchange("second"), Err(SendRejected));
        assert_eq!(store.messages, before);
    }

    #[test]
    fn stop_streaming_is_idempotent() {
        let mut store = SessionStore::default();
        store.begin_exchange("hi").expect("send accepted");
        store.set_controller(StreamController::detached());

        store.stop_streaming();
        store.stop_streaming();

        assert!(!store.is_streaming);
        assert!(!store.has_controller());
        assert_eq!(store.streaming_count(), 0);
    }

    #[test]
    fn wire_history_skips_placeholder() {
        let mut store = SessionStore::default();
        store.begin_exchange("hi").expect("send accepted");
        let history = store.wire_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[test]
    fn new_session_honors_timeline_policy() {
        let mut store = SessionStore::default();
        store.tool_timeline.push(tool("a"));
        store.new_session();
        assert!(store.tool_timeline.is_empty());

        store.policy.reset_on_new_session = false;
        store.tool_timeline.push(tool("b"));
        let old_id = store.session_id.clone();
        store.new_session();
        assert_eq!(store.tool_timeline.len(), 1);
        assert_ne!(store.session_id, old_id);
    }

    #[test]
    fn tool_status_parse_normalizes_unknown() {
        assert_eq!(ToolStatus::parse(Some("success")), ToolStatus::Success);
        assert_eq!(ToolStatus::parse(Some("ERROR")), ToolStatus::Error);
        assert_eq!(ToolStatus::parse(Some("running")), ToolStatus::Start);
        assert_eq!(ToolStatus::parse(None), ToolStatus::Start);
    }
}
