//! Unified chat wire types
//!
//! Request body for `POST /v1/unified-chat` and the typed view of the event
//! vocabulary the backend streams back (`token`, `tool`, `log`, `done`,
//! `error`).
//!
//! Payload decoding is lenient: a payload that does not match
//! the expected shape degrades to "nothing to apply" rather than an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::frame::StreamEvent;
use crate::store::{LogEntry, Role, SessionConfig, ToolEvent, ToolStatus};

/// Object fields that may carry token text, in lookup order
const TOKEN_TEXT_FIELDS: [&str; 4] = ["token", "text", "content", "delta"];

/// One history entry in the request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

/// Request body for the unified chat endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    pub messages: Vec<WireMessage>,
    pub session_id: String,
    pub assistant_language: String,
    pub enable_tools: bool,
    pub model: String,
    pub expect_audio: bool,
    pub stream: bool,
}

impl UnifiedChatRequest {
    fn base(config: &SessionConfig, session_id: &str, messages: Vec<WireMessage>) -> Self {
        Self {
            text_input: None,
            audio_b64: None,
            sample_rate: None,
            messages,
            session_id: session_id.to_string(),
            assistant_language: config.assistant_language.clone(),
            enable_tools: config.enable_tools,
            model: config.model.clone(),
            expect_audio: config.expect_audio,
            stream: true,
        }
    }

    pub fn text(
        config: &SessionConfig,
        session_id: &str,
        messages: Vec<WireMessage>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            text_input: Some(text.into()),
            ..Self::base(config, session_id, messages)
        }
    }

    pub fn voice(
        config: &SessionConfig,
        session_id: &str,
        messages: Vec<WireMessage>,
        audio_b64: String,
        sample_rate: u32,
    ) -> Self {
        Self {
            audio_b64: Some(audio_b64),
            sample_rate: Some(sample_rate),
            ..Self::base(config, session_id, messages)
        }
    }
}

/// Payload of the terminal `done` event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DonePayload {
    pub content: Option<String>,
    pub final_text: Option<String>,
    pub tool_events: Option<Vec<Value>>,
    pub logs: Option<Vec<Value>>,
    pub transcript: Option<String>,
    pub stt_confidence: Option<f64>,
    pub stt_language: Option<String>,
    pub audio_b64: Option<String>,
}

impl DonePayload {
    /// Each field is read on its own; a mistyped field is dropped without
    /// taking the rest of the payload with it.
    fn from_value(data: &Value) -> Self {
        let Some(map) = data.as_object() else {
            return Self::default();
        };
        let text = |name: &str| done_field(map, name, Value::as_str).map(str::to_string);
        let list = |name: &str| done_field(map, name, Value::as_array).cloned();

        Self {
            content: text("content"),
            final_text: text("final_text"),
            tool_events: list("tool_events"),
            logs: list("logs"),
            transcript: text("transcript"),
            stt_confidence: done_field(map, "stt_confidence", Value::as_f64),
            stt_language: text("stt_language"),
            audio_b64: text("audio_b64"),
        }
    }

    /// `final_text`, then `content`
    pub fn final_content(&self) -> Option<&str> {
        self.final_text.as_deref().or(self.content.as_deref())
    }

    pub fn tool_events(&self) -> Vec<ToolEvent> {
        self.tool_events
            .iter()
            .flatten()
            .filter_map(tool_event_from)
            .collect()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.logs.iter().flatten().filter_map(log_entry_from).collect()
    }

    pub fn has_stt_data(&self) -> bool {
        self.transcript.is_some() || self.stt_confidence.is_some() || self.stt_language.is_some()
    }
}

/// Read one `done` field. Null counts as absent.
fn done_field<'a, T>(
    map: &'a Map<String, Value>,
    name: &str,
    read: impl Fn(&'a Value) -> Option<T>,
) -> Option<T> {
    let value = map.get(name).filter(|v| !v.is_null())?;
    let parsed = read(value);
    if parsed.is_none() {
        log::warn!("Protocol: ignoring malformed done field {}: {}", name, value);
    }
    parsed
}

/// Typed view of one stream event
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Token text; `None` when the payload had no usable text
    Token(Option<String>),
    Tool(Option<ToolEvent>),
    Log(Option<LogEntry>),
    Done(DonePayload),
    /// Error message if the payload was a usable string
    Error(Option<String>),
    /// Any other event name
    Other(String),
}

impl ServerEvent {
    pub fn from_stream_event(event: &StreamEvent) -> Self {
        match event.event.as_str() {
            "token" => ServerEvent::Token(token_text(&event.data)),
            "tool" => ServerEvent::Tool(tool_event_from(&event.data)),
            "log" => ServerEvent::Log(log_entry_from(&event.data)),
            "done" => ServerEvent::Done(DonePayload::from_value(&event.data)),
            "error" => ServerEvent::Error(
                event
                    .data
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            ),
            other => ServerEvent::Other(other.to_string()),
        }
    }
}

/// Text carried by a `token` payload. Empty text counts as none.
pub fn token_text(data: &Value) -> Option<String> {
    let text = match data {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => TOKEN_TEXT_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str)),
        _ => None,
    };
    text.filter(|t| !t.is_empty()).map(str::to_string)
}

pub fn tool_event_from(data: &Value) -> Option<ToolEvent> {
    let map = data.as_object()?;
    let tool = map
        .get("tool")
        .or_else(|| map.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    Some(ToolEvent {
        tool,
        status: ToolStatus::parse(map.get("status").and_then(Value::as_str)),
        latency_ms: map.get("latency_ms").and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
        }),
        result_preview: map
            .get("result_preview")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            }),
    })
}

pub fn log_entry_from(data: &Value) -> Option<LogEntry> {
    match data {
        Value::String(s) if !s.is_empty() => Some(LogEntry::info(s.clone())),
        Value::Object(map) => {
            let msg = map
                .get("msg")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str)?;
            let level = map
                .get("level")
                .and_then(Value::as_str)
                .filter(|l| !l.is_empty())
                .unwrap_or("info");
            Some(LogEntry {
                level: level.to_string(),
                msg: msg.to_string(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, data: Value) -> ServerEvent {
        ServerEvent::from_stream_event(&StreamEvent::new(name, data))
    }

    #[test]
    fn token_accepts_string_and_known_fields() {
        assert_eq!(event("token", json!("Hel")), ServerEvent::Token(Some("Hel".into())));
        assert_eq!(
            event("token", json!({"text": "lo"})),
            ServerEvent::Token(Some("lo".into()))
        );
        assert_eq!(
            event("token", json!({"token": "a", "text": "b"})),
            ServerEvent::Token(Some("a".into()))
        );
        assert_eq!(event("token", json!("")), ServerEvent::Token(None));
        assert_eq!(event("token", Value::Null), ServerEvent::Token(None));
    }

    #[test]
    fn tool_payload_normalizes() {
        let parsed = event(
            "tool",
            json!({
                "tool": "search",
                "status": "success",
                "latency_ms": 12.4,
                "result_preview": "3 hits",
            }),
        );
        assert_eq!(
            parsed,
            ServerEvent::Tool(Some(ToolEvent {
                tool: "search".into(),
                status: ToolStatus::Success,
                latency_ms: Some(12),
                result_preview: Some("3 hits".into()),
            }))
        );
        assert_eq!(event("tool", json!("nope")), ServerEvent::Tool(None));
    }

    #[test]
    fn log_payload_accepts_object_and_string() {
        assert_eq!(
            event("log", json!({"level": "warn", "msg": "slow"})),
            ServerEvent::Log(Some(LogEntry {
                level: "warn".into(),
                msg: "slow".into()
            }))
        );
        assert_eq!(
            event("log", json!("plain")),
            ServerEvent::Log(Some(LogEntry::info("plain")))
        );
    }

    #[test]
    fn error_payload_requires_usable_string() {
        assert_eq!(
            event("error", json!("backend exploded")),
            ServerEvent::Error(Some("backend exploded".into()))
        );
        assert_eq!(event("error", Value::Null), ServerEvent::Error(None));
        assert_eq!(event("error", json!({"code": 1})), ServerEvent::Error(None));
    }

    #[test]
    fn done_payload_prefers_final_text() {
        let ServerEvent::Done(done) = event(
            "done",
            json!({"content": "c", "final_text": "f", "tool_events": null, "stt_confidence": 0.5}),
        ) else {
            panic!("expected done");
        };
        assert_eq!(done.final_content(), Some("f"));
        assert!(done.tool_events().is_empty());
        assert!(done.has_stt_data());

        let ServerEvent::Done(empty) = event("done", Value::Null) else {
            panic!("expected done");
        };
        assert_eq!(empty, DonePayload::default());
    }

    #[test]
    fn done_payload_keeps_fields_around_a_mistyped_one() {
        let ServerEvent::Done(done) = event(
            "done",
            json!({"final_text": "The answer", "audio_b64": "UklGRg==", "stt_confidence": "0.9"}),
        ) else {
            panic!("expected done");
        };
        assert_eq!(done.final_content(), Some("The answer"));
        assert_eq!(done.audio_b64.as_deref(), Some("UklGRg=="));
        assert_eq!(done.stt_confidence, None);
        assert!(!done.has_stt_data());

        let ServerEvent::Done(done) = event(
            "done",
            json!({
                "content": "c",
                "transcript": 42,
                "tool_events": {"tool": "not-a-list"},
                "logs": [{"level": "info", "msg": "kept"}],
                "stt_language": "en",
            }),
        ) else {
            panic!("expected done");
        };
        assert_eq!(done.final_content(), Some("c"));
        assert_eq!(done.transcript, None);
        assert_eq!(done.tool_events, None);
        assert_eq!(done.log_entries(), vec![LogEntry::info("kept")]);
        assert_eq!(done.stt_language.as_deref(), Some("en"));
    }

    #[test]
    fn request_serializes_without_absent_fields() {
        let config = SessionConfig::default();
        let req = UnifiedChatRequest::text(&config, "s1", vec![], "hi");
        let body = serde_json::to_value(&req).expect("serialize");
        assert_eq!(body["text_input"], "hi");
        assert_eq!(body["stream"], true);
        assert!(body.get("audio_b64").is_none());

        let req = UnifiedChatRequest::voice(&config, "s1", vec![], "AAA=".into(), 16000);
        let body = serde_json::to_value(&req).expect("serialize");
        assert_eq!(body["sample_rate"], 16000);
        assert!(body.get("text_input").is_none());
    }

    #[test]
    fn unknown_event_name_is_other() {
        assert_eq!(
            event("message", json!("x")),
            ServerEvent::Other("message".into())
        );
    }
}
