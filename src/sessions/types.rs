//! Data structures for the session listing endpoint.

use serde::{Deserialize, Serialize};

/// One stored conversation as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(alias = "id")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Timestamp as sent by the backend; not interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// The endpoint answers either a bare array or an object wrapping one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum SessionsResponse {
    List(Vec<SessionSummary>),
    Wrapped { sessions: Vec<SessionSummary> },
}

impl SessionsResponse {
    pub(super) fn into_sessions(self) -> Vec<SessionSummary> {
        match self {
            SessionsResponse::List(sessions) => sessions,
            SessionsResponse::Wrapped { sessions } => sessions,
        }
    }
}
