//! Event stream transport for the unified chat endpoint
//!
//! This module opens one HTTP request whose response body is a sequence of
//! server-sent-event frames and hands each decoded frame to the caller as soon
//! as it is complete.
//!
//! # Architecture
//!
//! ```text
//! reqwest body chunks ──▶ SseFrameDecoder ──▶ StreamEvent ──▶ EventStream (mpsc)
//!          ▲                                                      │
//!          └──────── StreamController::cancel() (token) ◀─────────┘
//! ```
//!
//! # Termination
//!
//! Every stream ends with exactly one terminal signal: `Closed` (normal end of
//! body, or cancellation) or `Error` (any transport fault). Cancellation never
//! produces `Error`.

mod event_client;
mod frame;
mod protocol;

pub use event_client::{
    EventStream, EventStreamClient, FetchOverrides, StreamController, StreamHandler,
    StreamRequest, StreamSignal,
};
pub use frame::{parse_frame, SseFrameDecoder, StreamEvent, DEFAULT_EVENT_NAME};
pub use protocol::{DonePayload, ServerEvent, UnifiedChatRequest, WireMessage};

/// Errors that can end an event stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    /// Request could not be built (bad URL, body serialization)
    InvalidRequest(String),
    /// Network failure before or during the body
    Network(String),
    /// Non-2xx status from the backend
    Http { status: u16, message: String },
    /// Response had no readable body
    MissingBody,
    /// Body ended before a terminal application event
    ClosedEarly,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::InvalidRequest(e) => write!(f, "Invalid stream request: {}", e),
            StreamError::Network(e) => write!(f, "Network error: {}", e),
            StreamError::Http { status, message } => {
                write!(f, "Chat request failed ({}): {}", status, message)
            }
            StreamError::MissingBody => write!(f, "Response did not include a readable stream"),
            StreamError::ClosedEarly => {
                write!(f, "Connection closed before the response completed")
            }
        }
    }
}

impl std::error::Error for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        let err = StreamError::Http {
            status: 502,
            message: "upstream unavailable".to_string(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("upstream unavailable"));

        let err = StreamError::Network("connection reset".to_string());
        assert!(err.to_string().contains("connection reset"));

        assert!(StreamError::MissingBody.to_string().contains("stream"));
    }
}
