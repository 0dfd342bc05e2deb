//! Session listing for the chat backend.
//!
//! This module provides:
//! - Summary type for one stored conversation
//! - Client for `GET /v1/sessions`
//!
//! The listing is refreshed after every finalized exchange; failures are
//! logged and leave the previous list in place.

mod client;
mod types;

pub use client::{fetch_sessions, SessionsError};
pub use types::SessionSummary;
