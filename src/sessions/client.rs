//! Session listing client.

use super::types::{SessionSummary, SessionsResponse};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionsError {
    Network(String),
    Http { status: u16, body: String },
    Parse(String),
}

impl std::fmt::Display for SessionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionsError::Network(e) => write!(f, "Network error fetching sessions: {}", e),
            SessionsError::Http { status, body } => match status {
                401 => write!(f, "Invalid API key"),
                429 => write!(f, "Rate limited - try again later"),
                _ => write!(f, "API error {}: {}", status, body),
            },
            SessionsError::Parse(e) => write!(f, "Failed to parse sessions response: {}", e),
        }
    }
}

impl std::error::Error for SessionsError {}

/// Fetch the stored sessions from `url`.
pub async fn fetch_sessions(
    client: &reqwest::Client,
    url: &str,
    bearer_token: Option<&str>,
) -> Result<Vec<SessionSummary>, SessionsError> {
    let mut request = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json");
    if let Some(token) = bearer_token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| SessionsError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SessionsError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let parsed: SessionsResponse = response
        .json()
        .await
        .map_err(|e| SessionsError::Parse(e.to_string()))?;

    let sessions = parsed.into_sessions();
    log::debug!("Sessions: fetched {} sessions", sessions.len());
    Ok(sessions)
}
