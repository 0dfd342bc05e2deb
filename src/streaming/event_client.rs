//! Abortable SSE-over-HTTP client
//!
//! # Stream Flow
//!
//! 1. `open()` - spawn the request task, return a controller and a receiver
//! 2. Task sends the request, checks status, then reads body chunks
//! 3. Each complete frame is forwarded as `StreamSignal::Event`
//! 4. Task ends with exactly one `Closed` or `Error`
//!
//! Cancellation is checked before the response arrives and between every
//! chunk read, and always ends in `Closed`.

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{SseFrameDecoder, StreamEvent};
use super::StreamError;

/// Connect timeout for the initial request. The body itself has no deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered signals between the reader task and the consumer
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Fields searched for a human-readable message in JSON error bodies
const ERROR_BODY_FIELDS: [&str; 3] = ["detail", "error", "message"];

/// What the reader task delivers, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    Event(StreamEvent),
    Error(StreamError),
    Closed,
}

impl StreamSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamSignal::Event(_))
    }
}

/// Handle to one in-flight stream
#[derive(Debug, Clone, Default)]
pub struct StreamController {
    token: CancellationToken,
}

impl StreamController {
    /// Controller not attached to any request
    pub fn detached() -> Self {
        Self::default()
    }

    /// Abort the request. Idempotent; the stream ends with `Closed`.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            log::debug!("EventStream: cancel requested");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Lazy, finite sequence of signals for one stream.
pub struct EventStream {
    rx: mpsc::Receiver<StreamSignal>,
    finished: bool,
}

impl EventStream {
    /// Next signal, or `None` once the terminal signal has been returned.
    pub async fn next(&mut self) -> Option<StreamSignal> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(signal) => {
                self.finished = signal.is_terminal();
                Some(signal)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

/// Callback form of the stream. Only `on_event` is required.
pub trait StreamHandler: Send + 'static {
    fn on_event(&mut self, event: StreamEvent);

    fn on_error(&mut self, error: StreamError) {
        log::warn!("EventStream: unhandled stream error: {}", error);
    }

    fn on_close(&mut self) {}
}

/// Per-request overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOverrides {
    /// Defaults to POST
    pub method: Option<reqwest::Method>,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    /// Sent as `Authorization: Bearer <token>`
    pub bearer_token: Option<String>,
}

/// One stream request: path relative to the client's base URL plus a JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub path: String,
    pub body: Value,
    pub overrides: FetchOverrides,
}

impl StreamRequest {
    pub fn new(path: impl Into<String>, body: &impl Serialize) -> Result<Self, StreamError> {
        let body =
            serde_json::to_value(body).map_err(|e| StreamError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            path: path.into(),
            body,
            overrides: FetchOverrides::default(),
        })
    }

    pub fn with_overrides(mut self, overrides: FetchOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// HTTP client for event streams against one backend
#[derive(Debug, Clone)]
pub struct EventStreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl EventStreamClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StreamError> {
        Self::with_connect_timeout(base_url, CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn build_request(&self, request: &StreamRequest) -> reqwest::RequestBuilder {
        let overrides = &request.overrides;
        let method = overrides.method.clone().unwrap_or(reqwest::Method::POST);
        let mut builder = self
            .http
            .request(method, self.url_for(&request.path))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.body);

        if !overrides.query.is_empty() {
            builder = builder.query(&overrides.query);
        }
        for (name, value) in &overrides.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &overrides.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Open a stream. Must be called inside a tokio runtime.
    pub fn open(&self, request: StreamRequest) -> (StreamController, EventStream) {
        let controller = StreamController::default();
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

        log::info!(
            "EventStream: opening {} {}",
            request
                .overrides
                .method
                .as_ref()
                .map(|m| m.as_str())
                .unwrap_or("POST"),
            self.url_for(&request.path)
        );

        let builder = self.build_request(&request);
        tokio::spawn(run_stream(builder, controller.token.clone(), tx));

        (
            controller,
            EventStream {
                rx,
                finished: false,
            },
        )
    }

    /// Open a stream and drive `handler` from a background task.
    pub fn open_with_handler<H: StreamHandler>(
        &self,
        request: StreamRequest,
        mut handler: H,
    ) -> StreamController {
        let (controller, mut events) = self.open(request);
        tokio::spawn(async move {
            while let Some(signal) = events.next().await {
                match signal {
                    StreamSignal::Event(event) => handler.on_event(event),
                    StreamSignal::Error(error) => handler.on_error(error),
                    StreamSignal::Closed => handler.on_close(),
                }
            }
        });
        controller
    }
}

/// Pull a readable message out of an error body
fn error_message_from_body(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    for field in ERROR_BODY_FIELDS {
        match value.get(field) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Object(inner)) => {
                if let Some(Value::String(s)) = inner.get("message") {
                    return Some(s.clone());
                }
            }
            _ => {}
        }
    }
    None
}

async fn run_stream(
    builder: reqwest::RequestBuilder,
    token: CancellationToken,
    tx: mpsc::Sender<StreamSignal>,
) {
    let terminal = read_stream(builder, &token, &tx).await;
    match &terminal {
        StreamSignal::Error(e) => log::warn!("EventStream: ended with error: {}", e),
        _ => log::debug!("EventStream: closed"),
    }
    // Receiver may already be gone; nothing left to notify
    let _ = tx.send(terminal).await;
}

/// Reads the whole stream, forwarding events. Returns the terminal signal.
async fn read_stream(
    builder: reqwest::RequestBuilder,
    token: &CancellationToken,
    tx: &mpsc::Sender<StreamSignal>,
) -> StreamSignal {
    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return StreamSignal::Closed,
        result = builder.send() => result,
    };

    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_builder() => {
            return StreamSignal::Error(StreamError::InvalidRequest(e.to_string()))
        }
        Err(e) => return StreamSignal::Error(StreamError::Network(e.to_string())),
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamSignal::Closed,
            body = response.text() => body.unwrap_or_default(),
        };
        let message = error_message_from_body(&body).unwrap_or_else(|| {
            if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.trim().to_string()
            }
        });
        log::error!("EventStream: HTTP {}: {}", status.as_u16(), message);
        return StreamSignal::Error(StreamError::Http {
            status: status.as_u16(),
            message,
        });
    }

    if status == reqwest::StatusCode::NO_CONTENT || response.content_length() == Some(0) {
        return StreamSignal::Error(StreamError::MissingBody);
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseFrameDecoder::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamSignal::Closed,
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.push(&bytes) {
                    if token.is_cancelled() {
                        return StreamSignal::Closed;
                    }
                    log::debug!("EventStream: event '{}'", event.event);
                    if tx.send(StreamSignal::Event(event)).await.is_err() {
                        log::debug!("EventStream: receiver dropped, stopping");
                        return StreamSignal::Closed;
                    }
                }
            }
            Some(Err(e)) => {
                if token.is_cancelled() {
                    return StreamSignal::Closed;
                }
                return StreamSignal::Error(StreamError::Network(e.to_string()));
            }
            None => {
                decoder.finish();
                log::debug!(
                    "EventStream: body complete, {} frames",
                    decoder.frames_decoded()
                );
                return StreamSignal::Closed;
            }
        }
    }
}
