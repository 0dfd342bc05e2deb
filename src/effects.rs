//! Effect runner for voxstream
//!
//! Executes the effects the session controller returns. Every result comes
//! back to the session loop as a `SessionEvent` tagged with the recording or
//! exchange id it belongs to, so late results can be dropped there.
//!
//! Audio capture and playback block (cpal streams live on their own
//! threads), so they run through `spawn_blocking`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::audio::{play_wav_base64, AudioRecorder, RecordingHandle};
use crate::session::SessionEvent;
use crate::sessions::fetch_sessions;
use crate::settings::ChatSettings;
use crate::state_machine::{Effect, RecordingEvent};
use crate::streaming::{
    EventStreamClient, StreamController, StreamError, StreamEvent, StreamRequest, StreamSignal,
};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<SessionEvent>);

    /// Open the event stream for an exchange and forward its signals.
    /// The returned controller cancels the stream.
    fn open_stream(
        &self,
        exchange_id: Uuid,
        request: StreamRequest,
        tx: mpsc::Sender<SessionEvent>,
    ) -> StreamController;
}

/// Runner backed by the real microphone, speakers and backend
pub struct LiveEffectRunner {
    client: EventStreamClient,
    http: reqwest::Client,
    sessions_url: String,
    bearer_token: Option<String>,
    recorder: AudioRecorder,
    active_recordings: Arc<Mutex<HashMap<Uuid, RecordingHandle>>>,
}

impl LiveEffectRunner {
    pub fn new(settings: &ChatSettings) -> Result<Arc<Self>, StreamError> {
        let timeout = Duration::from_secs(settings.request_timeout_secs.max(1));
        let client = EventStreamClient::with_connect_timeout(settings.base_url.clone(), timeout)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StreamError::InvalidRequest(e.to_string()))?;
        let sessions_url = format!(
            "{}/{}",
            client.base_url(),
            settings.sessions_path.trim_start_matches('/')
        );

        log::info!(
            "EffectRunner: backend {} (auth {})",
            client.base_url(),
            if settings.api_key.is_some() { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            client,
            http,
            sessions_url,
            bearer_token: settings.api_key.clone(),
            recorder: AudioRecorder::new(settings.sample_rate),
            active_recordings: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

impl EffectRunner for LiveEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<SessionEvent>) {
        match effect {
            Effect::StartRecording { id } => {
                let recorder = self.recorder;
                let active = self.active_recordings.clone();

                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || recorder.start(id))
                        .await
                        .unwrap_or_else(|e| {
                            Err(crate::audio::AudioError::CaptureThreadFailed(e.to_string()))
                        });

                    let event = match result {
                        Ok(handle) => {
                            active.lock().await.insert(id, handle);
                            RecordingEvent::StartOk { id }
                        }
                        Err(e) => {
                            log::error!("Failed to start audio recording: {}", e);
                            RecordingEvent::StartFail {
                                id,
                                err: e.to_string(),
                            }
                        }
                    };
                    let _ = tx.send(SessionEvent::Recording(event)).await;
                });
            }

            Effect::StopRecording { id } => {
                let active = self.active_recordings.clone();

                tokio::spawn(async move {
                    let handle = active.lock().await.remove(&id);
                    let Some(handle) = handle else {
                        log::warn!("StopRecording: no active handle for id={}", id);
                        let _ = tx
                            .send(SessionEvent::Recording(RecordingEvent::CaptureFail {
                                id,
                                err: "Recording was not running".to_string(),
                            }))
                            .await;
                        return;
                    };

                    let event = match tokio::task::spawn_blocking(move || handle.stop()).await {
                        Ok(samples) => {
                            log::info!("Audio recording stopped: {} samples", samples.len());
                            RecordingEvent::Captured { id, samples }
                        }
                        Err(e) => RecordingEvent::CaptureFail {
                            id,
                            err: format!("Audio thread failed: {}", e),
                        },
                    };
                    let _ = tx.send(SessionEvent::Recording(event)).await;
                });
            }

            Effect::CancelRecording { id } => {
                let active = self.active_recordings.clone();

                tokio::spawn(async move {
                    if let Some(handle) = active.lock().await.remove(&id) {
                        log::info!("Audio recording {} discarded", id);
                        // Dropping joins the capture thread
                        let _ = tokio::task::spawn_blocking(move || drop(handle)).await;
                    }
                });
            }

            Effect::StartRecordingTimeout { id, duration } => {
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    log::debug!("Recording timeout elapsed for id={}", id);
                    let _ = tx
                        .send(SessionEvent::Recording(RecordingEvent::Timeout { id }))
                        .await;
                });
            }

            Effect::PlayAudio { audio_b64 } => {
                tokio::spawn(async move {
                    match tokio::task::spawn_blocking(move || play_wav_base64(&audio_b64)).await {
                        Ok(Ok(())) => log::debug!("Playback finished"),
                        Ok(Err(e)) => log::warn!("Playback failed: {}", e),
                        Err(e) => log::warn!("Playback task failed: {}", e),
                    }
                });
            }

            Effect::RefreshSessions => {
                let http = self.http.clone();
                let url = self.sessions_url.clone();
                let token = self.bearer_token.clone();

                tokio::spawn(async move {
                    match fetch_sessions(&http, &url, token.as_deref()).await {
                        Ok(sessions) => {
                            let _ = tx.send(SessionEvent::SessionsRefreshed(sessions)).await;
                        }
                        Err(e) => log::warn!("Session list refresh failed: {}", e),
                    }
                });
            }

            Effect::OpenStream { exchange_id, .. } => {
                log::warn!(
                    "EffectRunner: OpenStream for {} must go through open_stream",
                    exchange_id
                );
            }

            // Resolved by the session controller
            Effect::Notify(_) | Effect::SubmitVoice { .. } | Effect::EmitUi => {}
        }
    }

    fn open_stream(
        &self,
        exchange_id: Uuid,
        mut request: StreamRequest,
        tx: mpsc::Sender<SessionEvent>,
    ) -> StreamController {
        if request.overrides.bearer_token.is_none() {
            request.overrides.bearer_token = self.bearer_token.clone();
        }

        let (controller, mut events) = self.client.open(request);
        tokio::spawn(async move {
            while let Some(signal) = events.next().await {
                if tx
                    .send(SessionEvent::Stream {
                        exchange_id,
                        signal,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        controller
    }
}

/// Stub effect runner for testing and offline use.
/// Recording yields a short tone; every stream replays `script`.
pub struct StubEffectRunner {
    script: Vec<StreamSignal>,
    event_delay: Duration,
}

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Self::with_script(vec![
            StreamSignal::Event(StreamEvent::new("token", "Stub ".into())),
            StreamSignal::Event(StreamEvent::new("token", "reply".into())),
            StreamSignal::Event(StreamEvent::new("done", serde_json::json!({}))),
            StreamSignal::Closed,
        ])
    }

    pub fn with_script(script: Vec<StreamSignal>) -> Arc<Self> {
        Arc::new(Self {
            script,
            event_delay: Duration::from_millis(5),
        })
    }

    fn tone(samples: usize) -> Vec<f32> {
        (0..samples)
            .map(|i| (i as f32 * 0.05).sin() * 0.25)
            .collect()
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<SessionEvent>) {
        match effect {
            Effect::StartRecording { id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log::info!("Stub: recording {} started", id);
                    let _ = tx
                        .send(SessionEvent::Recording(RecordingEvent::StartOk { id }))
                        .await;
                });
            }

            Effect::StopRecording { id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let samples = Self::tone(4000);
                    log::info!("Stub: recording {} stopped", id);
                    let _ = tx
                        .send(SessionEvent::Recording(RecordingEvent::Captured { id, samples }))
                        .await;
                });
            }

            Effect::CancelRecording { id } => {
                log::info!("Stub: recording {} discarded", id);
            }

            Effect::StartRecordingTimeout { id, duration } => {
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = tx
                        .send(SessionEvent::Recording(RecordingEvent::Timeout { id }))
                        .await;
                });
            }

            Effect::PlayAudio { audio_b64 } => {
                log::info!("Stub: would play {} bytes of audio", audio_b64.len());
            }

            Effect::RefreshSessions => {
                log::debug!("Stub: session list refresh skipped");
            }

            Effect::OpenStream { .. }
            | Effect::Notify(_)
            | Effect::SubmitVoice { .. }
            | Effect::EmitUi => {}
        }
    }

    fn open_stream(
        &self,
        exchange_id: Uuid,
        request: StreamRequest,
        tx: mpsc::Sender<SessionEvent>,
    ) -> StreamController {
        log::info!("Stub: opening stream for {} ({})", exchange_id, request.path);
        let controller = StreamController::default();
        let cancelled = controller.clone();
        let script = self.script.clone();
        let delay = self.event_delay;

        tokio::spawn(async move {
            for signal in script {
                tokio::time::sleep(delay).await;
                let signal = if cancelled.is_cancelled() {
                    StreamSignal::Closed
                } else {
                    signal
                };
                let terminal = signal.is_terminal();
                let event = SessionEvent::Stream {
                    exchange_id,
                    signal,
                };
                if tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
        });
        controller
    }
}
