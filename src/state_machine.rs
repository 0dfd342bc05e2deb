//! Recording state machine for voxstream
//!
//! The voice workflow uses a single-writer reducer: every transition goes
//! through `reduce()`, which returns the next state and the effects to run.
//! Results from the audio thread and timers carry the recording id they
//! belong to, and events for any other id are dropped.
//!
//! The `Effect` enum is shared with the exchange side of the session; the
//! session controller resolves `Notify`, `SubmitVoice` and `EmitUi` itself
//! and hands the rest to the effect runner.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::streaming::StreamRequest;

/// User-visible notice. Presentation is up to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A send or recording was attempted while a response is streaming
    Busy,
    Warning(String),
    Error(String),
}

/// Authoritative state of the recording workflow.
#[derive(Debug, Clone, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Arming {
        recording_id: Uuid,
        max_duration: Duration,
    },
    Recording {
        recording_id: Uuid,
        started_at: Instant,
    },
    Stopping {
        recording_id: Uuid,
    },
}

impl RecordingState {
    pub fn recording_id(&self) -> Option<Uuid> {
        match self {
            RecordingState::Idle => None,
            RecordingState::Arming { recording_id, .. }
            | RecordingState::Recording { recording_id, .. }
            | RecordingState::Stopping { recording_id } => Some(*recording_id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, RecordingState::Idle)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Arming { .. } => "arming",
            RecordingState::Recording { .. } => "recording",
            RecordingState::Stopping { .. } => "stopping",
        }
    }
}

/// Events that drive the recording workflow.
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// User asked to start recording
    Start { max_duration: Duration },
    /// User asked to stop and send
    Stop,
    /// Stop and discard
    Cancel,

    // Audio events
    StartOk { id: Uuid },
    StartFail { id: Uuid, err: String },
    /// Capture finished; mono f32 samples at the target rate
    Captured { id: Uuid, samples: Vec<f32> },
    CaptureFail { id: Uuid, err: String },

    /// Recording ceiling reached
    Timeout { id: Uuid },
}

/// Effects to be executed after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire the microphone and start capture
    StartRecording { id: Uuid },
    /// Stop capture and deliver `Captured`
    StopRecording { id: Uuid },
    /// Stop capture and discard the samples
    CancelRecording { id: Uuid },
    StartRecordingTimeout { id: Uuid, duration: Duration },
    /// Open the event stream for an exchange
    OpenStream {
        exchange_id: Uuid,
        request: StreamRequest,
    },
    PlayAudio { audio_b64: String },
    RefreshSessions,

    // Resolved by the session controller
    Notify(Notice),
    SubmitVoice { samples: Vec<f32> },
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale recording IDs
/// - Always emit EmitUi after state changes
pub fn reduce(state: &RecordingState, event: RecordingEvent) -> (RecordingState, Vec<Effect>) {
    use Effect::*;
    use RecordingEvent::*;
    use RecordingState::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, Start { max_duration }) => {
            let id = Uuid::new_v4();
            log::info!("Recording: arming {}", id);
            (
                Arming {
                    recording_id: id,
                    max_duration,
                },
                vec![StartRecording { id }, EmitUi],
            )
        }

        // -----------------
        // Arming
        // -----------------
        (
            Arming {
                recording_id,
                max_duration,
            },
            StartOk { id },
        ) if *recording_id == id => (
            Recording {
                recording_id: id,
                started_at: Instant::now(),
            },
            vec![
                StartRecordingTimeout {
                    id,
                    duration: *max_duration,
                },
                EmitUi,
            ],
        ),
        (Arming { recording_id, .. }, StartFail { id, err }) if *recording_id == id => {
            log::error!("Recording: {} failed to start: {}", id, err);
            (Idle, vec![Notify(Notice::Error(err)), EmitUi])
        }
        // Capture has not started yet, so there is nothing to send
        (Arming { recording_id, .. }, Stop | Cancel) => (
            Idle,
            vec![CancelRecording { id: *recording_id }, EmitUi],
        ),

        // -----------------
        // Recording
        // -----------------
        (Recording { recording_id, .. }, Stop) => (
            Stopping {
                recording_id: *recording_id,
            },
            vec![StopRecording { id: *recording_id }, EmitUi],
        ),
        (
            Recording {
                recording_id,
                started_at,
            },
            Timeout { id },
        ) if *recording_id == id => {
            log::warn!(
                "Recording: {} auto-stopped after {:?} (max duration reached)",
                id,
                started_at.elapsed()
            );
            (
                Stopping { recording_id: id },
                vec![StopRecording { id }, EmitUi],
            )
        }
        (Recording { recording_id, .. }, Cancel) => (
            Idle,
            vec![CancelRecording { id: *recording_id }, EmitUi],
        ),

        // -----------------
        // Stopping
        // -----------------
        (Stopping { recording_id }, Captured { id, samples }) if *recording_id == id => {
            if samples.is_empty() {
                log::warn!("Recording: {} captured no audio", id);
                (
                    Idle,
                    vec![
                        Notify(Notice::Warning("No audio captured".to_string())),
                        EmitUi,
                    ],
                )
            } else {
                (Idle, vec![SubmitVoice { samples }, EmitUi])
            }
        }
        (Stopping { recording_id }, Cancel) => (
            Idle,
            vec![CancelRecording { id: *recording_id }, EmitUi],
        ),

        // -----------------
        // Capture failure while live
        // -----------------
        (Recording { recording_id, .. } | Stopping { recording_id }, CaptureFail { id, err })
            if *recording_id == id =>
        {
            log::error!("Recording: {} capture failed: {}", id, err);
            (
                Idle,
                vec![CancelRecording { id }, Notify(Notice::Error(err)), EmitUi],
            )
        }

        // -----------------
        // Stale or unhandled: no transition
        // -----------------
        (_, StartOk { id }) if state.recording_id() != Some(id) => {
            // Late start after a cancel; make sure the device is released
            (state.clone(), vec![CancelRecording { id }])
        }
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(30);

    fn arming(id: Uuid) -> RecordingState {
        RecordingState::Arming {
            recording_id: id,
            max_duration: MAX,
        }
    }

    fn recording(id: Uuid) -> RecordingState {
        RecordingState::Recording {
            recording_id: id,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn idle_start_transitions_to_arming() {
        let (next, effects) = reduce(
            &RecordingState::Idle,
            RecordingEvent::Start { max_duration: MAX },
        );
        assert!(matches!(next, RecordingState::Arming { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartRecording { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn start_ok_arms_timeout_with_configured_ceiling() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&arming(id), RecordingEvent::StartOk { id });
        assert!(matches!(
            next,
            RecordingState::Recording { recording_id, .. } if recording_id == id
        ));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartRecordingTimeout { id: tid, duration } if *tid == id && *duration == MAX
        )));
    }

    #[test]
    fn start_fail_returns_to_idle_with_error_notice() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &arming(id),
            RecordingEvent::StartFail {
                id,
                err: "No microphone found".to_string(),
            },
        );
        assert!(next.is_idle());
        assert!(effects.iter().any(
            |e| matches!(e, Effect::Notify(Notice::Error(msg)) if msg == "No microphone found")
        ));
    }

    #[test]
    fn stale_start_ok_is_ignored_but_releases_device() {
        let id = Uuid::new_v4();
        let stale_id = Uuid::new_v4();
        let (next, effects) = reduce(&arming(id), RecordingEvent::StartOk { id: stale_id });
        assert!(matches!(next, RecordingState::Arming { recording_id, .. } if recording_id == id));
        assert!(matches!(
            effects.as_slice(),
            [Effect::CancelRecording { id: cid }] if *cid == stale_id
        ));
    }

    #[test]
    fn stop_while_recording_requests_capture() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&recording(id), RecordingEvent::Stop);
        assert!(matches!(next, RecordingState::Stopping { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopRecording { id: sid } if *sid == id)));
    }

    #[test]
    fn timeout_with_matching_id_stops() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&recording(id), RecordingEvent::Timeout { id });
        assert!(matches!(next, RecordingState::Stopping { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopRecording { .. })));
    }

    #[test]
    fn timeout_with_stale_id_is_ignored() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            RecordingEvent::Timeout {
                id: Uuid::new_v4(),
            },
        );
        assert!(matches!(next, RecordingState::Recording { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn empty_capture_warns_and_submits_nothing() {
        let id = Uuid::new_v4();
        let state = RecordingState::Stopping { recording_id: id };
        let (next, effects) = reduce(
            &state,
            RecordingEvent::Captured {
                id,
                samples: vec![],
            },
        );
        assert!(next.is_idle());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(Notice::Warning(_)))));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::SubmitVoice { .. })));
    }

    #[test]
    fn captured_audio_is_submitted() {
        let id = Uuid::new_v4();
        let state = RecordingState::Stopping { recording_id: id };
        let (next, effects) = reduce(
            &state,
            RecordingEvent::Captured {
                id,
                samples: vec![0.1, 0.2],
            },
        );
        assert!(next.is_idle());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::SubmitVoice { samples } if samples.len() == 2)));
    }

    #[test]
    fn cancel_during_recording_discards() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&recording(id), RecordingEvent::Cancel);
        assert!(next.is_idle());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelRecording { .. })));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::StopRecording { .. })));
    }

    #[test]
    fn capture_failure_releases_device_and_reports() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            RecordingEvent::CaptureFail {
                id,
                err: "device unplugged".to_string(),
            },
        );
        assert!(next.is_idle());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelRecording { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(Notice::Error(_)))));
    }

    #[test]
    fn stop_while_idle_is_noop() {
        let (next, effects) = reduce(&RecordingState::Idle, RecordingEvent::Stop);
        assert!(next.is_idle());
        assert!(effects.is_empty());
    }
}
