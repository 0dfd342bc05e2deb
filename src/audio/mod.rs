//! Audio for voxstream
//!
//! Microphone capture (CPAL) feeding the voice send path, PCM16 framing and
//! base64 encoding, and best-effort playback of synthesized replies (hound +
//! CPAL).

pub mod pcm;
pub mod playback;
pub mod recorder;

pub use pcm::{encode_voice_payload, FRAME_SAMPLES};
pub use playback::{play_wav_base64, PlaybackError};
pub use recorder::{AudioError, AudioRecorder, RecordingHandle};
