//! Playback of synthesized replies
//!
//! The backend may attach a base64 WAV clip to `done`. Playback is best
//! effort: every failure is logged and never reaches the session.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, StreamConfig};

use super::pcm::resample;

/// Extra wait past the clip length before giving up on the output stream
const PLAYBACK_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackError {
    InvalidBase64(String),
    InvalidWav(String),
    NoOutputDevice,
    StreamFailed(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::InvalidBase64(e) => write!(f, "Reply audio is not valid base64: {}", e),
            PlaybackError::InvalidWav(e) => write!(f, "Reply audio is not a readable WAV: {}", e),
            PlaybackError::NoOutputDevice => write!(f, "No audio output device found"),
            PlaybackError::StreamFailed(e) => write!(f, "Audio output failed: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Decoded clip: mono f32 samples and their rate
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode a base64 WAV payload into mono f32 samples.
pub fn decode_wav_base64(audio_b64: &str) -> Result<DecodedClip, PlaybackError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(audio_b64.trim())
        .map_err(|e| PlaybackError::InvalidBase64(e.to_string()))?;

    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PlaybackError::InvalidWav(e.to_string()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| PlaybackError::InvalidWav(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| PlaybackError::InvalidWav(e.to_string()))?
        }
    };

    Ok(DecodedClip {
        samples: super::pcm::to_mono(&interleaved, spec.channels),
        sample_rate: spec.sample_rate,
    })
}

/// Decode and play a reply clip on the default output device. Blocks until
/// playback finishes; call from a blocking thread.
pub fn play_wav_base64(audio_b64: &str) -> Result<(), PlaybackError> {
    let clip = decode_wav_base64(audio_b64)?;
    if clip.samples.is_empty() {
        log::debug!("Playback: empty clip, nothing to play");
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let samples = resample(&clip.samples, clip.sample_rate, config.sample_rate.0);
    log::info!(
        "Playback: {} samples at {} Hz on {:?}",
        samples.len(),
        config.sample_rate.0,
        device.name()
    );

    match sample_format {
        SampleFormat::F32 => play_typed::<f32>(&device, &config, samples),
        SampleFormat::I16 => play_typed::<i16>(&device, &config, samples),
        SampleFormat::U16 => play_typed::<u16>(&device, &config, samples),
        other => Err(PlaybackError::StreamFailed(format!(
            "unsupported output format {:?}",
            other
        ))),
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

fn play_typed<T>(
    device: &Device,
    config: &StreamConfig,
    samples: Vec<f32>,
) -> Result<(), PlaybackError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let limit = playback_deadline(samples.len(), config.sample_rate.0);
    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for frame in data.chunks_mut(channels) {
                    let value = if buf.position < buf.samples.len() {
                        let v = buf.samples[buf.position];
                        buf.position += 1;
                        v
                    } else {
                        buf.finished = true;
                        0.0
                    };
                    for out in frame.iter_mut() {
                        *out = <T as FromSample<f32>>::from_sample_(value);
                    }
                }
            },
            |err| log::error!("Playback: output stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))?;

    stream
        .play()
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))?;

    let finished = wait_until_finished(limit, || buffer.lock().map(|b| b.finished).unwrap_or(true));
    drop(stream);

    if finished {
        Ok(())
    } else {
        Err(PlaybackError::StreamFailed(format!(
            "playback did not finish within {:.1}s",
            limit.as_secs_f64()
        )))
    }
}

/// Clip length at the output rate plus [`PLAYBACK_GRACE`].
fn playback_deadline(frames: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / sample_rate.max(1) as f64) + PLAYBACK_GRACE
}

/// Poll until `finished` reports true or `limit` passes. Returns false on timeout.
fn wait_until_finished(limit: Duration, finished: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        std::thread::sleep(POLL_INTERVAL);
        if finished() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
    }
}
