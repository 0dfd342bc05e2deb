//! Microphone capture using CPAL
//!
//! The AudioRecorder captures from the default input device into memory as
//! mono f32 at the device rate and resamples to the target rate on stop.
//! cpal streams are not `Send`, so each
//! recording owns a dedicated audio thread that builds the stream, keeps it
//! alive, and drops it when told to stop. The handle itself is `Send` and can
//! live in the effect runner.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, Stream, StreamConfig};
use uuid::Uuid;

use super::pcm::CaptureBuffer;

/// Errors that can occur while acquiring or running the microphone.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    CaptureThreadFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No microphone found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::CaptureThreadFailed(e) => write!(f, "Audio capture thread failed: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

type SampleBuffer = Arc<Mutex<CaptureBuffer>>;

/// Handle to an active recording.
/// When dropped without `stop()`, the device is released and samples are discarded.
pub struct RecordingHandle {
    recording_id: Uuid,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    samples: SampleBuffer,
    target_rate: u32,
}

impl RecordingHandle {
    /// Stop capture, release the device, and return the captured samples
    /// resampled to the target rate.
    pub fn stop(mut self) -> Vec<f32> {
        self.release();
        let samples = match self.samples.lock() {
            Ok(mut guard) => guard.take(self.target_rate),
            Err(poisoned) => poisoned.into_inner().take(self.target_rate),
        };
        log::info!(
            "Recorder: stopped {} with {} samples",
            self.recording_id,
            samples.len()
        );
        samples
    }

    pub fn id(&self) -> Uuid {
        self.recording_id
    }

    fn release(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // Thread may already have exited on a stream error
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Recorder: audio thread panicked for {}", self.recording_id);
            }
        }
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            log::debug!("Recorder: releasing device for {}", self.recording_id);
        }
        self.release();
    }
}

/// Capture format reported by the device
#[derive(Debug, Clone)]
struct CaptureFormat {
    config: StreamConfig,
    sample_format: SampleFormat,
}

/// Microphone recorder targeting a fixed output rate.
#[derive(Debug, Clone, Copy)]
pub struct AudioRecorder {
    target_rate: u32,
}

impl AudioRecorder {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    /// Acquire the default input device and start capturing.
    ///
    /// Blocks until the stream is running or has failed to start.
    pub fn start(&self, recording_id: Uuid) -> Result<RecordingHandle, AudioError> {
        let samples: SampleBuffer = Arc::new(Mutex::new(CaptureBuffer::default()));
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();

        let thread_samples = samples.clone();
        let thread = std::thread::Builder::new()
            .name(format!("voxstream-capture-{}", recording_id))
            .spawn(move || {
                let stream = match open_input_stream(thread_samples) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Hold the stream until stop or handle drop
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::CaptureThreadFailed(e.to_string()))?;

        let started = ready_rx
            .recv()
            .map_err(|e| AudioError::CaptureThreadFailed(e.to_string()))
            .and_then(|r| r);

        match started {
            Ok(()) => {
                log::info!("Recorder: started {}", recording_id);
                Ok(RecordingHandle {
                    recording_id,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                    samples,
                    target_rate: self.target_rate,
                })
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }
}

fn default_capture_format(device: &Device) -> Result<CaptureFormat, AudioError> {
    let supported = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Recorder: device config {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    Ok(CaptureFormat {
        sample_format: supported.sample_format(),
        config: supported.into(),
    })
}

fn open_input_stream(samples: SampleBuffer) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;
    log::info!("Recorder: using input device {:?}", device.name());

    let format = default_capture_format(&device)?;
    let stream = match format.sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &format.config, samples),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &format.config, samples),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &format.config, samples),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e)))?;
    Ok(stream)
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    samples: SampleBuffer,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels;
    if let Ok(mut buffer) = samples.lock() {
        buffer.set_source_rate(config.sample_rate.0);
    }
    let err_fn = |err| log::error!("Recorder: audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let as_f32: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                if let Ok(mut buffer) = samples.lock() {
                    buffer.push_interleaved(&as_f32, channels);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
