//! PCM16 framing and encoding for voice payloads
//!
//! Captured audio arrives as f32 samples at the device rate. It is mixed to
//! mono and buffered at that rate; the whole take is resampled to the target
//! rate once capture stops, then cut into fixed-size PCM16 frames and base64
//! encoded for the request body.

use base64::Engine;

/// Samples per buffered frame
pub const FRAME_SAMPLES: usize = 4096;

/// Convert one f32 sample to PCM16.
///
/// Input is clamped to [-1, 1]; positive values scale by 0x7fff and negative
/// values by 0x8000, so both extremes map exactly onto the i16 range.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Convert samples into PCM16 frames of [`FRAME_SAMPLES`]. The last frame may
/// be shorter.
pub fn to_frames(samples: &[f32]) -> Vec<Vec<i16>> {
    samples
        .chunks(FRAME_SAMPLES)
        .map(|chunk| chunk.iter().copied().map(f32_to_pcm16).collect())
        .collect()
}

/// Concatenate frames into little-endian PCM16 bytes.
pub fn concat_frames(frames: &[Vec<i16>]) -> Vec<u8> {
    let total: usize = frames.iter().map(Vec::len).sum();
    let mut bytes = Vec::with_capacity(total * 2);
    for sample in frames.iter().flatten() {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Full pipeline: f32 samples -> frames -> PCM16 bytes -> base64.
///
/// Returns `None` when there is no audio to send.
pub fn encode_voice_payload(samples: &[f32]) -> Option<String> {
    if samples.is_empty() {
        return None;
    }
    let frames = to_frames(samples);
    let bytes = concat_frames(&frames);
    log::debug!(
        "PCM: encoded {} samples in {} frames ({} bytes)",
        samples.len(),
        frames.len(),
        bytes.len()
    );
    Some(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Average interleaved channels down to mono.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Resample mono audio from `src_rate` to `dst_rate`.
///
/// Integer downsampling ratios average each block of input samples; any other
/// ratio uses linear interpolation.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || dst_rate == 0 {
        return samples.to_vec();
    }

    if src_rate > dst_rate && src_rate % dst_rate == 0 {
        let step = (src_rate / dst_rate) as usize;
        return samples
            .chunks(step)
            .map(|block| block.iter().sum::<f32>() / block.len() as f32)
            .collect();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Mono capture at the device rate.
///
/// Callback buffers are appended as they arrive and the take is resampled in
/// one pass, so callback boundaries never split an averaging block or reset
/// the interpolation phase.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    samples: Vec<f32>,
    source_rate: u32,
}

impl CaptureBuffer {
    pub fn new(source_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            source_rate,
        }
    }

    /// Set the device rate once the input stream is configured.
    pub fn set_source_rate(&mut self, source_rate: u32) {
        self.source_rate = source_rate;
    }

    /// Append one callback buffer of interleaved samples.
    pub fn push_interleaved(&mut self, data: &[f32], channels: u16) {
        if channels <= 1 {
            self.samples.extend_from_slice(data);
        } else {
            self.samples.extend(to_mono(data, channels));
        }
    }

    /// Samples buffered so far, at the device rate
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drain the take, resampled to `target_rate`.
    pub fn take(&mut self, target_rate: u32) -> Vec<f32> {
        let native = std::mem::take(&mut self.samples);
        if self.source_rate == 0 {
            return native;
        }
        resample(&native, self.source_rate, target_rate)
    }
}
