//! PCM containers shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};

/// Sample rate and channel layout of a PCM buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    /// Number of frames covering `ms` milliseconds, rounded to the nearest frame.
    pub fn frames_for_ms(&self, ms: u64) -> usize {
        ((ms as u128 * self.sample_rate as u128 + 500) / 1000) as usize
    }

    /// Duration of `frames` frames in milliseconds (fractional).
    pub fn ms_for_frames(&self, frames: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 * 1000.0 / self.sample_rate as f64
    }
}

impl Default for AudioFormat {
    /// The synthesis collaborator speaks 24 kHz mono.
    fn default() -> Self {
        Self::new(24_000, 1)
    }
}

/// Interleaved f32 PCM in the range [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(format: AudioFormat, samples: Vec<f32>) -> Self {
        Self { format, samples }
    }

    pub fn silence(format: AudioFormat, frames: usize) -> Self {
        Self {
            format,
            samples: vec![0.0; frames * format.channels as usize],
        }
    }

    /// Silence lasting `ms` milliseconds; used for gaps and degraded placeholders.
    pub fn silence_ms(format: AudioFormat, ms: u64) -> Self {
        Self::silence(format, format.frames_for_ms(ms))
    }

    pub fn frames(&self) -> usize {
        match self.format.channels {
            0 => 0,
            c => self.samples.len() / c as usize,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        self.format.ms_for_frames(self.frames())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Multiply every frame in `[start, start + len)` by `gain(k)`, where `k` is
    /// the frame offset inside the window.
    pub(crate) fn apply_gain_window(&mut self, start: usize, len: usize, gain: impl Fn(usize) -> f32) {
        let channels = self.format.channels as usize;
        let end = (start + len).min(self.frames());
        for frame in start..end {
            let g = gain(frame - start);
            for s in &mut self.samples[frame * channels..(frame + 1) * channels] {
                *s *= g;
            }
        }
    }

    pub fn scale(&mut self, gain: f32) {
        for s in &mut self.samples {
            *s *= gain;
        }
    }

    /// Peak absolute amplitude; handy for assertions and logs.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }
}

/// Encoding of the bytes handed back by a synthesizer or a BGM source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioEncoding {
    /// RIFF/WAV container.
    Wav,
    /// Headerless little-endian 16-bit PCM.
    Pcm16Le { sample_rate: u32, channels: u16 },
    /// Anything else (mp3, ogg, ...). Kept so the assembler can reject it explicitly.
    Other(String),
}

/// Undecoded audio as it arrives from a collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudio {
    pub encoding: AudioEncoding,
    pub bytes: Vec<u8>,
}

impl RawAudio {
    pub fn wav(bytes: Vec<u8>) -> Self {
        Self { encoding: AudioEncoding::Wav, bytes }
    }

    pub fn pcm16(sample_rate: u32, channels: u16, bytes: Vec<u8>) -> Self {
        Self {
            encoding: AudioEncoding::Pcm16Le { sample_rate, channels },
            bytes,
        }
    }
}

/// Shape of a fade or crossfade ramp.
///
/// Gains for a ramp position `t` in [0, 1]:
/// * `Linear` - `t`
/// * `EqualPower` - `sin(t * PI / 2)`
/// * `Exponential` - `t * t`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    #[default]
    Linear,
    EqualPower,
    Exponential,
}

impl FadeCurve {
    pub fn gain(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::EqualPower => (t * std::f32::consts::FRAC_PI_2).sin(),
            FadeCurve::Exponential => t * t,
        }
    }

    /// Gain of frame `k` of an `n`-frame fade-in: starts at 0, reaches ~1 on the last frame.
    pub fn fade_in(self, k: usize, n: usize) -> f32 {
        if n == 0 {
            return 1.0;
        }
        self.gain(k as f32 / n as f32)
    }

    /// Gain of frame `k` of an `n`-frame fade-out: the last frame is silent.
    pub fn fade_out(self, k: usize, n: usize) -> f32 {
        if n == 0 {
            return 1.0;
        }
        self.gain((n - k - 1) as f32 / n as f32)
    }
}

/// Decibels to linear amplitude.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Fade the first `frames` frames in.
pub fn fade_in(buffer: &mut AudioBuffer, frames: usize, curve: FadeCurve) {
    let n = frames.min(buffer.frames());
    buffer.apply_gain_window(0, n, |k| curve.fade_in(k, n));
}

/// Fade the last `frames` frames out, ending at `end_frame` (exclusive).
pub fn fade_out_ending_at(buffer: &mut AudioBuffer, end_frame: usize, frames: usize, curve: FadeCurve) {
    let end = end_frame.min(buffer.frames());
    let n = frames.min(end);
    buffer.apply_gain_window(end - n, n, |k| curve.fade_out(k, n));
}
