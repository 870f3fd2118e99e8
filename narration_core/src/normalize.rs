//! Bring arbitrary collaborator audio to the job's common format.

use rubato::{FftFixedIn, Resampler};

use crate::audio::{AudioBuffer, AudioEncoding, AudioFormat, RawAudio};
use crate::wav;

const RESAMPLE_CHUNK: usize = 1024;
const RESAMPLE_SUB_CHUNKS: usize = 2;

/// A buffer that cannot be brought to the job's common format. Fatal for the job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatNormalizationError {
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("undecodable audio: {0}")]
    Decode(String),
    #[error("invalid format: {sample_rate} Hz, {channels} channel(s)")]
    InvalidFormat { sample_rate: u32, channels: u16 },
    #[error("cannot map {from} channel(s) to {to}")]
    ChannelLayout { from: u16, to: u16 },
    #[error("resampling {from} Hz -> {to} Hz failed: {reason}")]
    Resample { from: u32, to: u32, reason: String },
}

/// Decode `raw` and convert it to `target`.
pub fn normalize_raw(raw: &RawAudio, target: AudioFormat) -> Result<AudioBuffer, FormatNormalizationError> {
    let decoded = match &raw.encoding {
        AudioEncoding::Wav => {
            wav::decode_wav(&raw.bytes).map_err(|e| FormatNormalizationError::Decode(e.to_string()))?
        }
        AudioEncoding::Pcm16Le { sample_rate, channels } => {
            if raw.bytes.len() % 2 != 0 {
                return Err(FormatNormalizationError::Decode(
                    "odd byte count for 16-bit PCM".to_string(),
                ));
            }
            wav::decode_pcm16(&raw.bytes, AudioFormat::new(*sample_rate, *channels))
        }
        AudioEncoding::Other(mime) => {
            return Err(FormatNormalizationError::UnsupportedEncoding(mime.clone()))
        }
    };
    normalize_buffer(decoded, target)
}

/// Convert an already decoded buffer to `target` (channel mapping, then resampling).
pub fn normalize_buffer(buffer: AudioBuffer, target: AudioFormat) -> Result<AudioBuffer, FormatNormalizationError> {
    let source = buffer.format;
    if source.sample_rate == 0 || source.channels == 0 {
        return Err(FormatNormalizationError::InvalidFormat {
            sample_rate: source.sample_rate,
            channels: source.channels,
        });
    }
    if target.sample_rate == 0 || target.channels == 0 {
        return Err(FormatNormalizationError::InvalidFormat {
            sample_rate: target.sample_rate,
            channels: target.channels,
        });
    }
    if buffer.samples.len() % source.channels as usize != 0 {
        return Err(FormatNormalizationError::Decode(
            "sample count is not a multiple of the channel count".to_string(),
        ));
    }

    let mapped = map_channels(buffer, target.channels)?;
    if mapped.format.sample_rate == target.sample_rate {
        return Ok(mapped);
    }
    resample(&mapped, target.sample_rate)
}

fn map_channels(buffer: AudioBuffer, to: u16) -> Result<AudioBuffer, FormatNormalizationError> {
    let from = buffer.format.channels;
    if from == to {
        return Ok(buffer);
    }
    let rate = buffer.format.sample_rate;
    let samples = if to == 1 {
        // N -> mono: average
        buffer
            .samples
            .chunks_exact(from as usize)
            .map(|frame| frame.iter().sum::<f32>() / from as f32)
            .collect()
    } else if from == 1 {
        // mono -> N: duplicate
        buffer
            .samples
            .iter()
            .flat_map(|&s| std::iter::repeat(s).take(to as usize))
            .collect()
    } else {
        return Err(FormatNormalizationError::ChannelLayout { from, to });
    };
    Ok(AudioBuffer::new(AudioFormat::new(rate, to), samples))
}

/// FFT resampling, trimmed to exactly `round(frames * to / from)` frames so
/// that duration arithmetic downstream stays exact.
fn resample(buffer: &AudioBuffer, to: u32) -> Result<AudioBuffer, FormatNormalizationError> {
    let from = buffer.format.sample_rate;
    let channels = buffer.format.channels as usize;
    let frames_in = buffer.frames();
    let expected = ((frames_in as u128 * to as u128 + from as u128 / 2) / from as u128) as usize;
    let target = AudioFormat::new(to, buffer.format.channels);
    if frames_in == 0 {
        return Ok(AudioBuffer::silence(target, 0));
    }

    let err = |reason: String| FormatNormalizationError::Resample { from, to, reason };
    let mut resampler = FftFixedIn::<f32>::new(
        from as usize,
        to as usize,
        RESAMPLE_CHUNK,
        RESAMPLE_SUB_CHUNKS,
        channels,
    )
    .map_err(|e| err(e.to_string()))?;
    let delay = resampler.output_delay();

    // de-interleave
    let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames_in); channels];
    for frame in buffer.samples.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }

    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay + RESAMPLE_CHUNK); channels];
    let mut pos = 0usize;
    // keep feeding (zero padding past the end) until the delay line is flushed
    while out[0].len() < delay + expected {
        let block: Vec<Vec<f32>> = planar
            .iter()
            .map(|ch| {
                let mut chunk = vec![0.0f32; RESAMPLE_CHUNK];
                if pos < ch.len() {
                    let end = (pos + RESAMPLE_CHUNK).min(ch.len());
                    chunk[..end - pos].copy_from_slice(&ch[pos..end]);
                }
                chunk
            })
            .collect();
        let produced = resampler.process(&block, None).map_err(|e| err(e.to_string()))?;
        for (dst, src) in out.iter_mut().zip(produced) {
            dst.extend_from_slice(&src);
        }
        pos += RESAMPLE_CHUNK;
    }

    let mut samples = Vec::with_capacity(expected * channels);
    for frame in delay..delay + expected {
        for ch in &out {
            samples.push(ch[frame]);
        }
    }
    Ok(AudioBuffer::new(target, samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(format: AudioFormat, frames: usize) -> AudioBuffer {
        let mut samples = Vec::with_capacity(frames * format.channels as usize);
        for i in 0..frames {
            let v = (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / format.sample_rate as f32).sin() * 0.5;
            for _ in 0..format.channels {
                samples.push(v);
            }
        }
        AudioBuffer::new(format, samples)
    }

    #[test]
    fn test_passthrough_when_formats_match() {
        let buf = tone(AudioFormat::new(24_000, 1), 1_000);
        let out = normalize_buffer(buf.clone(), AudioFormat::new(24_000, 1)).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn test_stereo_downmix_averages() {
        let buf = AudioBuffer::new(AudioFormat::new(8_000, 2), vec![1.0, 0.0, 0.5, 0.5]);
        let out = normalize_buffer(buf, AudioFormat::new(8_000, 1)).unwrap();
        assert_eq!(out.samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_mono_upmix_duplicates() {
        let buf = AudioBuffer::new(AudioFormat::new(8_000, 1), vec![0.1, 0.2]);
        let out = normalize_buffer(buf, AudioFormat::new(8_000, 2)).unwrap();
        assert_eq!(out.samples, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_unmappable_layout_fails() {
        let buf = AudioBuffer::new(AudioFormat::new(8_000, 3), vec![0.0; 6]);
        let err = normalize_buffer(buf, AudioFormat::new(8_000, 2)).unwrap_err();
        assert_eq!(err, FormatNormalizationError::ChannelLayout { from: 3, to: 2 });
    }

    #[test]
    fn test_resample_length_is_exact() {
        let buf = tone(AudioFormat::new(44_100, 1), 44_100);
        let out = normalize_buffer(buf, AudioFormat::new(24_000, 1)).unwrap();
        assert_eq!(out.frames(), 24_000);
        assert!((out.duration_ms() - 1_000.0).abs() < 1e-6);
        assert!(out.peak() > 0.3);
    }

    #[test]
    fn test_resample_is_deterministic() {
        let buf = tone(AudioFormat::new(16_000, 2), 5_000);
        let a = normalize_buffer(buf.clone(), AudioFormat::new(24_000, 2)).unwrap();
        let b = normalize_buffer(buf, AudioFormat::new(24_000, 2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_other_encoding_is_rejected() {
        let raw = RawAudio { encoding: AudioEncoding::Other("audio/mpeg".into()), bytes: vec![1, 2, 3] };
        let err = normalize_raw(&raw, AudioFormat::default()).unwrap_err();
        assert!(matches!(err, FormatNormalizationError::UnsupportedEncoding(_)));
    }

    #[test]
    fn test_pcm16_odd_length_is_rejected() {
        let raw = RawAudio::pcm16(24_000, 1, vec![0, 0, 0]);
        assert!(normalize_raw(&raw, AudioFormat::default()).is_err());
    }
}
