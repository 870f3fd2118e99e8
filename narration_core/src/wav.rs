use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};

use crate::audio::{AudioBuffer, AudioFormat};

const I16_MAX_F32: f32 = i16::MAX as f32;

/// Encode interleaved f32 PCM as a 16-bit PCM WAV file in memory.
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: buffer.format.channels,
        sample_rate: buffer.format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // WAV header (44 bytes) + 2 bytes per sample
    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + buffer.samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in &buffer.samples {
            writer.write_sample(to_i16(s))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Same as [`encode_wav`], Base64 encoded for JSON transports.
pub fn encode_wav_base64(buffer: &AudioBuffer) -> Result<String, hound::Error> {
    Ok(general_purpose::STANDARD.encode(encode_wav(buffer)?))
}

/// Clamp and convert f32 [-1.0, 1.0] to i16.
pub(crate) fn to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16
}

/// Decode a WAV container into f32 PCM. Integer formats of 8 to 32 bits and
/// 32-bit float are accepted.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, WavDecodeError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let format = AudioFormat::new(spec.sample_rate, spec.channels);

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, bits @ 1..=32) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        (fmt, bits) => return Err(WavDecodeError::Unsupported(format!("{fmt:?} {bits}-bit"))),
    };

    Ok(AudioBuffer::new(format, samples))
}

/// Decode headerless little-endian 16-bit PCM.
pub fn decode_pcm16(bytes: &[u8], format: AudioFormat) -> AudioBuffer {
    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
        .collect();
    AudioBuffer::new(format, samples)
}

#[derive(Debug, thiserror::Error)]
pub enum WavDecodeError {
    #[error("invalid WAV data: {0}")]
    Hound(#[from] hound::Error),
    #[error("unsupported WAV sample format: {0}")]
    Unsupported(String),
}
