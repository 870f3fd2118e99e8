//! Stitching ordered segment audio into one continuous narration.
//!
//! Every segment is normalized to the job format. Segment 1 gets a fade-in,
//! the last segment a fade-out, and a fixed silence gap follows every segment
//! but the last. [`SegmentAssembler`] does this one segment at a time so the
//! mixer can stream; [`concatenate`] is the batch form and produces the same
//! samples.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::{self, AudioBuffer, AudioFormat, FadeCurve};
use crate::coordinator::SegmentAudio;
use crate::normalize::{normalize_raw, FormatNormalizationError};
use crate::wav;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub format: AudioFormat,
    pub gap_ms: u64,
    pub fade_in_ms: u64,
    pub fade_out_ms: u64,
    pub curve: FadeCurve,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            gap_ms: 800,
            fade_in_ms: 500,
            fade_out_ms: 1_000,
            curve: FadeCurve::Linear,
        }
    }
}

/// One segment's span of the final track: its voice, then its trailing gap.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledSegment {
    pub index: usize,
    pub audio: AudioBuffer,
    pub voice_frames: usize,
    pub gap_frames: usize,
    pub is_last: bool,
}

impl AssembledSegment {
    pub fn duration_ms(&self) -> f64 {
        self.audio.duration_ms()
    }

    pub fn voice_duration_ms(&self) -> f64 {
        self.audio.format.ms_for_frames(self.voice_frames)
    }
}

/// Incremental assembler; segments must be pushed in index order.
#[derive(Debug)]
pub struct SegmentAssembler {
    config: AssemblyConfig,
    total: usize,
    next_index: usize,
}

impl SegmentAssembler {
    pub fn new(config: AssemblyConfig, total: usize) -> Self {
        Self { config, total, next_index: 1 }
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn push(&mut self, audio: &SegmentAudio) -> Result<AssembledSegment, FormatNormalizationError> {
        let format = self.config.format;
        let index = self.next_index;
        let is_first = index == 1;
        let is_last = index >= self.total;

        let mut voice = match audio {
            SegmentAudio::Synthesized(raw) => normalize_raw(raw, format)?,
            SegmentAudio::Placeholder { duration_ms, .. } => AudioBuffer::silence_ms(format, *duration_ms),
        };
        let voice_frames = voice.frames();

        if is_first {
            audio::fade_in(&mut voice, format.frames_for_ms(self.config.fade_in_ms), self.config.curve);
        }
        if is_last {
            audio::fade_out_ending_at(
                &mut voice,
                voice_frames,
                format.frames_for_ms(self.config.fade_out_ms),
                self.config.curve,
            );
        }

        let gap_frames = if is_last { 0 } else { format.frames_for_ms(self.config.gap_ms) };
        voice
            .samples
            .resize(voice.samples.len() + gap_frames * format.channels as usize, 0.0);

        debug!(index, voice_frames, gap_frames, "segment assembled");
        self.next_index += 1;
        Ok(AssembledSegment {
            index,
            audio: voice,
            voice_frames,
            gap_frames,
            is_last,
        })
    }
}

/// Append-only track under construction.
#[derive(Debug)]
pub struct TrackBuilder {
    format: AudioFormat,
    segments: Vec<AudioBuffer>,
    frames: usize,
}

impl TrackBuilder {
    pub fn new(format: AudioFormat) -> Self {
        Self { format, segments: Vec::new(), frames: 0 }
    }

    pub fn push(&mut self, segment: AudioBuffer) {
        debug_assert_eq!(segment.format, self.format);
        self.frames += segment.frames();
        self.segments.push(segment);
    }

    pub fn duration_ms(&self) -> f64 {
        self.format.ms_for_frames(self.frames)
    }

    pub fn seal(self) -> Track {
        Track {
            format: self.format,
            segments: self.segments,
            frames: self.frames,
        }
    }
}

/// Sealed, immutable narration track.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    format: AudioFormat,
    segments: Vec<AudioBuffer>,
    frames: usize,
}

impl Track {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn segments(&self) -> &[AudioBuffer] {
        &self.segments
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn duration_ms(&self) -> f64 {
        self.format.ms_for_frames(self.frames)
    }

    pub fn to_buffer(&self) -> AudioBuffer {
        let mut samples = Vec::with_capacity(self.frames * self.format.channels as usize);
        for seg in &self.segments {
            samples.extend_from_slice(&seg.samples);
        }
        AudioBuffer::new(self.format, samples)
    }

    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, hound::Error> {
        wav::encode_wav(&self.to_buffer())
    }
}

/// Batch assembly of already ordered segment audio.
pub fn concatenate(buffers: &[SegmentAudio], config: &AssemblyConfig) -> Result<Track, FormatNormalizationError> {
    let mut assembler = SegmentAssembler::new(config.clone(), buffers.len());
    let mut track = TrackBuilder::new(config.format);
    for audio in buffers {
        track.push(assembler.push(audio)?.audio);
    }
    Ok(track.seal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RawAudio;
    use crate::coordinator::DegradeReason;

    fn config() -> AssemblyConfig {
        AssemblyConfig {
            format: AudioFormat::new(1_000, 1),
            gap_ms: 100,
            fade_in_ms: 50,
            fade_out_ms: 100,
            curve: FadeCurve::Linear,
        }
    }

    fn constant(ms: u64, value: f32) -> SegmentAudio {
        let buf = AudioBuffer::new(AudioFormat::new(1_000, 1), vec![value; ms as usize]);
        SegmentAudio::Synthesized(RawAudio::wav(wav::encode_wav(&buf).unwrap()))
    }

    #[test]
    fn test_duration_law() {
        let segs = vec![constant(300, 0.5), constant(200, 0.5), constant(400, 0.5)];
        let track = concatenate(&segs, &config()).unwrap();
        assert_eq!(track.frames(), 300 + 200 + 400 + 2 * 100);
        assert!((track.duration_ms() - 1_100.0).abs() < 1e-9);
    }

    #[test]
    fn test_fades_only_at_track_edges() {
        let segs = vec![constant(300, 0.5), constant(300, 0.5)];
        let buf = concatenate(&segs, &config()).unwrap().to_buffer();
        let s = &buf.samples;
        assert_eq!(s[0], 0.0);
        assert!(s[25] < 0.5);
        assert!((s[50] - 0.5).abs() < 1e-3);
        // gap between the segments
        assert!(s[300..400].iter().all(|&v| v == 0.0));
        // second segment starts at full level, ends faded
        assert!((s[400] - 0.5).abs() < 1e-3);
        assert!((s[599] - 0.5).abs() < 1e-3);
        assert!(s[650] < 0.5);
        assert_eq!(*s.last().unwrap(), 0.0);
    }

    #[test]
    fn test_single_segment_gets_both_fades_and_no_gap() {
        let track = concatenate(&[constant(500, 0.5)], &config()).unwrap();
        let buf = track.to_buffer();
        assert_eq!(buf.frames(), 500);
        assert_eq!(buf.samples[0], 0.0);
        assert_eq!(buf.samples[499], 0.0);
        assert!((buf.samples[250] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_placeholder_occupies_estimated_duration() {
        let segs = vec![
            constant(300, 0.5),
            SegmentAudio::Placeholder { duration_ms: 700, reason: DegradeReason::TaskFailed },
            constant(300, 0.5),
        ];
        let track = concatenate(&segs, &config()).unwrap();
        assert_eq!(track.segments()[1].frames(), 700 + 100);
        assert!(track.segments()[1].samples.iter().all(|&v| v == 0.0));
        assert_eq!(track.frames(), 300 + 700 + 300 + 200);
    }

    #[test]
    fn test_concatenate_is_byte_identical_on_repeat() {
        let segs = vec![constant(300, 0.3), constant(250, -0.2), constant(100, 0.9)];
        let a = concatenate(&segs, &config()).unwrap().to_wav_bytes().unwrap();
        let b = concatenate(&segs, &config()).unwrap().to_wav_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unsupported_encoding_fails() {
        let segs = vec![SegmentAudio::Synthesized(RawAudio {
            encoding: crate::audio::AudioEncoding::Other("audio/ogg".into()),
            bytes: vec![0; 16],
        })];
        assert!(matches!(
            concatenate(&segs, &config()),
            Err(FormatNormalizationError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn test_incremental_matches_batch() {
        let segs = vec![constant(120, 0.4), constant(80, 0.1)];
        let mut asm = SegmentAssembler::new(config(), 2);
        let first = asm.push(&segs[0]).unwrap();
        let second = asm.push(&segs[1]).unwrap();
        assert!(!first.is_last && second.is_last);
        assert_eq!(first.gap_frames, 100);
        let batch = concatenate(&segs, &config()).unwrap();
        assert_eq!(batch.segments()[0], first.audio);
        assert_eq!(batch.segments()[1], second.audio);
    }
}
