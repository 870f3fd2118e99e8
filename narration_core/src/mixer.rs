//! Per-segment voice/BGM mixing.
//!
//! The mixer keeps a cursor of elapsed track frames. Segment *i* is mixed
//! against the bed window that starts at the cursor value before *i* began,
//! so the music position follows the narration position monotonically.

use serde::Serialize;
use tracing::debug;

use crate::assembler::AssembledSegment;
use crate::audio::{self, AudioBuffer, AudioFormat, FadeCurve};
use crate::bgm::BgmSlice;
use crate::wav;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixPlanEntry {
    pub segment_index: usize,
    pub bgm_offset_ms: f64,
    /// Length of the bed window used, equal to the segment span.
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MixPlan {
    pub entries: Vec<MixPlanEntry>,
}

impl MixPlan {
    pub fn offset_ms(&self, segment_index: usize) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.segment_index == segment_index)
            .map(|e| e.bgm_offset_ms)
    }
}

/// Audio ready for delivery; exactly one per segment index.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub segment_index: usize,
    pub audio: AudioBuffer,
    pub has_bgm: bool,
    pub is_final: bool,
}

impl StreamChunk {
    pub fn duration_ms(&self) -> f64 {
        self.audio.duration_ms()
    }

    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, hound::Error> {
        wav::encode_wav(&self.audio)
    }
}

#[derive(Debug)]
pub struct StreamingMixer {
    format: AudioFormat,
    bed: Option<BgmSlice>,
    final_fade_frames: usize,
    curve: FadeCurve,
    cursor: usize,
    plan: MixPlan,
}

impl StreamingMixer {
    /// `final_fade_ms` fades the bed under the last segment so the track ends
    /// silent, wherever the narration actually ends.
    pub fn new(format: AudioFormat, bed: Option<BgmSlice>, final_fade_ms: u64, curve: FadeCurve) -> Self {
        Self {
            format,
            bed,
            final_fade_frames: format.frames_for_ms(final_fade_ms),
            curve,
            cursor: 0,
            plan: MixPlan::default(),
        }
    }

    pub fn voice_only(format: AudioFormat) -> Self {
        Self::new(format, None, 0, FadeCurve::Linear)
    }

    pub fn has_bgm(&self) -> bool {
        self.bed.is_some()
    }

    pub fn cursor_ms(&self) -> f64 {
        self.format.ms_for_frames(self.cursor)
    }

    pub fn plan(&self) -> &MixPlan {
        &self.plan
    }

    pub fn into_plan(self) -> MixPlan {
        self.plan
    }

    pub fn mix(&mut self, segment: AssembledSegment) -> StreamChunk {
        let frames = segment.audio.frames();
        let offset = self.cursor;
        let mut voice = segment.audio;

        if let Some(bed) = &self.bed {
            let mut window = bed.window(offset, frames);
            if segment.is_last {
                audio::fade_out_ending_at(&mut window, frames, self.final_fade_frames, self.curve);
            }
            for (v, b) in voice.samples.iter_mut().zip(&window.samples) {
                *v = (*v + *b).clamp(-1.0, 1.0);
            }
            self.plan.entries.push(MixPlanEntry {
                segment_index: segment.index,
                bgm_offset_ms: self.format.ms_for_frames(offset),
                duration_ms: window.duration_ms(),
            });
        }

        self.cursor += frames;
        debug!(
            index = segment.index,
            offset_ms = self.format.ms_for_frames(offset),
            frames,
            has_bgm = self.bed.is_some(),
            "segment mixed"
        );

        StreamChunk {
            segment_index: segment.index,
            audio: voice,
            has_bgm: self.bed.is_some(),
            is_final: segment.is_last,
        }
    }
}
