//! Background-music library access and bed preparation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::{self, db_to_gain, AudioBuffer, AudioEncoding, AudioFormat, FadeCurve, RawAudio};
use crate::normalize::{normalize_raw, FormatNormalizationError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgmAsset {
    pub id: String,
    pub emotion_tags: BTreeSet<String>,
    pub duration_ms: u64,
    /// Where every pass after the first restarts.
    #[serde(default)]
    pub loop_point_ms: u64,
    /// Repository-specific handle; a file name for [`ManifestBgmLibrary`].
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BgmError {
    #[error("failed to load BGM asset {id}: {reason}")]
    Load { id: String, reason: String },
    #[error("BGM asset {id} cannot be normalized: {source}")]
    Normalize {
        id: String,
        #[source]
        source: FormatNormalizationError,
    },
    #[error("BGM asset {0} contains no audio")]
    Empty(String),
}

/// Read-only access to the BGM library; shared by every job.
pub trait BgmRepository: Send + Sync {
    fn assets(&self) -> Vec<BgmAsset>;
    fn load(&self, asset: &BgmAsset) -> Result<RawAudio, BgmError>;
}

/// Fixture library held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBgmLibrary {
    entries: BTreeMap<String, (BgmAsset, RawAudio)>,
}

impl InMemoryBgmLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, asset: BgmAsset, audio: RawAudio) -> Self {
        self.entries.insert(asset.id.clone(), (asset, audio));
        self
    }
}

impl BgmRepository for InMemoryBgmLibrary {
    fn assets(&self) -> Vec<BgmAsset> {
        self.entries.values().map(|(a, _)| a.clone()).collect()
    }

    fn load(&self, asset: &BgmAsset) -> Result<RawAudio, BgmError> {
        self.entries
            .get(&asset.id)
            .map(|(_, audio)| audio.clone())
            .ok_or_else(|| BgmError::Load {
                id: asset.id.clone(),
                reason: "not in library".to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    assets: Vec<BgmAsset>,
}

/// Library described by a `library.json` manifest; sources are paths relative to it.
#[derive(Debug, Clone)]
pub struct ManifestBgmLibrary {
    base_dir: PathBuf,
    assets: Vec<BgmAsset>,
}

impl ManifestBgmLibrary {
    pub fn from_manifest<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(p.as_ref())
            .with_context(|| format!("Failed to load {}", p.as_ref().display()))?;
        let manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a valid BGM manifest", p.as_ref().display()))?;

        let mut seen = BTreeSet::new();
        for asset in &manifest.assets {
            if !seen.insert(asset.id.as_str()) {
                anyhow::bail!("duplicate BGM asset id '{}'", asset.id);
            }
        }

        let base_dir = p
            .as_ref()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self { base_dir, assets: manifest.assets })
    }

    /// A library with no assets; every job runs voice-only.
    pub fn empty() -> Self {
        Self { base_dir: PathBuf::from("."), assets: Vec::new() }
    }
}

impl BgmRepository for ManifestBgmLibrary {
    fn assets(&self) -> Vec<BgmAsset> {
        self.assets.clone()
    }

    fn load(&self, asset: &BgmAsset) -> Result<RawAudio, BgmError> {
        let path = self.base_dir.join(&asset.source);
        let bytes = fs::read(&path).map_err(|e| BgmError::Load {
            id: asset.id.clone(),
            reason: format!("{}: {e}", path.display()),
        })?;
        let encoding = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("wav") => AudioEncoding::Wav,
            Some(ext) => AudioEncoding::Other(ext.to_ascii_lowercase()),
            None => AudioEncoding::Other("unknown".to_string()),
        };
        Ok(RawAudio { encoding, bytes })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BgmConfig {
    pub attenuation_db: f32,
    pub loop_crossfade_ms: u64,
    pub loop_curve: FadeCurve,
    /// Fade applied to the bed under the end of the last segment.
    pub tail_fade_ms: u64,
    pub min_score: f32,
    /// Emotion -> music style; unknown emotions map to `default_style`.
    pub style_aliases: BTreeMap<String, String>,
    pub default_style: String,
}

impl Default for BgmConfig {
    fn default() -> Self {
        let style_aliases = [
            ("anxiety", "calm"),
            ("anger", "gentle"),
            ("sadness", "ambient"),
            ("fear", "soothing"),
            ("confusion", "meditative"),
            ("vulnerability", "ambient"),
        ]
        .into_iter()
        .map(|(e, s)| (e.to_string(), s.to_string()))
        .collect();

        Self {
            attenuation_db: -20.0,
            loop_crossfade_ms: 50,
            loop_curve: FadeCurve::Linear,
            tail_fade_ms: 1_000,
            min_score: 1.0,
            style_aliases,
            default_style: "healing".to_string(),
        }
    }
}

/// Prepared, attenuated music bed for one job.
///
/// `buffer` covers at least the estimated narration length. Past its end the
/// bed keeps repeating the frames `loop_start..loop_start + loop_frames`,
/// which already carry the loop crossfade, so a narration that runs longer
/// than estimated never falls out of the music.
#[derive(Debug, Clone, PartialEq)]
pub struct BgmSlice {
    pub asset_id: String,
    pub score: f32,
    pub buffer: AudioBuffer,
    pub loop_start: usize,
    pub loop_frames: usize,
}

impl BgmSlice {
    /// A slice that repeats `buffer` from its first frame.
    pub fn new(asset_id: impl Into<String>, score: f32, buffer: AudioBuffer) -> Self {
        let loop_frames = buffer.frames();
        Self {
            asset_id: asset_id.into(),
            score,
            buffer,
            loop_start: 0,
            loop_frames,
        }
    }

    /// `frames` frames starting at `offset`, continuing the loop past the
    /// prepared length.
    pub fn window(&self, offset: usize, frames: usize) -> AudioBuffer {
        let channels = self.buffer.format.channels as usize;
        let prepared = self.buffer.frames();
        let mut out = AudioBuffer::silence(self.buffer.format, frames);
        if prepared == 0 {
            return out;
        }

        let direct = prepared.saturating_sub(offset).min(frames);
        if direct > 0 {
            out.samples[..direct * channels]
                .copy_from_slice(&self.buffer.samples[offset * channels..(offset + direct) * channels]);
        }
        if direct == frames || self.loop_frames == 0 || self.loop_start + self.loop_frames > prepared {
            return out;
        }

        for k in direct..frames {
            let pos = offset + k;
            let src = self.loop_start + (pos - self.loop_start) % self.loop_frames;
            out.samples[k * channels..(k + 1) * channels]
                .copy_from_slice(&self.buffer.samples[src * channels..(src + 1) * channels]);
        }
        out
    }

    pub fn duration_ms(&self) -> f64 {
        self.buffer.duration_ms()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoBgmReason {
    EmptyLibrary,
    BelowThreshold { best_score: f32, min_score: f32 },
}

impl std::fmt::Display for NoBgmReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoBgmReason::EmptyLibrary => write!(f, "BGM library is empty"),
            NoBgmReason::BelowThreshold { best_score, min_score } => {
                write!(f, "no BGM asset scored at least {min_score} (best {best_score})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BgmSelection {
    Slice(BgmSlice),
    /// Not an error: the job runs voice-only.
    NoBgm { reason: NoBgmReason },
}

#[derive(Clone)]
pub struct BgmSelector {
    repository: Arc<dyn BgmRepository>,
    config: BgmConfig,
    format: AudioFormat,
}

impl BgmSelector {
    pub fn new(repository: Arc<dyn BgmRepository>, config: BgmConfig, format: AudioFormat) -> Self {
        Self { repository, config, format }
    }

    /// Tag-overlap score: 2 for the emotion itself, 1 for its style alias.
    pub fn score(&self, asset: &BgmAsset, emotion: &str) -> f32 {
        let emotion = emotion.trim().to_lowercase();
        let style = self
            .config
            .style_aliases
            .get(&emotion)
            .unwrap_or(&self.config.default_style)
            .to_lowercase();
        let tags: BTreeSet<String> = asset.emotion_tags.iter().map(|t| t.to_lowercase()).collect();

        let mut score = 0.0;
        if tags.contains(&emotion) {
            score += 2.0;
        }
        if style != emotion && tags.contains(&style) {
            score += 1.0;
        }
        score
    }

    /// Highest scoring asset, ties broken by the lexically smallest id.
    pub fn best_match(&self, emotion: &str) -> Option<(BgmAsset, f32)> {
        let mut best: Option<(BgmAsset, f32)> = None;
        for asset in self.repository.assets() {
            let score = self.score(&asset, emotion);
            let better = match &best {
                None => true,
                Some((b, s)) => score > *s || (score == *s && asset.id < b.id),
            };
            if better {
                best = Some((asset, score));
            }
        }
        best
    }

    pub fn select(&self, emotion: &str, target_ms: u64) -> Result<BgmSelection, BgmError> {
        let Some((asset, score)) = self.best_match(emotion) else {
            info!(emotion, "BGM library is empty, running voice-only");
            return Ok(BgmSelection::NoBgm { reason: NoBgmReason::EmptyLibrary });
        };
        if score < self.config.min_score {
            info!(emotion, best = %asset.id, score, "no BGM asset above threshold, running voice-only");
            return Ok(BgmSelection::NoBgm {
                reason: NoBgmReason::BelowThreshold {
                    best_score: score,
                    min_score: self.config.min_score,
                },
            });
        }

        let raw = self.repository.load(&asset)?;
        let source = normalize_raw(&raw, self.format).map_err(|source| BgmError::Normalize {
            id: asset.id.clone(),
            source,
        })?;
        if source.frames() == 0 {
            return Err(BgmError::Empty(asset.id));
        }

        let target_frames = self.format.frames_for_ms(target_ms);
        let looped = loop_to_length(
            &source,
            self.format.frames_for_ms(asset.loop_point_ms),
            target_frames,
            self.format.frames_for_ms(self.config.loop_crossfade_ms),
            self.config.loop_curve,
        );
        let mut bed = looped.buffer;
        bed.scale(db_to_gain(self.config.attenuation_db));

        debug!(asset = %asset.id, score, target_ms, loop_frames = looped.period, "BGM bed prepared");
        Ok(BgmSelection::Slice(BgmSlice {
            asset_id: asset.id,
            score,
            buffer: bed,
            loop_start: looped.period_start,
            loop_frames: looped.period,
        }))
    }
}

/// A looped bed and the repeating region it settles into.
struct LoopedBed {
    buffer: AudioBuffer,
    period_start: usize,
    period: usize,
}

/// Repeat `source` until `target_frames` frames are covered. The first pass
/// plays the whole asset, later passes restart at `loop_start`, and every
/// boundary is overlap-crossfaded over `crossfade` frames.
///
/// Every pass after the first is identical, so from the first boundary on the
/// bed is periodic. The returned buffer always holds at least one full period.
fn loop_to_length(
    source: &AudioBuffer,
    loop_start: usize,
    target_frames: usize,
    crossfade: usize,
    curve: FadeCurve,
) -> LoopedBed {
    let channels = source.format.channels as usize;
    let total = source.frames();
    let loop_start = if loop_start >= total { 0 } else { loop_start };
    let body = &source.samples[loop_start * channels..];
    let body_frames = total - loop_start;
    let xf = crossfade.min(body_frames / 2).min(total / 2);

    let period_start = total - xf;
    let period = body_frames - xf;
    let length = target_frames.max(period_start + period);

    let mut out = Vec::with_capacity((length + xf).max(total) * channels);
    out.extend_from_slice(&source.samples);

    // run one crossfade past the end so every kept frame is final
    while out.len() / channels < length + xf {
        let start = out.len() / channels - xf;
        for k in 0..xf {
            let t = k as f32 / xf as f32;
            let (g_out, g_in) = (curve.gain(1.0 - t), curve.gain(t));
            for c in 0..channels {
                let i = (start + k) * channels + c;
                out[i] = out[i] * g_out + body[k * channels + c] * g_in;
            }
        }
        out.extend_from_slice(&body[xf * channels..]);
    }

    out.truncate(length * channels);
    LoopedBed {
        buffer: AudioBuffer::new(source.format, out),
        period_start,
        period,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav;

    const FMT: AudioFormat = AudioFormat::new(1_000, 1);

    fn asset(id: &str, tags: &[&str], ms: u64) -> BgmAsset {
        BgmAsset {
            id: id.to_string(),
            emotion_tags: tags.iter().map(|t| t.to_string()).collect(),
            duration_ms: ms,
            loop_point_ms: 0,
            source: format!("{id}.wav"),
        }
    }

    fn constant_wav(ms: usize, value: f32) -> RawAudio {
        RawAudio::wav(wav::encode_wav(&AudioBuffer::new(FMT, vec![value; ms])).unwrap())
    }

    fn selector(lib: InMemoryBgmLibrary) -> BgmSelector {
        let config = BgmConfig { tail_fade_ms: 100, loop_crossfade_ms: 20, ..BgmConfig::default() };
        BgmSelector::new(Arc::new(lib), config, FMT)
    }

    #[test]
    fn test_empty_library_is_no_bgm() {
        let sel = selector(InMemoryBgmLibrary::new());
        assert_eq!(
            sel.select("anxiety", 1_000).unwrap(),
            BgmSelection::NoBgm { reason: NoBgmReason::EmptyLibrary }
        );
    }

    #[test]
    fn test_below_threshold_is_no_bgm() {
        let lib = InMemoryBgmLibrary::new().with_asset(asset("rock", &["energetic"], 500), constant_wav(500, 0.5));
        let sel = selector(lib);
        assert!(matches!(
            sel.select("anxiety", 1_000).unwrap(),
            BgmSelection::NoBgm { reason: NoBgmReason::BelowThreshold { .. } }
        ));
    }

    #[test]
    fn test_scoring_prefers_exact_emotion_then_alias() {
        let lib = InMemoryBgmLibrary::new()
            .with_asset(asset("b_calm", &["calm"], 500), constant_wav(500, 0.5))
            .with_asset(asset("c_anxiety", &["anxiety", "calm"], 500), constant_wav(500, 0.5));
        let sel = selector(lib);
        let (best, score) = sel.best_match("Anxiety").unwrap();
        assert_eq!(best.id, "c_anxiety");
        assert_eq!(score, 3.0);
    }

    #[test]
    fn test_ties_break_on_smallest_id() {
        let lib = InMemoryBgmLibrary::new()
            .with_asset(asset("zeta", &["healing"], 500), constant_wav(500, 0.5))
            .with_asset(asset("alpha", &["healing"], 500), constant_wav(500, 0.5));
        let sel = selector(lib);
        for _ in 0..5 {
            assert_eq!(sel.best_match("unknown mood").unwrap().0.id, "alpha");
        }
    }

    #[test]
    fn test_slice_covers_target_attenuated() {
        let lib = InMemoryBgmLibrary::new().with_asset(asset("calm", &["calm"], 300), constant_wav(300, 0.5));
        let sel = selector(lib);
        let BgmSelection::Slice(slice) = sel.select("anxiety", 1_000).unwrap() else {
            panic!("expected a slice");
        };
        assert_eq!(slice.buffer.frames(), 1_000);
        // -20 dB of 0.5 is 0.05
        assert!((slice.buffer.samples[100] - 0.05).abs() < 1e-3);
        assert!(slice.buffer.peak() <= 0.0501);
        // the tail fade belongs to the mixer
        assert!((slice.buffer.samples[999] - 0.05).abs() < 1e-3);
    }

    #[test]
    fn test_window_past_prepared_length_continues_the_loop() {
        let ramp: Vec<f32> = (0..400).map(|i| i as f32 / 400.0).collect();
        let raw = RawAudio::wav(wav::encode_wav(&AudioBuffer::new(FMT, ramp)).unwrap());
        let mut calm = asset("calm", &["calm"], 400);
        calm.loop_point_ms = 100;
        let sel = selector(InMemoryBgmLibrary::new().with_asset(calm, raw));

        let BgmSelection::Slice(short) = sel.select("anxiety", 1_000).unwrap() else {
            panic!("expected a slice");
        };
        let BgmSelection::Slice(long) = sel.select("anxiety", 3_000).unwrap() else {
            panic!("expected a slice");
        };
        assert_eq!(short.buffer.frames(), 1_000);

        let past = short.window(900, 1_500);
        assert_eq!(past.samples, long.buffer.samples[900..2_400]);
        assert!(past.samples.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_loop_crossfade_keeps_level_for_constant_source() {
        let src = AudioBuffer::new(FMT, vec![1.0; 100]);
        let bed = loop_to_length(&src, 0, 350, 10, FadeCurve::Linear);
        assert_eq!(bed.buffer.frames(), 350);
        assert_eq!((bed.period_start, bed.period), (90, 90));
        assert!(bed.buffer.samples.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_loop_restarts_at_loop_point() {
        // first 50 frames are an intro at 0.2, loop body at 0.8
        let mut samples = vec![0.2; 50];
        samples.extend(vec![0.8; 50]);
        let bed = loop_to_length(&AudioBuffer::new(FMT, samples), 50, 300, 0, FadeCurve::Linear);
        assert!(bed.buffer.samples[..50].iter().all(|&v| v == 0.2));
        assert!(bed.buffer.samples[50..].iter().all(|&v| v == 0.8));
        assert_eq!((bed.period_start, bed.period), (100, 50));
    }

    #[test]
    fn test_short_target_still_holds_one_period() {
        let bed = loop_to_length(&AudioBuffer::new(FMT, vec![0.3; 100]), 0, 20, 10, FadeCurve::Linear);
        assert_eq!(bed.buffer.frames(), 180);
    }

    #[test]
    fn test_window_wraps_past_the_buffer() {
        let slice = BgmSlice::new("a", 1.0, AudioBuffer::new(FMT, (0..100).map(|i| i as f32).collect()));
        let w = slice.window(80, 40);
        assert_eq!(w.frames(), 40);
        assert_eq!(w.samples[..20], (80..100).map(|i| i as f32).collect::<Vec<_>>()[..]);
        assert_eq!(w.samples[20..], (0..20).map(|i| i as f32).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_manifest_library_loads_wav_sources() {
        let dir = tempfile::tempdir().unwrap();
        let wav_bytes = wav::encode_wav(&AudioBuffer::new(FMT, vec![0.5; 200])).unwrap();
        std::fs::write(dir.path().join("calm.wav"), wav_bytes).unwrap();
        std::fs::write(
            dir.path().join("library.json"),
            r#"{"assets":[{"id":"calm","emotion_tags":["calm"],"duration_ms":200,"source":"calm.wav"}]}"#,
        )
        .unwrap();

        let lib = ManifestBgmLibrary::from_manifest(dir.path().join("library.json")).unwrap();
        assert_eq!(lib.assets().len(), 1);
        let sel = BgmSelector::new(Arc::new(lib), BgmConfig::default(), FMT);
        assert!(matches!(sel.select("anxiety", 500).unwrap(), BgmSelection::Slice(_)));
    }

    #[test]
    fn test_manifest_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(
            &path,
            r#"{"assets":[{"id":"a","emotion_tags":[],"duration_ms":1,"source":"a.wav"},
                          {"id":"a","emotion_tags":[],"duration_ms":1,"source":"b.wav"}]}"#,
        )
        .unwrap();
        assert!(ManifestBgmLibrary::from_manifest(&path).is_err());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let lib = ManifestBgmLibrary {
            base_dir: PathBuf::from("/nonexistent"),
            assets: vec![asset("calm", &["calm"], 100)],
        };
        let sel = BgmSelector::new(Arc::new(lib), BgmConfig::default(), FMT);
        assert!(matches!(sel.select("anxiety", 500), Err(BgmError::Load { .. })));
    }
}
