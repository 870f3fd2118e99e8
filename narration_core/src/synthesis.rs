//! The seam to the external speech-synthesis collaborator, and the retry
//! policy the coordinator applies to it.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::audio::{AudioBuffer, AudioFormat, RawAudio};
use crate::segment::EmotionalDirective;
use crate::wav;

/// Errors reported by a synthesizer for one call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("rate limited by synthesis service")]
    RateLimited,
    #[error("synthesis service rejected input: {0}")]
    InvalidInput(String),
    #[error("synthesis service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("synthesis call timed out")]
    Timeout,
}

impl SynthesisError {
    pub fn kind(&self) -> SynthesisErrorKind {
        match self {
            SynthesisError::RateLimited => SynthesisErrorKind::RateLimited,
            SynthesisError::InvalidInput(_) => SynthesisErrorKind::InvalidInput,
            SynthesisError::ServiceUnavailable(_) => SynthesisErrorKind::ServiceUnavailable,
            SynthesisError::Timeout => SynthesisErrorKind::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisErrorKind {
    RateLimited,
    InvalidInput,
    ServiceUnavailable,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Decides which synthesis errors are worth retrying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassifier {
    pub transient: Vec<SynthesisErrorKind>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            transient: vec![
                SynthesisErrorKind::RateLimited,
                SynthesisErrorKind::ServiceUnavailable,
                SynthesisErrorKind::Timeout,
            ],
        }
    }
}

impl ErrorClassifier {
    pub fn classify(&self, error: &SynthesisError) -> ErrorClass {
        if self.transient.contains(&error.kind()) {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

/// Exponential backoff with jitter, applied per segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per segment, the first call included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_delay_ms: u64,
    pub classifier: ErrorClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            jitter_ms: 500,
            max_delay_ms: 30_000,
            classifier: ErrorClassifier::default(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1 = the wait after the first failure).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exp.min(self.max_delay_ms).saturating_add(jitter))
    }
}

/// The external speech-synthesis collaborator.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        directive: &EmotionalDirective,
    ) -> Result<RawAudio, SynthesisError>;
}

/// Offline synthesizer producing a quiet tone whose length follows the text
/// length. Lets the service run without the external collaborator.
#[derive(Debug, Clone)]
pub struct SilentSynthesizer {
    pub format: AudioFormat,
    pub ms_per_char: u64,
    pub amplitude: f32,
}

impl Default for SilentSynthesizer {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            ms_per_char: 60,
            amplitude: 0.0,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for SilentSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _directive: &EmotionalDirective,
    ) -> Result<RawAudio, SynthesisError> {
        let ms = (text.chars().count() as u64 * self.ms_per_char).max(1);
        let mut buffer = AudioBuffer::silence_ms(self.format, ms);
        if self.amplitude > 0.0 {
            let rate = self.format.sample_rate as f32;
            let channels = self.format.channels as usize;
            for (i, frame) in buffer.samples.chunks_exact_mut(channels).enumerate() {
                let v = (i as f32 * 220.0 * std::f32::consts::TAU / rate).sin() * self.amplitude;
                frame.fill(v);
            }
        }
        let bytes = wav::encode_wav(&buffer).map_err(|e| SynthesisError::ServiceUnavailable(e.to_string()))?;
        Ok(RawAudio::wav(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classifier() {
        let c = ErrorClassifier::default();
        assert_eq!(c.classify(&SynthesisError::RateLimited), ErrorClass::Transient);
        assert_eq!(c.classify(&SynthesisError::Timeout), ErrorClass::Transient);
        assert_eq!(
            c.classify(&SynthesisError::ServiceUnavailable("503".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            c.classify(&SynthesisError::InvalidInput("too long".into())),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_classifier_is_configurable() {
        let c = ErrorClassifier { transient: vec![SynthesisErrorKind::InvalidInput] };
        assert_eq!(c.classify(&SynthesisError::RateLimited), ErrorClass::Permanent);
        assert_eq!(c.classify(&SynthesisError::InvalidInput(String::new())), ErrorClass::Transient);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            jitter_ms: 0,
            max_delay_ms: 350,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = RetryPolicy { base_delay_ms: 10, jitter_ms: 5, ..RetryPolicy::default() };
        for _ in 0..50 {
            let d = policy.backoff(1).as_millis();
            assert!((10..=15).contains(&d));
        }
    }

    #[tokio::test]
    async fn test_silent_synthesizer_duration_follows_text() {
        let synth = SilentSynthesizer::default();
        let raw = synth.synthesize("abcdefghij", &EmotionalDirective::default()).await.unwrap();
        let buf = wav::decode_wav(&raw.bytes).unwrap();
        assert!((buf.duration_ms() - 600.0).abs() < 1.0);
    }
}
