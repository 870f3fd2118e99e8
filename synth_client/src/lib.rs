//! HTTP client for the external speech-synthesis service.

mod cache;
pub mod prompt;

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use narration_core::{AudioEncoding, EmotionalDirective, RawAudio, SpeechSynthesizer, SynthesisError};

pub use cache::ResponseCache;

/// Native output format of the service: 24 kHz mono 16-bit PCM.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Clone)]
pub struct SynthClientConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub request_timeout: Duration,
    pub cache_size: usize,
}

impl SynthClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            voice: "Kore".to_string(),
            request_timeout: Duration::from_secs(90),
            cache_size: 256,
        }
    }

    /// Reads `SYNTH_ENDPOINT` (required), `SYNTH_API_KEY`, `SYNTH_VOICE`,
    /// `SYNTH_REQUEST_TIMEOUT_SECS` and `SYNTH_CACHE_SIZE`.
    pub fn from_env() -> Result<Self> {
        let endpoint = env::var("SYNTH_ENDPOINT").context("SYNTH_ENDPOINT must be set for the http backend")?;
        let defaults = Self::new(endpoint);
        Ok(Self {
            api_key: env::var("SYNTH_API_KEY").ok().filter(|k| !k.is_empty()),
            voice: env::var("SYNTH_VOICE").unwrap_or(defaults.voice.clone()),
            request_timeout: env::var("SYNTH_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            cache_size: env::var("SYNTH_CACHE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cache_size),
            ..defaults
        })
    }
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
    prompt: String,
    directive: &'a EmotionalDirective,
}

pub struct HttpSynthesizer {
    client: Client,
    config: SynthClientConfig,
    cache: Option<ResponseCache>,
}

impl HttpSynthesizer {
    pub fn new(config: SynthClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let cache = ResponseCache::new(config.cache_size);
        Ok(Self { client, config, cache })
    }

    pub fn config(&self) -> &SynthClientConfig {
        &self.config
    }

    pub fn cached_responses(&self) -> usize {
        self.cache.as_ref().map(ResponseCache::len).unwrap_or(0)
    }

    async fn request(&self, text: &str, directive: &EmotionalDirective) -> Result<RawAudio, SynthesisError> {
        let body = SynthesisRequest {
            text,
            voice: &self.config.voice,
            prompt: prompt::build_prompt(text, directive),
            directive,
        };

        let mut req = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(RawAudio {
            encoding: encoding_for(&content_type),
            bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, directive: &EmotionalDirective) -> Result<RawAudio, SynthesisError> {
        let key = ResponseCache::key(&self.config.voice, text, directive);
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!(chars = text.chars().count(), "synthesis cache hit");
            return Ok(hit);
        }

        let audio = self.request(text, directive).await?;
        debug!(chars = text.chars().count(), bytes = audio.bytes.len(), "segment synthesized");
        if let Some(cache) = &self.cache {
            cache.put(key, audio.clone());
        }
        Ok(audio)
    }
}

/// Map an HTTP error status to the synthesis error taxonomy.
pub fn classify_status(status: StatusCode, detail: &str) -> SynthesisError {
    let detail = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS => SynthesisError::RateLimited,
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            SynthesisError::InvalidInput(detail)
        }
        s if s.is_server_error() => SynthesisError::ServiceUnavailable(detail),
        _ => {
            warn!(%status, "unexpected synthesis status");
            SynthesisError::InvalidInput(detail)
        }
    }
}

fn transport_error(e: reqwest::Error) -> SynthesisError {
    if e.is_timeout() {
        SynthesisError::ServiceUnavailable(format!("request timed out: {e}"))
    } else {
        SynthesisError::ServiceUnavailable(e.to_string())
    }
}

/// Encoding of a response body from its `Content-Type`.
///
/// `audio/L16;rate=24000;channels=1` is raw little-endian PCM; rate and
/// channels default to the service's native format.
pub fn encoding_for(content_type: &str) -> AudioEncoding {
    let mut parts = content_type.split(';').map(str::trim);
    let mime = parts.next().unwrap_or_default().to_ascii_lowercase();
    match mime.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => AudioEncoding::Wav,
        "audio/l16" | "audio/pcm" | "application/octet-stream" => {
            let mut sample_rate = DEFAULT_SAMPLE_RATE;
            let mut channels = 1;
            for param in parts {
                match param.split_once('=') {
                    Some(("rate", v)) => sample_rate = v.parse().unwrap_or(sample_rate),
                    Some(("channels", v)) => channels = v.parse().unwrap_or(channels),
                    _ => {}
                }
            }
            AudioEncoding::Pcm16Le { sample_rate, channels }
        }
        _ => AudioEncoding::Other(mime),
    }
}
