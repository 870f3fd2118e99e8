// Configuration for the server, read from the environment

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthBackend {
    /// Duration-accurate placeholder audio, no external service needed.
    Silent,
    Http,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub synth_backend: SynthBackend,
    pub bgm_manifest: PathBuf,
    pub output_dir: PathBuf,
    pub pipeline_config: Option<PathBuf>,
    /// How long a WebSocket client may take to send its job request.
    pub ws_request_timeout_secs: u64,
    /// Finished jobs kept for status and audio lookups.
    pub max_retained_jobs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            synth_backend: SynthBackend::Silent,
            bgm_manifest: PathBuf::from("assets/bgm/library.json"),
            output_dir: PathBuf::from("output/narrations"),
            pipeline_config: None,
            ws_request_timeout_secs: 30,
            max_retained_jobs: 1_000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);

        let rate_limit_per_minute = std::env::var("RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rate_limit_per_minute);

        let request_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.request_timeout_secs);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| origins.split(',').map(|s| s.trim().to_string()).collect());

        let synth_backend = match std::env::var("SYNTH_BACKEND").as_deref() {
            Ok("http") => SynthBackend::Http,
            _ => SynthBackend::Silent,
        };

        let bgm_manifest = std::env::var("BGM_LIBRARY")
            .map(PathBuf::from)
            .unwrap_or(defaults.bgm_manifest);

        let output_dir = std::env::var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        let pipeline_config = std::env::var("PIPELINE_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let ws_request_timeout_secs = std::env::var("WS_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.ws_request_timeout_secs);

        let max_retained_jobs = std::env::var("MAX_RETAINED_JOBS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retained_jobs);

        Self {
            port,
            rate_limit_per_minute,
            request_timeout_secs,
            cors_allowed_origins,
            synth_backend,
            bgm_manifest,
            output_dir,
            pipeline_config,
            ws_request_timeout_secs,
            max_retained_jobs,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ws_request_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_request_timeout_secs)
    }
}
