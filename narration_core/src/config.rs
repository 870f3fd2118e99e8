use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::assembler::AssemblyConfig;
use crate::bgm::BgmConfig;
use crate::error::PipelineError;
use crate::synthesis::RetryPolicy;

/// Tunables for one pipeline instance. Every field has a default so partial
/// JSON files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Synthesis calls in flight at once.
    pub concurrency: usize,
    /// Outstanding unreleased indices the reordering buffer may hold.
    pub reorder_lookahead: usize,
    pub retry: RetryPolicy,
    pub segment_timeout_ms: u64,
    pub job_timeout_margin_ms: u64,
    /// Overrides the computed whole-job timeout.
    pub job_timeout_ms: Option<u64>,
    pub assembly: AssemblyConfig,
    pub bgm: BgmConfig,
    /// Composite files are written here; `None` disables persistence.
    pub output_dir: Option<PathBuf>,
    pub live_buffer: usize,
    /// A live consumer that takes longer than this to accept one chunk is detached.
    pub live_delivery_timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            reorder_lookahead: 4,
            retry: RetryPolicy::default(),
            segment_timeout_ms: 120_000,
            job_timeout_margin_ms: 30_000,
            job_timeout_ms: None,
            assembly: AssemblyConfig::default(),
            bgm: BgmConfig::default(),
            output_dir: Some(PathBuf::from("output/narrations")),
            live_buffer: 16,
            live_delivery_timeout_ms: 30_000,
            event_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(p.as_ref())
            .with_context(|| format!("Failed to load {}", p.as_ref().display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a valid pipeline config", p.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be at least 1".into()));
        }
        if self.reorder_lookahead == 0 {
            return Err(PipelineError::Config("reorder_lookahead must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.segment_timeout_ms == 0 {
            return Err(PipelineError::Config("segment_timeout_ms must be positive".into()));
        }
        if self.live_delivery_timeout_ms == 0 {
            return Err(PipelineError::Config("live_delivery_timeout_ms must be positive".into()));
        }
        let format = self.assembly.format;
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(PipelineError::Config(format!(
                "invalid target format {} Hz / {} channel(s)",
                format.sample_rate, format.channels
            )));
        }
        Ok(())
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    pub fn live_delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.live_delivery_timeout_ms)
    }

    /// Sum of all segment timeouts plus the margin, unless overridden.
    pub fn job_timeout(&self, segments: usize) -> Duration {
        let ms = self.job_timeout_ms.unwrap_or_else(|| {
            self.segment_timeout_ms
                .saturating_mul(segments as u64)
                .saturating_add(self.job_timeout_margin_ms)
        });
        Duration::from_millis(ms)
    }
}
