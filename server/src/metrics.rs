// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use narration_core::JobState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Mark the process start for uptime reporting.
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

/// Wall-clock job durations with simple percentile tracking
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    pub count: Arc<AtomicU64>,
    pub total_ms: Arc<AtomicU64>,
    pub max_ms: Arc<AtomicU64>,
    samples: Arc<std::sync::Mutex<Vec<u64>>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            total_ms: Arc::new(AtomicU64::new(0)),
            max_ms: Arc::new(AtomicU64::new(0)),
            samples: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, latency_ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(latency_ms, Ordering::Relaxed);

        // keep the last 1000 samples
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(latency_ms);
            if samples.len() > 1000 {
                samples.remove(0);
            }
        }
    }

    pub fn avg_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn percentile(&self, p: u8) -> u64 {
        if let Ok(samples) = self.samples.lock() {
            if samples.is_empty() {
                return 0;
            }
            let mut sorted = samples.clone();
            sorted.sort_unstable();
            let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
            sorted[index]
        } else {
            0
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Narration pipeline counters
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub jobs_started: Arc<AtomicU64>,
    pub jobs_completed: Arc<AtomicU64>,
    pub jobs_degraded: Arc<AtomicU64>,
    pub jobs_failed: Arc<AtomicU64>,
    pub chunks_streamed: Arc<AtomicU64>,
    pub segments_degraded: Arc<AtomicU64>,
    pub consumer_disconnects: Arc<AtomicU64>,
    pub job_duration: LatencyTracker,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_finished(&self, state: JobState, elapsed_ms: u64) {
        let counter = match state {
            JobState::Completed => &self.jobs_completed,
            JobState::Degraded => &self.jobs_degraded,
            _ => &self.jobs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.job_duration.record(elapsed_ms);
    }

    pub fn jobs_running(&self) -> u64 {
        let finished = self.jobs_completed.load(Ordering::Relaxed)
            + self.jobs_degraded.load(Ordering::Relaxed)
            + self.jobs_failed.load(Ordering::Relaxed);
        self.jobs_started.load(Ordering::Relaxed).saturating_sub(finished)
    }

    pub fn snapshot(&self) -> PipelineMetricsResponse {
        PipelineMetricsResponse {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_running: self.jobs_running(),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_degraded: self.jobs_degraded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            chunks_streamed: self.chunks_streamed.load(Ordering::Relaxed),
            segments_degraded: self.segments_degraded.load(Ordering::Relaxed),
            consumer_disconnects: self.consumer_disconnects.load(Ordering::Relaxed),
            avg_job_duration_ms: self.job_duration.avg_ms(),
            max_job_duration_ms: self.job_duration.max_ms.load(Ordering::Relaxed),
            p50_job_duration_ms: self.job_duration.percentile(50),
            p95_job_duration_ms: self.job_duration.percentile(95),
        }
    }
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub pipeline: PipelineMetricsResponse,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct PipelineMetricsResponse {
    pub jobs_started: u64,
    pub jobs_running: u64,
    pub jobs_completed: u64,
    pub jobs_degraded: u64,
    pub jobs_failed: u64,
    pub chunks_streamed: u64,
    pub segments_degraded: u64,
    pub consumer_disconnects: u64,
    pub avg_job_duration_ms: f64,
    pub max_job_duration_ms: u64,
    pub p50_job_duration_ms: u64,
    pub p95_job_duration_ms: u64,
}

pub fn system_metrics(request_count: u64) -> SystemMetrics {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    // average across all cores
    let cpu_usage = system.global_cpu_info().cpu_usage();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME.get().map(|start| start.elapsed().as_secs()).unwrap_or(0);

    // Unix-like systems only
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|l| l.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        memory_usage_percent,
        request_count,
        uptime_seconds: uptime,
        system_load,
    }
}
