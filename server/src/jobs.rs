// Registry of narration jobs started by this process

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use narration_core::{CancelHandle, FailureReason, JobHandle, JobId, JobOutcome, JobState, PipelineEvent};

use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub emotion: String,
    pub total_segments: usize,
    pub chunks_emitted: usize,
    pub bgm_asset: Option<String>,
    pub total_duration_ms: Option<f64>,
    pub outcome: Option<JobOutcome>,
    /// Set when the job failed outside the pipeline (task panic).
    pub error: Option<String>,
    #[serde(skip)]
    pub artifact: Option<PathBuf>,
    #[serde(skip)]
    pub partial_artifact: Option<PathBuf>,
    pub audio_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    fn new(job_id: JobId, emotion: String, total_segments: usize) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            state: JobState::Synthesizing,
            emotion,
            total_segments,
            chunks_emitted: 0,
            bgm_asset: None,
            total_duration_ms: None,
            outcome: None,
            error: None,
            artifact: None,
            partial_artifact: None,
            audio_available: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The persisted file to serve, preferring the complete artifact.
    pub fn audio_path(&self) -> Option<(&PathBuf, bool)> {
        match (&self.artifact, &self.partial_artifact) {
            (Some(path), _) => Some((path, false)),
            (None, Some(path)) => Some((path, true)),
            (None, None) => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.error.is_some()
    }
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    Requested,
    AlreadyFinished,
    Unknown,
}

pub const DEFAULT_MAX_RETAINED_JOBS: usize = 1_000;

#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<DashMap<JobId, JobStatus>>,
    cancels: Arc<DashMap<JobId, CancelHandle>>,
    max_retained: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED_JOBS)
    }
}

impl JobRegistry {
    /// Finished jobs beyond `max_retained` are forgotten, oldest first.
    /// Running jobs are never evicted.
    pub fn new(max_retained: usize) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            cancels: Arc::new(DashMap::new()),
            max_retained: max_retained.max(1),
        }
    }

    pub fn get(&self, job_id: &JobId) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn cancel(&self, job_id: &JobId) -> CancelRequest {
        if let Some(handle) = self.cancels.get(job_id) {
            info!(%job_id, "Cancellation requested");
            handle.cancel();
            return CancelRequest::Requested;
        }
        if self.jobs.contains_key(job_id) {
            CancelRequest::AlreadyFinished
        } else {
            CancelRequest::Unknown
        }
    }

    /// Register a started job and follow it to its terminal state.
    ///
    /// Progress comes from the job's events; the final state always comes
    /// from the job report. The returned receiver yields the final status.
    pub fn track(
        &self,
        mut handle: JobHandle,
        emotion: String,
        total_segments: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> oneshot::Receiver<JobStatus> {
        let job_id = handle.job_id();
        self.jobs
            .insert(job_id, JobStatus::new(job_id, emotion, total_segments));
        self.cancels.insert(job_id, handle.cancel_handle());
        metrics.jobs_started.fetch_add(1, Ordering::Relaxed);

        let (done_tx, done_rx) = oneshot::channel();
        let registry = self.clone();
        let jobs = Arc::clone(&self.jobs);
        let mut events = handle.take_events();
        let started = Instant::now();
        tokio::spawn(async move {
            let join = handle.join();
            tokio::pin!(join);
            let result = loop {
                tokio::select! {
                    biased;
                    received = events.recv() => match received {
                        Ok(event) => apply_event(&jobs, job_id, &event.event, &metrics),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(%job_id, skipped, "Job registry lagged behind job events");
                        }
                        // closed: only the report is left to wait for
                        Err(RecvError::Closed) => break (&mut join).await,
                    },
                    result = &mut join => break result,
                }
            };
            loop {
                match events.try_recv() {
                    Ok(event) => apply_event(&jobs, job_id, &event.event, &metrics),
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            registry.cancels.remove(&job_id);

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(report) => {
                    let state = report.outcome.state();
                    info!(%job_id, ?state, elapsed_ms, "Job finished");
                    metrics.record_finished(state, elapsed_ms);
                    if let Some(mut status) = jobs.get_mut(&job_id) {
                        status.state = state;
                        status.chunks_emitted = report.chunks_emitted;
                        status.bgm_asset = report.bgm_asset;
                        status.total_duration_ms = Some(report.total_duration_ms);
                        status.outcome = Some(report.outcome);
                        status.audio_available =
                            report.artifact.is_some() || report.partial_artifact.is_some();
                        status.artifact = report.artifact;
                        status.partial_artifact = report.partial_artifact;
                        status.updated_at = Utc::now();
                    }
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "Job task did not complete");
                    metrics.record_finished(JobState::Failed, elapsed_ms);
                    if let Some(mut status) = jobs.get_mut(&job_id) {
                        status.state = JobState::Failed;
                        status.error = Some(e.to_string());
                        status.updated_at = Utc::now();
                    }
                }
            }

            let finished = registry.get(&job_id);
            registry.evict_finished();
            if let Some(status) = finished {
                // nobody may be waiting
                let _ = done_tx.send(status);
            }
        });
        done_rx
    }

    fn evict_finished(&self) {
        let excess = self.jobs.len().saturating_sub(self.max_retained);
        if excess == 0 {
            return;
        }
        let mut finished: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().is_finished())
            .map(|entry| (entry.value().updated_at, *entry.key()))
            .collect();
        finished.sort();
        for (_, job_id) in finished.into_iter().take(excess) {
            self.jobs.remove(&job_id);
            debug!(%job_id, "Evicted finished job");
        }
    }
}

fn apply_event(
    jobs: &DashMap<JobId, JobStatus>,
    job_id: JobId,
    event: &PipelineEvent,
    metrics: &PipelineMetrics,
) {
    match event {
        PipelineEvent::ChunkEmitted { .. } => {
            metrics.chunks_streamed.fetch_add(1, Ordering::Relaxed);
        }
        PipelineEvent::SegmentDegraded { .. } => {
            metrics.segments_degraded.fetch_add(1, Ordering::Relaxed);
        }
        PipelineEvent::ConsumerDisconnected { .. } => {
            metrics.consumer_disconnects.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }

    let Some(mut status) = jobs.get_mut(&job_id) else {
        return;
    };
    match event {
        // terminal state is taken from the report once the task is joined
        PipelineEvent::StateChanged { state } if !state.is_terminal() => status.state = *state,
        PipelineEvent::ChunkEmitted { .. } => status.chunks_emitted += 1,
        PipelineEvent::BgmSelected { asset_id, .. } => status.bgm_asset = Some(asset_id.clone()),
        _ => return,
    }
    status.updated_at = Utc::now();
}

/// Human readable summary of a terminal outcome for WebSocket clients.
pub fn outcome_message(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Completed { warnings } if warnings.is_empty() => "completed".to_string(),
        JobOutcome::Completed { warnings } => format!("completed ({})", warnings.join("; ")),
        JobOutcome::Degraded { segments, warnings } => {
            let mut parts: Vec<String> = segments
                .iter()
                .map(|s| format!("segment {} {}", s.index, s.reason))
                .collect();
            parts.extend(warnings.iter().cloned());
            format!("degraded ({})", parts.join("; "))
        }
        JobOutcome::Failed { reason } => match reason {
            FailureReason::Cancelled => "cancelled".to_string(),
            other => format!("failed ({other})"),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use narration_core::{
        EmotionalDirective, InMemoryBgmLibrary, JobRequest, NullSink, Pipeline, PipelineConfig, RawAudio,
        SegmentPlan, SegmentSpec, SilentSynthesizer, SpeechSynthesizer, SynthesisError,
    };

    use super::*;

    fn plan(n: usize) -> SegmentPlan {
        let specs = (1..=n)
            .map(|index| SegmentSpec {
                index,
                text: "rest".to_string(),
                directive: EmotionalDirective::default(),
                estimated_duration_ms: 40,
            })
            .collect();
        SegmentPlan::new(specs).unwrap()
    }

    fn pipeline(synth: impl SpeechSynthesizer + 'static) -> Pipeline {
        let config = PipelineConfig {
            output_dir: None,
            ..PipelineConfig::default()
        };
        Pipeline::new(Arc::new(synth), Arc::new(InMemoryBgmLibrary::new()), config).unwrap()
    }

    fn quick() -> SilentSynthesizer {
        SilentSynthesizer {
            ms_per_char: 10,
            ..SilentSynthesizer::default()
        }
    }

    /// Takes a while per segment so jobs stay running.
    struct Sluggish(SilentSynthesizer);

    #[async_trait]
    impl SpeechSynthesizer for Sluggish {
        async fn synthesize(&self, text: &str, directive: &EmotionalDirective) -> Result<RawAudio, SynthesisError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.0.synthesize(text, directive).await
        }
    }

    #[tokio::test]
    async fn test_tracked_job_reaches_terminal_state() {
        let pipeline = pipeline(quick());
        let registry = JobRegistry::default();
        let metrics = Arc::new(PipelineMetrics::new());
        let handle = pipeline.start(JobRequest::new(plan(3), "calm"), NullSink);
        let job_id = handle.job_id();
        let done = registry.track(handle, "calm".to_string(), 3, metrics.clone());

        let status = registry.get(&job_id).unwrap();
        assert_eq!(status.total_segments, 3);

        let status = tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.chunks_emitted, 3);
        assert!(!status.audio_available);
        assert_eq!(registry.get(&job_id).unwrap().state, JobState::Completed);
        assert_eq!(metrics.jobs_completed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.jobs_running(), 0);
        // every event since the job started was seen
        assert_eq!(metrics.chunks_streamed.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_finished_jobs_beyond_cap_are_evicted() {
        let pipeline = pipeline(quick());
        let registry = JobRegistry::new(2);
        let metrics = Arc::new(PipelineMetrics::new());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let handle = pipeline.start(JobRequest::new(plan(1), "calm"), NullSink);
            ids.push(handle.job_id());
            let done = registry.track(handle, "calm".to_string(), 1, metrics.clone());
            tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        }

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&ids[0]).is_none());
        assert!(registry.get(&ids[1]).is_some());
        assert!(registry.get(&ids[2]).is_some());
    }

    #[tokio::test]
    async fn test_running_jobs_are_not_evicted() {
        let registry = JobRegistry::new(1);
        let metrics = Arc::new(PipelineMetrics::new());
        let slow = pipeline(Sluggish(quick()));
        let running = slow.start(JobRequest::new(plan(3), "calm"), NullSink);
        let running_id = running.job_id();
        let _ = registry.track(running, "calm".to_string(), 3, metrics.clone());

        let fast = pipeline(quick());
        let handle = fast.start(JobRequest::new(plan(1), "calm"), NullSink);
        let done = registry.track(handle, "calm".to_string(), 1, metrics.clone());
        let finished = tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();

        assert!(registry.get(&running_id).is_some());
        assert!(registry.get(&finished.job_id).is_none());
        assert_eq!(registry.cancel(&running_id), CancelRequest::Requested);
    }

    #[tokio::test]
    async fn test_cancel_fails_running_job() {
        let pipeline = pipeline(Sluggish(quick()));
        let registry = JobRegistry::default();
        let metrics = Arc::new(PipelineMetrics::new());
        let handle = pipeline.start(JobRequest::new(plan(4), "calm"), NullSink);
        let job_id = handle.job_id();
        let done = registry.track(handle, "calm".to_string(), 4, metrics.clone());

        assert_eq!(registry.cancel(&job_id), CancelRequest::Requested);
        let status = tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(
            status.outcome,
            Some(JobOutcome::Failed {
                reason: FailureReason::Cancelled
            })
        );
        assert_eq!(metrics.jobs_failed.load(Ordering::Relaxed), 1);

        assert_eq!(registry.cancel(&job_id), CancelRequest::AlreadyFinished);
        assert_eq!(registry.cancel(&JobId::new()), CancelRequest::Unknown);
    }

    #[test]
    fn test_outcome_message() {
        assert_eq!(outcome_message(&JobOutcome::Completed { warnings: vec![] }), "completed");
        let cancelled = JobOutcome::Failed {
            reason: FailureReason::Cancelled,
        };
        assert_eq!(outcome_message(&cancelled), "cancelled");
    }
}
