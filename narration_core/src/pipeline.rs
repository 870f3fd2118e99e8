//! Job orchestration: wires the coordinator, assembler, BGM selector, mixer
//! and emitter together and drives the job state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::assembler::SegmentAssembler;
use crate::bgm::{BgmRepository, BgmSelection, BgmSelector};
use crate::config::PipelineConfig;
use crate::coordinator::{DegradeReason, SegmentAudio, SynthesisCoordinator};
use crate::emitter::{CompositeWriter, LiveSink, OutputEmitter};
use crate::error::PipelineError;
use crate::events::{cancel_pair, CancelHandle, CancelSignal, EventPublisher, JobEvent, PipelineEvent};
use crate::mixer::{MixPlan, StreamingMixer};
use crate::segment::SegmentPlan;
use crate::synthesis::SpeechSynthesizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Synthesizing,
    Mixing,
    Streaming,
    Completed,
    Degraded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Degraded | JobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedSegment {
    pub index: usize,
    pub reason: DegradeReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    Timeout { after_ms: u64 },
    Format { index: usize, error: String },
    /// Synthesis stopped delivering before the last segment.
    Interrupted { next_index: usize },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Cancelled => write!(f, "job cancelled"),
            FailureReason::Timeout { after_ms } => write!(f, "job timed out after {after_ms} ms"),
            FailureReason::Format { index, error } => write!(f, "segment {index} could not be normalized: {error}"),
            FailureReason::Interrupted { next_index } => {
                write!(f, "synthesis stopped before segment {next_index}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// `warnings` are informational (e.g. no matching BGM).
    Completed { warnings: Vec<String> },
    Degraded { segments: Vec<DegradedSegment>, warnings: Vec<String> },
    Failed { reason: FailureReason },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed { .. } => JobState::Completed,
            JobOutcome::Degraded { .. } => JobState::Degraded,
            JobOutcome::Failed { .. } => JobState::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: JobId,
    pub plan: SegmentPlan,
    /// Emotion tag driving BGM selection.
    pub emotion: String,
}

impl JobRequest {
    pub fn new(plan: SegmentPlan, emotion: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            plan,
            emotion: emotion.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub total_duration_ms: f64,
    pub segment_durations_ms: Vec<f64>,
    pub mix_plan: MixPlan,
    pub bgm_asset: Option<String>,
    pub chunks_emitted: usize,
    pub chunks_delivered_live: usize,
    /// Synthesis attempts per segment, in index order.
    pub attempts: Vec<u32>,
    pub artifact: Option<PathBuf>,
    pub partial_artifact: Option<PathBuf>,
}

/// A running job.
pub struct JobHandle {
    job_id: JobId,
    events: EventPublisher,
    first_subscriber: Option<broadcast::Receiver<JobEvent>>,
    cancel: CancelHandle,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Receiver subscribed before the job started, so no event is missed.
    /// Later calls get a fresh subscription.
    pub fn take_events(&mut self) -> broadcast::Receiver<JobEvent> {
        self.first_subscriber
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop issuing synthesis requests; the job ends `Failed`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can cancel the job after `join` consumed this one.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<JobReport, PipelineError> {
        Ok(self.task.await?)
    }
}

#[derive(Clone)]
pub struct Pipeline {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    bgm: Arc<dyn BgmRepository>,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        bgm: Arc<dyn BgmRepository>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            synthesizer,
            bgm,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn bgm_library(&self) -> &Arc<dyn BgmRepository> {
        &self.bgm
    }

    /// Spawn the job and return immediately.
    pub fn start<S: LiveSink + 'static>(&self, request: JobRequest, live: S) -> JobHandle {
        let job_id = request.job_id;
        let events = EventPublisher::new(job_id, self.config.event_capacity);
        let first_subscriber = Some(events.subscribe());
        let (cancel, signal) = cancel_pair();

        let this = self.clone();
        let job_events = events.clone();
        let task = tokio::spawn(
            async move { this.execute(request, Box::new(live), job_events, signal).await }
                .instrument(info_span!("narration_job", %job_id)),
        );

        JobHandle {
            job_id,
            events,
            first_subscriber,
            cancel,
            task,
        }
    }

    /// Run the job to completion on the current task.
    pub async fn run<S: LiveSink + 'static>(&self, request: JobRequest, live: S) -> JobReport {
        let job_id = request.job_id;
        let events = EventPublisher::new(job_id, self.config.event_capacity);
        self.execute(request, Box::new(live), events, CancelSignal::never())
            .instrument(info_span!("narration_job", %job_id))
            .await
    }

    async fn execute(
        &self,
        request: JobRequest,
        live: Box<dyn LiveSink>,
        events: EventPublisher,
        mut cancel: CancelSignal,
    ) -> JobReport {
        let JobRequest { job_id, plan, emotion } = request;
        let config = Arc::clone(&self.config);
        let format = config.assembly.format;
        let total = plan.len();
        info!(%job_id, segments = total, %emotion, "narration job started");
        events.publish(PipelineEvent::StateChanged { state: JobState::Synthesizing });

        let coordinator = SynthesisCoordinator::new(
            Arc::clone(&self.synthesizer),
            config.retry.clone(),
            config.concurrency,
            config.reorder_lookahead,
            config.segment_timeout(),
        );
        let mut outcomes = coordinator.submit(&plan, events.clone(), cancel.clone());

        // BGM preparation overlaps synthesis
        let selector = BgmSelector::new(Arc::clone(&self.bgm), config.bgm.clone(), format);
        let target_ms = plan.estimated_total_ms(config.assembly.gap_ms);
        let bgm_emotion = emotion.clone();
        let bgm_task = tokio::task::spawn_blocking(move || selector.select(&bgm_emotion, target_ms));

        let job_timeout = config.job_timeout(total);
        let timed_out = FailureReason::Timeout { after_ms: job_timeout.as_millis() as u64 };
        let deadline = tokio::time::sleep(job_timeout);
        tokio::pin!(deadline);

        let writer = config
            .output_dir
            .as_ref()
            .map(|dir| CompositeWriter::new(dir, job_id, format));
        let mut emitter =
            OutputEmitter::new(live, writer, events.clone()).with_delivery_timeout(config.live_delivery_timeout());

        let mut warnings = Vec::new();
        let mut bgm_fallback = false;
        let mut bgm_asset = None;
        let mut degraded = Vec::new();
        let mut attempts = Vec::with_capacity(total);
        let mut segment_durations_ms = Vec::with_capacity(total);
        let mut mixer = StreamingMixer::voice_only(format);

        let selection = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FailureReason::Cancelled),
            _ = &mut deadline => Err(timed_out.clone()),
            joined = bgm_task => Ok(joined),
        };

        let mut failure = None;
        match selection {
            Err(reason) => failure = Some(reason),
            Ok(Ok(Ok(BgmSelection::Slice(slice)))) => {
                info!(asset = %slice.asset_id, score = slice.score, "BGM selected");
                events.publish(PipelineEvent::BgmSelected {
                    asset_id: slice.asset_id.clone(),
                    score: slice.score,
                });
                bgm_asset = Some(slice.asset_id.clone());
                mixer = StreamingMixer::new(format, Some(slice), config.bgm.tail_fade_ms, config.assembly.curve);
            }
            Ok(Ok(Ok(BgmSelection::NoBgm { reason }))) => {
                events.publish(PipelineEvent::BgmUnavailable { reason: reason.to_string() });
                warnings.push(reason.to_string());
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "BGM selection failed, falling back to voice-only");
                events.publish(PipelineEvent::BgmUnavailable { reason: e.to_string() });
                warnings.push(format!("BGM fallback: {e}"));
                bgm_fallback = true;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "BGM task failed, falling back to voice-only");
                events.publish(PipelineEvent::BgmUnavailable { reason: e.to_string() });
                warnings.push(format!("BGM fallback: {e}"));
                bgm_fallback = true;
            }
        }

        if failure.is_none() {
            let mut assembler = SegmentAssembler::new(config.assembly.clone(), total);
            failure = loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Some(FailureReason::Cancelled),
                    _ = &mut deadline => break Some(timed_out.clone()),
                    next = outcomes.recv() => next,
                };
                let Some(outcome) = next else {
                    break Some(FailureReason::Interrupted { next_index: assembler.next_index() });
                };

                let index = outcome.index;
                if index == 1 {
                    events.publish(PipelineEvent::StateChanged { state: JobState::Mixing });
                }
                if let SegmentAudio::Placeholder { reason, .. } = &outcome.audio {
                    degraded.push(DegradedSegment { index, reason: reason.clone() });
                }
                attempts.push(outcome.attempts);

                let segment = match assembler.push(&outcome.audio) {
                    Ok(segment) => segment,
                    Err(e) => {
                        error!(index, error = %e, "segment audio cannot be normalized");
                        break Some(FailureReason::Format { index, error: e.to_string() });
                    }
                };
                segment_durations_ms.push(segment.duration_ms());

                let chunk = mixer.mix(segment);
                emitter.persist(&chunk).await;
                let interrupted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Some(FailureReason::Cancelled),
                    _ = &mut deadline => Some(timed_out.clone()),
                    _ = emitter.deliver_live(&chunk) => None,
                };
                emitter.record(&chunk);
                if interrupted.is_some() {
                    break interrupted;
                }
                if index == 1 {
                    events.publish(PipelineEvent::StateChanged { state: JobState::Streaming });
                }
                if chunk.is_final {
                    break None;
                }
            };
        }
        drop(outcomes);

        let summary = emitter.close();
        if let Some(err) = &summary.persist_error {
            warnings.push(format!("composite not persisted: {err}"));
        }

        let outcome = match failure {
            Some(reason) => {
                error!(%job_id, %reason, chunks = summary.chunks_emitted, "narration job failed");
                JobOutcome::Failed { reason }
            }
            None if !degraded.is_empty() || bgm_fallback || summary.persist_error.is_some() => {
                warn!(%job_id, degraded = degraded.len(), "narration job degraded");
                JobOutcome::Degraded { segments: degraded, warnings }
            }
            None => {
                info!(%job_id, chunks = summary.chunks_emitted, "narration job completed");
                JobOutcome::Completed { warnings }
            }
        };
        events.publish(PipelineEvent::StateChanged { state: outcome.state() });
        events.publish(PipelineEvent::Finished { outcome: outcome.clone() });

        JobReport {
            job_id,
            outcome,
            total_duration_ms: segment_durations_ms.iter().sum(),
            segment_durations_ms,
            mix_plan: mixer.into_plan(),
            bgm_asset,
            chunks_emitted: summary.chunks_emitted,
            chunks_delivered_live: summary.chunks_delivered_live,
            attempts,
            artifact: summary.artifact,
            partial_artifact: summary.partial_artifact,
        }
    }
}
