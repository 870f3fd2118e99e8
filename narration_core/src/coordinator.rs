//! Bounded-concurrency synthesis with in-order release.
//!
//! Segments are synthesized by at most `concurrency` tasks at a time and may
//! complete in any order. Completions are parked in a reordering buffer and
//! released strictly by index. A segment is only launched while fewer than
//! `lookahead` indices are outstanding (in flight or parked), so a stalled low
//! index bounds memory; the per-attempt timeout then forces that index to a
//! retry or a degraded placeholder.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audio::RawAudio;
use crate::events::{CancelSignal, EventPublisher, PipelineEvent};
use crate::segment::{SegmentPlan, SegmentSpec};
use crate::synthesis::{ErrorClass, RetryPolicy, SpeechSynthesizer};

/// Why a segment was replaced by silence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradeReason {
    RetriesExhausted { attempts: u32, last_error: String },
    Permanent { error: String },
    TaskFailed,
}

impl std::fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DegradeReason::RetriesExhausted { attempts, last_error } => {
                write!(f, "gave up after {attempts} attempt(s): {last_error}")
            }
            DegradeReason::Permanent { error } => write!(f, "permanent failure: {error}"),
            DegradeReason::TaskFailed => write!(f, "synthesis task failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentAudio {
    Synthesized(RawAudio),
    /// Silence of the segment's estimated duration stands in for the real audio.
    Placeholder { duration_ms: u64, reason: DegradeReason },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentOutcome {
    pub index: usize,
    pub audio: SegmentAudio,
    pub attempts: u32,
}

impl SegmentOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self.audio, SegmentAudio::Placeholder { .. })
    }
}

#[derive(Clone)]
pub struct SynthesisCoordinator {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    policy: RetryPolicy,
    concurrency: usize,
    lookahead: usize,
    segment_timeout: Duration,
}

impl SynthesisCoordinator {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        policy: RetryPolicy,
        concurrency: usize,
        lookahead: usize,
        segment_timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            policy,
            concurrency: concurrency.max(1),
            lookahead: lookahead.max(1),
            segment_timeout,
        }
    }

    /// Start synthesizing every segment of `plan`. The returned receiver yields
    /// exactly one outcome per index, in increasing index order, unless the job
    /// is cancelled or the receiver is dropped.
    pub fn submit(
        &self,
        plan: &SegmentPlan,
        events: EventPublisher,
        mut cancel: CancelSignal,
    ) -> mpsc::Receiver<SegmentOutcome> {
        let (tx, rx) = mpsc::channel(self.lookahead);
        let specs: Vec<SegmentSpec> = plan.segments().to_vec();
        let this = self.clone();

        tokio::spawn(async move {
            let mut tasks: JoinSet<SegmentOutcome> = JoinSet::new();
            let mut parked: BTreeMap<usize, SegmentOutcome> = BTreeMap::new();
            let mut launched: BTreeSet<usize> = BTreeSet::new();
            let mut next_release = 1usize;
            let mut next_launch = 0usize;

            loop {
                while !cancel.is_cancelled()
                    && next_launch < specs.len()
                    && tasks.len() < this.concurrency
                    && specs[next_launch].index < next_release + this.lookahead
                {
                    let spec = specs[next_launch].clone();
                    debug!(index = spec.index, in_flight = tasks.len() + 1, "launching synthesis");
                    launched.insert(spec.index);
                    tasks.spawn(synthesize_segment(
                        Arc::clone(&this.synthesizer),
                        spec,
                        this.policy.clone(),
                        this.segment_timeout,
                        events.clone(),
                    ));
                    next_launch += 1;
                }

                if tasks.is_empty() {
                    if launched.is_empty() || cancel.is_cancelled() {
                        break;
                    }
                    // a task died without reporting; do not stall the release cursor
                    for index in std::mem::take(&mut launched) {
                        error!(index, "synthesis task lost, degrading segment");
                        let spec = &specs[index - 1];
                        parked.insert(index, placeholder(spec, 0, DegradeReason::TaskFailed, &events));
                    }
                } else {
                    tokio::select! {
                        joined = tasks.join_next() => match joined {
                            Some(Ok(outcome)) => {
                                launched.remove(&outcome.index);
                                parked.insert(outcome.index, outcome);
                            }
                            Some(Err(e)) => error!(error = %e, "synthesis task aborted"),
                            None => {}
                        },
                        _ = cancel.cancelled() => {
                            info!(in_flight = tasks.len(), "job cancelled, no new synthesis requests");
                            // in-flight requests finish on their own; results are discarded
                            tasks.detach_all();
                            break;
                        }
                    }
                }

                while let Some(outcome) = parked.remove(&next_release) {
                    if tx.send(outcome).await.is_err() {
                        debug!("outcome receiver dropped, stopping coordinator");
                        tasks.detach_all();
                        return;
                    }
                    next_release += 1;
                }
            }
        });

        rx
    }
}

fn placeholder(
    spec: &SegmentSpec,
    attempts: u32,
    reason: DegradeReason,
    events: &EventPublisher,
) -> SegmentOutcome {
    warn!(index = spec.index, %reason, "segment degraded to silence placeholder");
    events.publish(PipelineEvent::SegmentDegraded {
        index: spec.index,
        reason: reason.to_string(),
    });
    SegmentOutcome {
        index: spec.index,
        audio: SegmentAudio::Placeholder {
            duration_ms: spec.estimated_duration_ms,
            reason,
        },
        attempts,
    }
}

async fn synthesize_segment(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    spec: SegmentSpec,
    policy: RetryPolicy,
    timeout: Duration,
    events: EventPublisher,
) -> SegmentOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, synthesizer.synthesize(&spec.text, &spec.directive)).await {
            Ok(result) => result,
            Err(_) => Err(crate::synthesis::SynthesisError::Timeout),
        };

        let err = match result {
            Ok(raw) => {
                debug!(index = spec.index, attempt, bytes = raw.bytes.len(), "segment synthesized");
                return SegmentOutcome {
                    index: spec.index,
                    audio: SegmentAudio::Synthesized(raw),
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if policy.classifier.classify(&err) == ErrorClass::Permanent {
            return placeholder(&spec, attempt, DegradeReason::Permanent { error: err.to_string() }, &events);
        }
        if attempt >= max_attempts {
            let reason = DegradeReason::RetriesExhausted {
                attempts: attempt,
                last_error: err.to_string(),
            };
            return placeholder(&spec, attempt, reason, &events);
        }

        let delay = policy.backoff(attempt);
        warn!(index = spec.index, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient synthesis failure, retrying");
        events.publish(PipelineEvent::SegmentRetrying {
            index: spec.index,
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: err.to_string(),
        });
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobId;
    use crate::segment::EmotionalDirective;
    use crate::synthesis::SynthesisError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers with the segment text as bytes after a per-text delay,
    /// failing the first `failures[text]` calls with the given error.
    struct ScriptedSynth {
        delays: HashMap<String, u64>,
        failures: Mutex<HashMap<String, (usize, SynthesisError)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSynth {
        fn new(delays: &[(&str, u64)]) -> Self {
            Self {
                delays: delays.iter().map(|(t, d)| (t.to_string(), *d)).collect(),
                failures: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn fail(self, text: &str, times: usize, err: SynthesisError) -> Self {
            self.failures.lock().unwrap().insert(text.to_string(), (times, err));
            self
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for ScriptedSynth {
        async fn synthesize(&self, text: &str, _d: &EmotionalDirective) -> Result<RawAudio, SynthesisError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = self.delays.get(text).copied().unwrap_or(1);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut failures = self.failures.lock().unwrap();
            if let Some((left, err)) = failures.get_mut(text) {
                if *left > 0 {
                    *left -= 1;
                    return Err(err.clone());
                }
            }
            Ok(RawAudio::pcm16(1_000, 1, text.as_bytes().to_vec()))
        }
    }

    fn plan(n: usize) -> SegmentPlan {
        SegmentPlan::new(
            (1..=n)
                .map(|i| SegmentSpec {
                    index: i,
                    text: format!("s{i}"),
                    directive: EmotionalDirective::default(),
                    estimated_duration_ms: 500,
                })
                .collect(),
        )
        .unwrap()
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, base_delay_ms: 1, jitter_ms: 1, ..RetryPolicy::default() }
    }

    async fn collect(mut rx: mpsc::Receiver<SegmentOutcome>) -> Vec<SegmentOutcome> {
        let mut out = Vec::new();
        while let Some(o) = rx.recv().await {
            out.push(o);
        }
        out
    }

    fn events() -> EventPublisher {
        EventPublisher::new(JobId::new(), 64)
    }

    #[tokio::test]
    async fn test_out_of_order_completion_is_released_in_order() {
        // later segments finish first
        let synth = Arc::new(ScriptedSynth::new(&[("s1", 60), ("s2", 40), ("s3", 5), ("s4", 20), ("s5", 1)]));
        let coord = SynthesisCoordinator::new(synth, fast_policy(3), 5, 5, Duration::from_secs(5));
        let out = collect(coord.submit(&plan(5), events(), CancelSignal::never())).await;
        let indices: Vec<usize> = out.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert!(out.iter().all(|o| !o.is_degraded()));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let synth = Arc::new(ScriptedSynth::new(&[]));
        let coord = SynthesisCoordinator::new(synth.clone(), fast_policy(1), 2, 8, Duration::from_secs(5));
        let out = collect(coord.submit(&plan(8), events(), CancelSignal::never())).await;
        assert_eq!(out.len(), 8);
        assert!(synth.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_lookahead_caps_outstanding_indices() {
        // s1 is slow; with lookahead 2 only s2 may run ahead of it
        let synth = Arc::new(ScriptedSynth::new(&[("s1", 80)]));
        let coord = SynthesisCoordinator::new(synth.clone(), fast_policy(1), 4, 2, Duration::from_secs(5));
        let out = collect(coord.submit(&plan(4), events(), CancelSignal::never())).await;
        assert_eq!(out.len(), 4);
        assert!(synth.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let synth = Arc::new(ScriptedSynth::new(&[]).fail("s2", 3, SynthesisError::RateLimited));
        let coord = SynthesisCoordinator::new(synth, fast_policy(5), 3, 3, Duration::from_secs(5));
        let out = collect(coord.submit(&plan(3), events(), CancelSignal::never())).await;
        assert_eq!(out[1].attempts, 4);
        assert_eq!(out[1].audio, SegmentAudio::Synthesized(RawAudio::pcm16(1_000, 1, b"s2".to_vec())));
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade_to_placeholder() {
        let synth = Arc::new(
            ScriptedSynth::new(&[]).fail("s2", 10, SynthesisError::ServiceUnavailable("503".into())),
        );
        let ev = events();
        let mut rx_events = ev.subscribe();
        let coord = SynthesisCoordinator::new(synth, fast_policy(3), 3, 3, Duration::from_secs(5));
        let out = collect(coord.submit(&plan(3), ev, CancelSignal::never())).await;
        assert_eq!(out.len(), 3);
        match &out[1].audio {
            SegmentAudio::Placeholder { duration_ms, reason } => {
                assert_eq!(*duration_ms, 500);
                assert!(matches!(reason, DegradeReason::RetriesExhausted { attempts: 3, .. }));
            }
            other => panic!("expected placeholder, got {other:?}"),
        }
        let mut retries = 0;
        while let Ok(e) = rx_events.try_recv() {
            if let PipelineEvent::SegmentRetrying { index, .. } = e.event {
                assert_eq!(index, 2);
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retry_budget() {
        let synth = Arc::new(ScriptedSynth::new(&[]).fail("s1", 1, SynthesisError::InvalidInput("bad".into())));
        let coord = SynthesisCoordinator::new(synth, fast_policy(5), 1, 1, Duration::from_secs(5));
        let out = collect(coord.submit(&plan(2), events(), CancelSignal::never())).await;
        assert_eq!(out[0].attempts, 1);
        assert!(matches!(
            out[0].audio,
            SegmentAudio::Placeholder { reason: DegradeReason::Permanent { .. }, .. }
        ));
        assert!(!out[1].is_degraded());
    }

    #[tokio::test]
    async fn test_stalled_segment_times_out_and_degrades() {
        let synth = Arc::new(ScriptedSynth::new(&[("s1", 10_000)]));
        let coord = SynthesisCoordinator::new(synth, fast_policy(2), 2, 2, Duration::from_millis(30));
        let out = collect(coord.submit(&plan(3), events(), CancelSignal::never())).await;
        assert_eq!(out.iter().map(|o| o.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        match &out[0].audio {
            SegmentAudio::Placeholder { reason: DegradeReason::RetriesExhausted { last_error, .. }, .. } => {
                assert!(last_error.contains("timed out"));
            }
            other => panic!("expected timeout placeholder, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_new_requests() {
        let synth = Arc::new(ScriptedSynth::new(&[("s1", 50), ("s2", 50), ("s3", 50), ("s4", 50)]));
        let (handle, signal) = crate::events::cancel_pair();
        let coord = SynthesisCoordinator::new(synth, fast_policy(1), 1, 4, Duration::from_secs(5));
        let mut rx = coord.submit(&plan(4), events(), signal);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.index, 1);
        handle.cancel();
        let rest = collect(rx).await;
        assert!(rest.len() < 3);
    }
}
