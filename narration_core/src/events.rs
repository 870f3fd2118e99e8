//! Progress notifications published by a running job.
//!
//! The pipeline never talks to a UI or a transport directly; it publishes
//! [`PipelineEvent`]s on a broadcast channel and anyone interested subscribes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::pipeline::{JobId, JobOutcome, JobState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged { state: JobState },
    SegmentRetrying { index: usize, attempt: u32, delay_ms: u64, error: String },
    SegmentDegraded { index: usize, reason: String },
    BgmSelected { asset_id: String, score: f32 },
    /// Informational: the job continues voice-only.
    BgmUnavailable { reason: String },
    ChunkEmitted { index: usize, has_bgm: bool, is_final: bool },
    ConsumerDisconnected { after_index: Option<usize> },
    PersistenceFailed { error: String },
    Finished { outcome: JobOutcome },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

/// Cheap, cloneable handle used by every stage to publish events for one job.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    job_id: JobId,
    tx: broadcast::Sender<JobEvent>,
}

impl EventPublisher {
    pub fn new(job_id: JobId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { job_id, tx }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.tx.send(JobEvent {
            job_id: self.job_id,
            at: Utc::now(),
            event,
        });
    }
}

/// Requests job cancellation. Clones cancel the same job.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Observes a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelSignal(rx))
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle is dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
