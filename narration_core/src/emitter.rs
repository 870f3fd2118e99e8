//! Fan-out of ordered chunks to a live consumer and to the persisted composite.
//!
//! The two sinks fail independently. A detached consumer stops live delivery
//! only; a persistence failure stops persistence only. Each chunk is persisted
//! before it is offered to the live consumer, and a consumer that stops
//! reading is detached once the delivery timeout expires.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::AudioFormat;
use crate::events::{EventPublisher, PipelineEvent};
use crate::mixer::StreamChunk;
use crate::pipeline::JobId;
use crate::wav;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("live consumer disconnected")]
pub struct ConsumerDisconnected;

/// Receives chunks in strictly increasing index order.
#[async_trait]
pub trait LiveSink: Send {
    async fn deliver(&mut self, chunk: &StreamChunk) -> Result<(), ConsumerDisconnected>;
}

/// Discards everything; used for jobs started without a listener.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl LiveSink for NullSink {
    async fn deliver(&mut self, _chunk: &StreamChunk) -> Result<(), ConsumerDisconnected> {
        Ok(())
    }
}

/// Bounded channel to an in-process consumer such as a WebSocket task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamChunk>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, ChunkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ChunkReceiver { rx })
    }
}

#[async_trait]
impl LiveSink for ChannelSink {
    async fn deliver(&mut self, chunk: &StreamChunk) -> Result<(), ConsumerDisconnected> {
        self.tx.send(chunk.clone()).await.map_err(|_| ConsumerDisconnected)
    }
}

#[derive(Debug)]
pub struct ChunkReceiver {
    rx: mpsc::Receiver<StreamChunk>,
}

impl ChunkReceiver {
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }

    pub fn into_stream(mut self) -> impl Stream<Item = StreamChunk> {
        async_stream::stream! {
            while let Some(chunk) = self.rx.recv().await {
                yield chunk;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("chunk format {found:?} does not match the track format {expected:?}")]
    FormatMismatch { expected: AudioFormat, found: AudioFormat },
}

/// Streams chunks into `<dir>/<job_id>.wav.part` and publishes the file as
/// `<dir>/<job_id>.wav` once the final chunk is in.
pub struct CompositeWriter {
    dir: PathBuf,
    job_id: JobId,
    format: AudioFormat,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    chunks: usize,
}

impl CompositeWriter {
    pub fn new(dir: impl Into<PathBuf>, job_id: JobId, format: AudioFormat) -> Self {
        Self {
            dir: dir.into(),
            job_id,
            format,
            writer: None,
            chunks: 0,
        }
    }

    pub fn final_path(&self) -> PathBuf {
        artifact_path(&self.dir, self.job_id)
    }

    pub fn part_path(&self) -> PathBuf {
        self.dir.join(format!("{}.wav.part", self.job_id))
    }

    pub fn partial_path(&self) -> PathBuf {
        self.dir.join(format!("{}.partial.wav", self.job_id))
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks
    }

    pub fn append(&mut self, chunk: &StreamChunk) -> Result<(), PersistError> {
        if chunk.audio.format != self.format {
            return Err(PersistError::FormatMismatch {
                expected: self.format,
                found: chunk.audio.format,
            });
        }
        if self.writer.is_none() {
            fs::create_dir_all(&self.dir)?;
            let spec = hound::WavSpec {
                channels: self.format.channels,
                sample_rate: self.format.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            self.writer = Some(hound::WavWriter::create(self.part_path(), spec)?);
        }
        if let Some(writer) = self.writer.as_mut() {
            for &s in &chunk.audio.samples {
                writer.write_sample(wav::to_i16(s))?;
            }
        }
        self.chunks += 1;
        Ok(())
    }

    /// Close the file and move it to its final location.
    pub fn finish(mut self) -> Result<PathBuf, PersistError> {
        let path = self.final_path();
        self.close_into(&path)?;
        Ok(path)
    }

    /// Keep whatever was written as `<job_id>.partial.wav`. Returns `None`
    /// when nothing was persisted.
    pub fn abandon(mut self) -> Result<Option<PathBuf>, PersistError> {
        if self.writer.is_none() {
            return Ok(None);
        }
        let path = self.partial_path();
        self.close_into(&path)?;
        Ok(Some(path))
    }

    fn close_into(&mut self, path: &Path) -> Result<(), PersistError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            fs::rename(self.part_path(), path)?;
        }
        Ok(())
    }
}

/// Where the composite file for `job_id` lands inside `dir`.
pub fn artifact_path(dir: &Path, job_id: JobId) -> PathBuf {
    dir.join(format!("{job_id}.wav"))
}

/// What the emitter delivered and stored for a job.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmitSummary {
    pub chunks_emitted: usize,
    pub chunks_delivered_live: usize,
    pub disconnected_after: Option<usize>,
    pub artifact: Option<PathBuf>,
    pub partial_artifact: Option<PathBuf>,
    pub persist_error: Option<String>,
}

/// Result of persisting one chunk on the blocking pool.
enum Persisted {
    Pending(CompositeWriter),
    Finished(PathBuf),
    Failed { part: PathBuf, error: PersistError },
}

pub struct OutputEmitter {
    live: Option<Box<dyn LiveSink>>,
    writer: Option<CompositeWriter>,
    events: EventPublisher,
    delivery_timeout: Duration,
    summary: EmitSummary,
}

impl OutputEmitter {
    pub fn new(live: Box<dyn LiveSink>, writer: Option<CompositeWriter>, events: EventPublisher) -> Self {
        Self {
            live: Some(live),
            writer,
            events,
            delivery_timeout: Duration::from_secs(30),
            summary: EmitSummary::default(),
        }
    }

    /// How long one chunk may wait for the live consumer before it is detached.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn is_live_attached(&self) -> bool {
        self.live.is_some()
    }

    /// Persist, then deliver live, then record the chunk as emitted.
    pub async fn emit(&mut self, chunk: StreamChunk) {
        self.persist(&chunk).await;
        self.deliver_live(&chunk).await;
        self.record(&chunk);
    }

    /// Append the chunk to the composite file; the final chunk also publishes it.
    pub async fn persist(&mut self, chunk: &StreamChunk) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let owned = chunk.clone();
        let step = tokio::task::spawn_blocking(move || {
            if let Err(error) = writer.append(&owned) {
                return Persisted::Failed { part: writer.part_path(), error };
            }
            if !owned.is_final {
                return Persisted::Pending(writer);
            }
            let part = writer.part_path();
            match writer.finish() {
                Ok(path) => Persisted::Finished(path),
                Err(error) => Persisted::Failed { part, error },
            }
        })
        .await;

        match step {
            Ok(Persisted::Pending(writer)) => self.writer = Some(writer),
            Ok(Persisted::Finished(path)) => {
                info!(job_id = %self.events.job_id(), path = %path.display(), "composite track persisted");
                self.summary.artifact = Some(path);
            }
            Ok(Persisted::Failed { part, error }) => self.persistence_failed(Some(part), error),
            Err(e) => self.persistence_failed(None, PersistError::Io(std::io::Error::other(e))),
        }
    }

    /// Offer the chunk to the live consumer, if one is still attached.
    pub async fn deliver_live(&mut self, chunk: &StreamChunk) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let index = chunk.segment_index;
        match tokio::time::timeout(self.delivery_timeout, live.deliver(chunk)).await {
            Ok(Ok(())) => {
                self.summary.chunks_delivered_live += 1;
                return;
            }
            Ok(Err(ConsumerDisconnected)) => {
                info!(job_id = %self.events.job_id(), index, "live consumer detached, continuing to persist");
            }
            Err(_) => {
                warn!(
                    job_id = %self.events.job_id(),
                    index,
                    timeout_ms = self.delivery_timeout.as_millis() as u64,
                    "live consumer stopped reading, detaching it"
                );
            }
        }
        let after_index = index.checked_sub(1).filter(|i| *i > 0);
        self.summary.disconnected_after = after_index;
        self.events.publish(PipelineEvent::ConsumerDisconnected { after_index });
        self.live = None;
    }

    /// Count the chunk and announce it.
    pub fn record(&mut self, chunk: &StreamChunk) {
        self.summary.chunks_emitted += 1;
        debug!(job_id = %self.events.job_id(), index = chunk.segment_index, is_final = chunk.is_final, "chunk emitted");
        self.events.publish(PipelineEvent::ChunkEmitted {
            index: chunk.segment_index,
            has_bgm: chunk.has_bgm,
            is_final: chunk.is_final,
        });
    }

    fn persistence_failed(&mut self, part: Option<PathBuf>, error: PersistError) {
        warn!(job_id = %self.events.job_id(), error = %error, "persistence failed, live delivery continues");
        self.events.publish(PipelineEvent::PersistenceFailed { error: error.to_string() });
        self.summary.persist_error = Some(error.to_string());
        if let Some(part) = part {
            let _ = fs::remove_file(part);
        }
    }

    /// Stop emitting. An unfinished composite is kept as a partial file.
    pub fn close(mut self) -> EmitSummary {
        if let Some(writer) = self.writer.take() {
            match writer.abandon() {
                Ok(partial) => {
                    if let Some(path) = &partial {
                        info!(job_id = %self.events.job_id(), path = %path.display(), "partial composite retained");
                    }
                    self.summary.partial_artifact = partial;
                }
                Err(e) => {
                    warn!(job_id = %self.events.job_id(), error = %e, "could not retain partial composite");
                    self.summary.persist_error = Some(e.to_string());
                }
            }
        }
        self.summary
    }
}
