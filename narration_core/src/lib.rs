//! Streaming segment assembly and background-music mixing for long-form
//! narrations.
//!
//! A job takes an ordered [`SegmentPlan`], synthesizes the segments with
//! bounded concurrency, stitches them into one track, mixes an optional
//! music bed under it and streams each ready chunk to a live consumer while
//! persisting the composite file.

pub mod assembler;
pub mod audio;
pub mod bgm;
pub mod config;
pub mod coordinator;
pub mod emitter;
pub mod error;
pub mod events;
pub mod mixer;
pub mod normalize;
pub mod pipeline;
pub mod segment;
pub mod synthesis;
pub mod wav;

pub use assembler::{concatenate, AssembledSegment, AssemblyConfig, SegmentAssembler, Track, TrackBuilder};
pub use audio::{AudioBuffer, AudioEncoding, AudioFormat, FadeCurve, RawAudio};
pub use bgm::{
    BgmAsset, BgmConfig, BgmError, BgmRepository, BgmSelection, BgmSelector, BgmSlice, InMemoryBgmLibrary,
    ManifestBgmLibrary, NoBgmReason,
};
pub use config::PipelineConfig;
pub use coordinator::{DegradeReason, SegmentAudio, SegmentOutcome, SynthesisCoordinator};
pub use emitter::{
    artifact_path, ChannelSink, ChunkReceiver, CompositeWriter, ConsumerDisconnected, LiveSink, NullSink,
    OutputEmitter, PersistError,
};
pub use error::PipelineError;
pub use events::{cancel_pair, CancelHandle, CancelSignal, EventPublisher, JobEvent, PipelineEvent};
pub use mixer::{MixPlan, MixPlanEntry, StreamChunk, StreamingMixer};
pub use normalize::FormatNormalizationError;
pub use pipeline::{
    DegradedSegment, FailureReason, JobHandle, JobId, JobOutcome, JobReport, JobRequest, JobState, Pipeline,
};
pub use segment::{EmotionalDirective, PlanError, SegmentPlan, SegmentSpec};
pub use synthesis::{
    ErrorClass, ErrorClassifier, RetryPolicy, SilentSynthesizer, SpeechSynthesizer, SynthesisError,
    SynthesisErrorKind,
};
