use thiserror::Error;

use crate::segment::PlanError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid segment plan: {0}")]
    Plan(#[from] PlanError),

    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("job task ended abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
}
