//! Errors a stage can raise. The runner records them and moves on.

use thiserror::Error;

use crate::pipeline::artifact::ArtifactError;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}
