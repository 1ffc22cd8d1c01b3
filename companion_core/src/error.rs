use thiserror::Error;

/// Failure taxonomy surfaced by the orchestration core.
///
/// Only `InvalidImport` and `InvariantViolation` are ever returned as `Err`
/// from the engine API. Generation failures travel inside a
/// [`GenerationResult`](crate::generation::GenerationResult) and collaborator
/// failures are downgraded to context notes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(
        "Generation backend error: {detail}. Model: {model}. \
         Please check that the model name is correct and the backend server is running."
    )]
    BackendUnavailable { model: String, detail: String },

    #[error(
        "Both primary and fallback generation returned no text. Model: {model}. \
         Please check that the backend server is running, or adjust Temperature/Top-P."
    )]
    EmptyGeneration { model: String },

    #[error("Invalid import: {0}")]
    InvalidImport(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("{collaborator} failed: {detail}")]
    CollaboratorFailure {
        collaborator: &'static str,
        detail: String,
    },
}

impl CoreError {
    pub(crate) fn collaborator(collaborator: &'static str, detail: impl std::fmt::Display) -> Self {
        CoreError::CollaboratorFailure {
            collaborator,
            detail: detail.to_string(),
        }
    }
}
