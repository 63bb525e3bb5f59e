//! Error types for job orchestration.

use thiserror::Error;

use crate::core::models::{JobState, SourceType};
use crate::core::state_machine::Transition;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A guard declined the transition. The job keeps its state.
    #[error("transition '{transition}' blocked: {reason}")]
    BlockedTransition {
        transition: Transition,
        reason: String,
    },

    /// The transition does not lead out of the job's current state.
    #[error("transition '{transition}' is not legal from state '{from}'")]
    IllegalTransition {
        from: JobState,
        transition: Transition,
    },

    /// An external tool failed, timed out or produced unusable output.
    #[error("command '{command}' failed: {message}")]
    ExternalCommandFailure { command: String, message: String },

    #[error("{operation} is not supported for source type {source_type}")]
    UnsupportedTemplateType {
        operation: &'static str,
        source_type: SourceType,
    },

    #[error("lock '{0}' is held by another run")]
    LockUnavailable(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalCommandFailure {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::BlockedTransition { .. })
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
