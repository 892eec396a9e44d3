//! Validation error types for roadmap and lifecycle operations.
//!
//! Persistence and orchestration failures travel as `anyhow::Error`; these
//! typed errors are wrapped inside it so callers can `downcast_ref` them.

use crate::roadmap::StageStatus;
use thiserror::Error;

/// Result type for roadmap operations.
pub type RoadmapResult<T> = Result<T, RoadmapError>;

/// Errors that reject a roadmap mutation or lifecycle transition.
///
/// A rejected operation never changes the roadmap.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoadmapError {
    /// No live or retired stage carries this id.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// The stage exists but was retired by a merge or split.
    #[error("Stage '{0}' was retired and can no longer change")]
    RetiredStage(String),

    /// The stage's status does not allow the requested operation.
    #[error("Stage '{id}' is {status} and cannot be {operation}")]
    NotMutable {
        id: String,
        status: StageStatus,
        operation: &'static str,
    },

    /// Another stage already holds the active slot.
    #[error("Stage '{active}' is already active; complete or defer it before starting '{requested}'")]
    AnotherStageActive { active: String, requested: String },

    /// Arguments are structurally invalid (empty names, duplicate ids, ...).
    #[error("Invalid {operation}: {reason}")]
    InvalidArgument {
        operation: &'static str,
        reason: String,
    },

    /// A plan step index does not exist.
    #[error("Plan step {index} is out of range (plan has {len} steps)")]
    PlanStepOutOfRange { index: usize, len: usize },
}

impl RoadmapError {
    pub(crate) fn invalid(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_mutable_message_names_status() {
        let err = RoadmapError::NotMutable {
            id: "stage-1".to_string(),
            status: StageStatus::Completed,
            operation: "merged",
        };
        assert_eq!(
            err.to_string(),
            "Stage 'stage-1' is completed and cannot be merged"
        );
    }

    #[test]
    fn test_errors_survive_anyhow_downcast() {
        let err: anyhow::Error = RoadmapError::UnknownStage("stage-9".to_string()).into();
        assert_eq!(
            err.downcast_ref::<RoadmapError>(),
            Some(&RoadmapError::UnknownStage("stage-9".to_string()))
        );
    }
}
