use thiserror::Error;

/// Failures surfaced by the prediction → validation → staking pipeline.
///
/// Per-producer and per-rule failures never show up here; they are isolated,
/// logged and folded into the results as data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("No predictions available for {subject_id}/{metric}: all {attempted} producer(s) failed")]
    NoPredictionsAvailable {
        subject_id: String,
        metric: String,
        attempted: usize,
    },

    #[error("Validation rule '{rule}' failed during evaluation: {message}")]
    ValidationPipeline { rule: String, message: String },

    #[error("Refusing to size invalid prediction {opportunity_id} ({errors} validation error(s))")]
    InvalidPrediction { opportunity_id: String, errors: usize },

    // Configuration errors
    #[error("Unknown risk profile: {0}")]
    UnknownProfile(String),

    #[error("Risk profile already exists: {0}")]
    DuplicateProfile(String),

    #[error("Cannot delete the active risk profile: {0}")]
    ActiveProfileDeletion(String),

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Unknown experiment: {0}")]
    UnknownExperiment(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    // Ledger errors
    #[error("Bet already recorded: {0}")]
    DuplicateBet(String),

    #[error("Unknown bet: {0}")]
    UnknownBet(String),
}

impl PipelineError {
    /// Configuration errors reference ids that do not exist (or clash) and
    /// are the caller's fault rather than a runtime condition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::UnknownProfile(_)
                | PipelineError::DuplicateProfile(_)
                | PipelineError::ActiveProfileDeletion(_)
                | PipelineError::UnknownFeature(_)
                | PipelineError::UnknownExperiment(_)
                | PipelineError::InvalidDefinition(_)
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
