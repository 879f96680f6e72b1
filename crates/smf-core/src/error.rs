use crate::types::AdminResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmfError {
    #[error("operation not allowed in campaign state {state}: {reason}")]
    StateViolation { state: String, reason: String },

    #[error("bad operation: {0}")]
    BadOperation(String),

    #[error("step {step} cannot be classified: {reason}")]
    ClassificationFailure { step: String, reason: String },

    #[error("{operation} failed on {target}: {reason}")]
    ExecutionFailure {
        operation: String,
        target: String,
        reason: String,
    },

    #[error("campaign {active} is already executing")]
    ConcurrencyConflict { active: String },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("campaign already exists: {0}")]
    CampaignExists(String),

    #[error("invalid distinguished name '{0}'")]
    InvalidDn(String),

    #[error("campaign source file not found: {0}")]
    SourceFileMissing(String),

    #[error("campaign description error: {0}")]
    Parse(String),

    #[error("object store error: {0}")]
    Store(String),

    #[error("a campaign executor is already running for {0}")]
    ExecutorAlreadyRunning(String),

    #[error("executor for {0} is no longer running")]
    ExecutorGone(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SmfError {
    /// Result code reported back on the administrative channel.
    pub fn admin_result(&self) -> AdminResult {
        match self {
            SmfError::StateViolation { .. } => AdminResult::CampaignErrorDetected,
            _ => AdminResult::BadOperation,
        }
    }
}

pub type Result<T> = std::result::Result<T, SmfError>;
