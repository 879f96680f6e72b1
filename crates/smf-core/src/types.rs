use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// CampaignState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Initial,
    Executing,
    ExecutionSuspended,
    ExecutionCompleted,
    ExecutionFailed,
    CampaignCommitted,
    RollingBack,
    RollbackSuspended,
    RollbackCompleted,
    RollbackCommitted,
    RollbackFailed,
    ErrorDetected,
}

impl CampaignState {
    pub fn all() -> &'static [CampaignState] {
        &[
            CampaignState::Initial,
            CampaignState::Executing,
            CampaignState::ExecutionSuspended,
            CampaignState::ExecutionCompleted,
            CampaignState::ExecutionFailed,
            CampaignState::CampaignCommitted,
            CampaignState::RollingBack,
            CampaignState::RollbackSuspended,
            CampaignState::RollbackCompleted,
            CampaignState::RollbackCommitted,
            CampaignState::RollbackFailed,
            CampaignState::ErrorDetected,
        ]
    }

    /// Numeric value carried in state-change notifications (1-based).
    pub fn value(self) -> u32 {
        self as u32 + 1
    }

    pub fn from_value(v: u32) -> Option<CampaignState> {
        Self::all().get(v.checked_sub(1)? as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignState::Initial => "initial",
            CampaignState::Executing => "executing",
            CampaignState::ExecutionSuspended => "execution_suspended",
            CampaignState::ExecutionCompleted => "execution_completed",
            CampaignState::ExecutionFailed => "execution_failed",
            CampaignState::CampaignCommitted => "campaign_committed",
            CampaignState::RollingBack => "rolling_back",
            CampaignState::RollbackSuspended => "rollback_suspended",
            CampaignState::RollbackCompleted => "rollback_completed",
            CampaignState::RollbackCommitted => "rollback_committed",
            CampaignState::RollbackFailed => "rollback_failed",
            CampaignState::ErrorDetected => "error_detected",
        }
    }

    /// Attributes of the campaign object may only change in these states.
    pub fn allows_modification(self) -> bool {
        matches!(
            self,
            CampaignState::Initial
                | CampaignState::CampaignCommitted
                | CampaignState::RollbackCommitted
        )
    }

    /// Execution or rollback failed; no admin operation applies any more.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            CampaignState::ExecutionFailed | CampaignState::RollbackFailed
        )
    }

    /// The campaign object may be deleted: modifiable, or failed for good.
    pub fn allows_deletion(self) -> bool {
        self.allows_modification() || self.is_failed()
    }

    /// States in which the campaign is actively driving procedures.
    pub fn is_running(self) -> bool {
        matches!(self, CampaignState::Executing | CampaignState::RollingBack)
    }

    /// States in which the campaign waits for an administrator decision.
    pub fn is_settled(self) -> bool {
        !self.is_running()
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignState {
    type Err = crate::error::SmfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| crate::error::SmfError::Parse(format!("unknown campaign state '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// ProcedureState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureState {
    Initial,
    Executing,
    Suspended,
    Completed,
    Failed,
    RollingBack,
    RollbackSuspended,
    RolledBack,
    RollbackFailed,
}

impl ProcedureState {
    pub fn all() -> &'static [ProcedureState] {
        &[
            ProcedureState::Initial,
            ProcedureState::Executing,
            ProcedureState::Suspended,
            ProcedureState::Completed,
            ProcedureState::Failed,
            ProcedureState::RollingBack,
            ProcedureState::RollbackSuspended,
            ProcedureState::RolledBack,
            ProcedureState::RollbackFailed,
        ]
    }

    pub fn value(self) -> u32 {
        self as u32 + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcedureState::Initial => "initial",
            ProcedureState::Executing => "executing",
            ProcedureState::Suspended => "suspended",
            ProcedureState::Completed => "completed",
            ProcedureState::Failed => "failed",
            ProcedureState::RollingBack => "rolling_back",
            ProcedureState::RollbackSuspended => "rollback_suspended",
            ProcedureState::RolledBack => "rolled_back",
            ProcedureState::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for ProcedureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcedureState {
    type Err = crate::error::SmfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| {
                crate::error::SmfError::Parse(format!("unknown procedure state '{s}'"))
            })
    }
}

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SwInstall,
    AuLock,
    AuRestart,
    NodeReboot,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::SwInstall => "sw_install",
            StepType::AuLock => "au_lock",
            StepType::AuRestart => "au_restart",
            StepType::NodeReboot => "node_reboot",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = crate::error::SmfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sw_install" => Ok(StepType::SwInstall),
            "au_lock" => Ok(StepType::AuLock),
            "au_restart" => Ok(StepType::AuRestart),
            "node_reboot" => Ok(StepType::NodeReboot),
            _ => Err(crate::error::SmfError::Parse(format!(
                "unknown step type '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// AdminOperation / AdminResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminOperation {
    Execute,
    Suspend,
    Commit,
    Rollback,
}

impl AdminOperation {
    /// Campaign states from which the operation may be invoked.
    pub fn allowed_from(self) -> &'static [CampaignState] {
        match self {
            AdminOperation::Execute => &[
                CampaignState::Initial,
                CampaignState::ExecutionSuspended,
            ],
            AdminOperation::Suspend => &[CampaignState::Executing, CampaignState::RollingBack],
            AdminOperation::Commit => &[
                CampaignState::ExecutionCompleted,
                CampaignState::RollbackCompleted,
            ],
            AdminOperation::Rollback => &[
                CampaignState::ExecutionCompleted,
                CampaignState::ErrorDetected,
                CampaignState::ExecutionSuspended,
                CampaignState::RollbackSuspended,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdminOperation::Execute => "execute",
            AdminOperation::Suspend => "suspend",
            AdminOperation::Commit => "commit",
            AdminOperation::Rollback => "rollback",
        }
    }
}

impl fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AIS-style result code returned to the administrative client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminResult {
    Ok,
    BadOperation,
    CampaignErrorDetected,
}

impl fmt::Display for AdminResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdminResult::Ok => "ok",
            AdminResult::BadOperation => "bad_operation",
            AdminResult::CampaignErrorDetected => "campaign_error_detected",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
