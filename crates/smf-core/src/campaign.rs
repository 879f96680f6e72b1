use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::dn::{is_campaign_dn, validate_dn};
use crate::error::{Result, SmfError};
use crate::notify::{
    SourceIndicator, StateChangeNotification, CAMPAIGN_STATE_ATTR_ID, CAMPAIGN_STATE_CLASS,
};
use crate::orchestrator::OrchestratorContext;
use crate::procedure::Procedure;
use crate::store::{AttrValue, Attributes};
use crate::types::{AdminOperation, CampaignState, ProcedureState};

/// The only campaign attribute an administrator may change.
pub const FILE_URI_ATTR: &str = "file_uri";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeModification {
    pub name: String,
    pub value: String,
}

impl AttributeModification {
    pub fn file_uri(path: &Path) -> Self {
        Self {
            name: FILE_URI_ATTR.to_string(),
            value: path.display().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Campaign {
    pub dn: String,
    pub state: CampaignState,
    pub file_uri: PathBuf,
    pub error: Option<String>,
    /// Stamped when execution first starts.
    pub config_base: Option<DateTime<Utc>>,
    pub expected_time_secs: Option<u64>,
    /// Wall time spent executing or rolling back, in milliseconds.
    pub elapsed_ms: u64,
    running_since: Option<DateTime<Utc>>,
    procedures: Option<Vec<Procedure>>,
}

impl Campaign {
    pub fn new(dn: impl Into<String>, file_uri: impl Into<PathBuf>) -> Result<Self> {
        let dn = dn.into();
        validate_dn(&dn)?;
        if !is_campaign_dn(&dn) {
            return Err(SmfError::InvalidDn(dn));
        }
        Ok(Self {
            dn,
            state: CampaignState::Initial,
            file_uri: file_uri.into(),
            error: None,
            config_base: None,
            expected_time_secs: None,
            elapsed_ms: 0,
            running_since: None,
            procedures: None,
        })
    }

    pub fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("state".into(), self.state.as_str().into());
        attrs.insert(
            FILE_URI_ATTR.into(),
            self.file_uri.display().to_string().into(),
        );
        attrs.insert(
            "error".into(),
            self.error.clone().unwrap_or_default().into(),
        );
        attrs.insert("elapsed_time".into(), self.elapsed_ms.into());
        if let Some(t) = self.config_base {
            attrs.insert("config_base".into(), t.into());
        }
        if let Some(secs) = self.expected_time_secs {
            attrs.insert("expected_time".into(), secs.into());
        }
        attrs
    }

    /// Rebuild a campaign from its persisted object.
    pub fn from_attributes(dn: &str, attrs: &Attributes) -> Result<Self> {
        let file = attrs
            .get(FILE_URI_ATTR)
            .and_then(AttrValue::as_str)
            .unwrap_or_default();
        let mut campaign = Campaign::new(dn, file)?;
        if let Some(state) = attrs.get("state").and_then(AttrValue::as_str) {
            campaign.state = state.parse()?;
        }
        campaign.error = attrs
            .get("error")
            .and_then(AttrValue::as_str)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        campaign.elapsed_ms = attrs
            .get("elapsed_time")
            .and_then(AttrValue::as_u64)
            .unwrap_or(0);
        campaign.config_base = attrs.get("config_base").and_then(AttrValue::as_time);
        campaign.expected_time_secs = attrs.get("expected_time").and_then(AttrValue::as_u64);
        if campaign.state.is_running() {
            campaign.running_since = Some(Utc::now());
        }
        Ok(campaign)
    }

    pub fn elapsed(&self) -> Duration {
        let running = self
            .running_since
            .map(|since| (Utc::now() - since).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        Duration::from_millis(self.elapsed_ms + running)
    }

    // -----------------------------------------------------------------------
    // Procedures
    // -----------------------------------------------------------------------

    pub fn has_procedures(&self) -> bool {
        self.procedures.is_some()
    }

    pub fn procedures(&self) -> &[Procedure] {
        self.procedures.as_deref().unwrap_or(&[])
    }

    /// Store the copy of a procedure handed back by its executor.
    pub fn replace_procedure(&mut self, index: usize, procedure: Procedure) {
        if let Some(slot) = self.procedures.as_mut().and_then(|p| p.get_mut(index)) {
            *slot = procedure;
        }
    }

    /// Parse the source file into procedures ordered by execution level and
    /// pick up any state persisted by an earlier run.
    fn load_procedures(&mut self, ctx: &OrchestratorContext) -> Result<()> {
        if !self.file_uri.exists() {
            return Err(SmfError::SourceFileMissing(
                self.file_uri.display().to_string(),
            ));
        }
        let desc = ctx.parser.parse(&self.file_uri)?;
        let mut procedures: Vec<Procedure> = desc
            .procedures
            .iter()
            .map(|p| Procedure::from_description(&self.dn, p))
            .collect();
        procedures.sort_by_key(|p| p.exec_level);
        for p in &mut procedures {
            p.reload(ctx.store.as_ref())?;
        }

        if desc.expected_time_secs != self.expected_time_secs {
            self.expected_time_secs = desc.expected_time_secs;
            if let Some(secs) = desc.expected_time_secs {
                ctx.store.write_attr(&self.dn, "expected_time", secs.into())?;
            }
        }
        info!(campaign = %self.dn, procedures = procedures.len(), "campaign parsed");
        self.procedures = Some(procedures);
        Ok(())
    }

    pub fn ensure_procedures(&mut self, ctx: &OrchestratorContext) -> Result<()> {
        if self.procedures.is_none() {
            self.load_procedures(ctx)?;
        }
        Ok(())
    }

    /// First procedure that has not completed.
    pub fn next_procedure(&self) -> Option<usize> {
        self.procedures()
            .iter()
            .position(|p| p.state != ProcedureState::Completed)
    }

    /// Last procedure that still has work to undo.
    pub fn next_rollback_procedure(&self) -> Option<usize> {
        self.procedures().iter().rposition(Procedure::needs_rollback)
    }

    // -----------------------------------------------------------------------
    // Attribute modification
    // -----------------------------------------------------------------------

    pub fn verify(&self, mods: &[AttributeModification]) -> Result<()> {
        if !self.state.allows_modification() {
            return Err(SmfError::BadOperation(format!(
                "campaign {} cannot be modified in state {}",
                self.dn, self.state
            )));
        }
        for m in mods {
            if m.name != FILE_URI_ATTR {
                return Err(SmfError::BadOperation(format!(
                    "attribute '{}' is not modifiable",
                    m.name
                )));
            }
            if !Path::new(&m.value).exists() {
                return Err(SmfError::BadOperation(format!(
                    "campaign file not found: {}",
                    m.value
                )));
            }
        }
        Ok(())
    }

    pub fn modify(&mut self, ctx: &OrchestratorContext, mods: &[AttributeModification]) -> Result<()> {
        self.verify(mods)?;
        for m in mods {
            let path = PathBuf::from(&m.value);
            if path == self.file_uri {
                continue;
            }
            info!(campaign = %self.dn, file = %m.value, "campaign source file changed");
            self.file_uri = path;
            self.procedures = None;
            ctx.store
                .write_attr(&self.dn, FILE_URI_ATTR, m.value.as_str().into())?;
            self.set_error(ctx, None)?;
            if self.state != CampaignState::Initial {
                self.set_state(ctx, CampaignState::Initial, SourceIndicator::ManagementOperation)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Admin operations
    // -----------------------------------------------------------------------

    /// Check `op` against the precondition table. No side effects.
    pub fn check_admin_operation(&self, op: AdminOperation) -> Result<()> {
        if op.allowed_from().contains(&self.state) {
            Ok(())
        } else {
            Err(SmfError::StateViolation {
                state: self.state.to_string(),
                reason: format!("{op} is not allowed"),
            })
        }
    }

    /// Start or resume execution. Returns false when the campaign could not
    /// be parsed; the error is recorded and the campaign is left re-executable
    /// in INITIAL.
    pub fn admin_op_execute(&mut self, ctx: &OrchestratorContext) -> Result<bool> {
        if let Err(e) = self.ensure_procedures(ctx) {
            warn!(campaign = %self.dn, error = %e, "campaign cannot be executed");
            self.set_error(ctx, Some(e.to_string()))?;
            self.set_state(ctx, CampaignState::Initial, SourceIndicator::ObjectOperation)?;
            return Ok(false);
        }

        if self.state == CampaignState::Initial {
            let now = Utc::now();
            self.config_base = Some(now);
            ctx.store.write_attr(&self.dn, "config_base", now.into())?;
            self.set_error(ctx, None)?;
        }
        self.set_state(ctx, CampaignState::Executing, SourceIndicator::ManagementOperation)?;
        Ok(true)
    }

    pub fn begin_rollback(&mut self, ctx: &OrchestratorContext) -> Result<()> {
        self.check_admin_operation(AdminOperation::Rollback)?;
        self.ensure_procedures(ctx)?;
        self.set_state(ctx, CampaignState::RollingBack, SourceIndicator::ManagementOperation)
    }

    /// Make the outcome permanent: drop the persisted procedure objects.
    pub fn commit(&mut self, ctx: &OrchestratorContext) -> Result<()> {
        let next = match self.state {
            CampaignState::ExecutionCompleted => CampaignState::CampaignCommitted,
            CampaignState::RollbackCompleted => CampaignState::RollbackCommitted,
            other => {
                return Err(SmfError::StateViolation {
                    state: other.to_string(),
                    reason: "commit is not allowed".to_string(),
                })
            }
        };
        for dn in ctx.store.descendants(&self.dn)? {
            ctx.store.delete(&dn)?;
        }
        self.procedures = None;
        self.set_state(ctx, next, SourceIndicator::ManagementOperation)
    }

    /// An externally detected fault while the campaign is running.
    pub fn error_detected(&mut self, ctx: &OrchestratorContext, reason: &str) -> Result<()> {
        if !self.state.is_running() {
            return Err(SmfError::StateViolation {
                state: self.state.to_string(),
                reason: "error detection only applies to a running campaign".to_string(),
            });
        }
        warn!(campaign = %self.dn, %reason, "error detected");
        self.set_error(ctx, Some(reason.to_string()))?;
        self.set_state(ctx, CampaignState::ErrorDetected, SourceIndicator::ObjectOperation)
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn set_error(&mut self, ctx: &OrchestratorContext, error: Option<String>) -> Result<()> {
        self.error = error;
        ctx.store.write_attr(
            &self.dn,
            "error",
            self.error.clone().unwrap_or_default().into(),
        )
    }

    /// Persist the new state and emit exactly one state-change notification.
    pub fn set_state(
        &mut self,
        ctx: &OrchestratorContext,
        state: CampaignState,
        source: SourceIndicator,
    ) -> Result<()> {
        let now = Utc::now();
        if let Some(since) = self.running_since.take() {
            self.elapsed_ms += (now - since).num_milliseconds().max(0) as u64;
        }
        if state.is_running() {
            self.running_since = Some(now);
        }

        info!(campaign = %self.dn, from = %self.state, to = %state, "campaign state change");
        self.state = state;
        ctx.store
            .write_attr(&self.dn, "state", state.as_str().into())?;
        ctx.store
            .write_attr(&self.dn, "elapsed_time", self.elapsed_ms.into())?;

        let n = StateChangeNotification::new(
            &self.dn,
            CAMPAIGN_STATE_CLASS,
            source,
            CAMPAIGN_STATE_ATTR_ID,
            state.value(),
        );
        if let Err(e) = ctx.notifier.send(&n) {
            warn!(campaign = %self.dn, error = %e, "state change notification failed");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
