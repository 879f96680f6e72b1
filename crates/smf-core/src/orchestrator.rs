//! The orchestrator service object.
//!
//! Built once from its collaborators and shared with every executor as
//! `Arc<OrchestratorContext>`. Owns the campaign registry, the single
//! campaign executor slot and the tokio runtime the executors run on. The
//! public API is synchronous and must not be called from inside an async
//! context.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::agent::ClusterAgent;
use crate::campaign::{AttributeModification, Campaign};
use crate::campaign_executor::{CampaignEvent, CampaignExecutor, ExecutorSlot};
use crate::config::SmfConfig;
use crate::dn::is_campaign_dn;
use crate::error::{Result, SmfError};
use crate::notify::Notifier;
use crate::parser::CampaignParser;
use crate::procedure::Procedure;
use crate::step_machine::{StepContext, StepState};
use crate::store::ObjectStore;
use crate::types::{AdminOperation, AdminResult, CampaignState, ProcedureState, StepType};

// ---------------------------------------------------------------------------
// OrchestratorContext
// ---------------------------------------------------------------------------

pub struct OrchestratorContext {
    pub store: Arc<dyn ObjectStore>,
    pub notifier: Arc<dyn Notifier>,
    pub agent: Arc<dyn ClusterAgent>,
    pub parser: Arc<dyn CampaignParser>,
    pub config: SmfConfig,
}

impl OrchestratorContext {
    pub fn step_context(&self) -> StepContext<'_> {
        StepContext {
            agent: self.agent.as_ref(),
            store: self.store.as_ref(),
            local_node: &self.config.node,
            activation_hook: self.config.activation_hook,
            reboot_timeout: self.config.reboot_timeout(),
            bundle_timeout: self.config.bundle_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStatus {
    pub dn: String,
    pub state: CampaignState,
    pub file_uri: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_base: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_time_secs: Option<u64>,
    pub elapsed_ms: u64,
    pub active: bool,
    pub procedures: Vec<ProcedureStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcedureStatus {
    pub dn: String,
    pub name: String,
    pub exec_level: u32,
    pub state: ProcedureState,
    pub current_step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rollback_steps: Vec<StepStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub dn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    pub state: StepState,
    pub retry_count: u32,
    pub switch_over: bool,
}

impl From<&crate::step::Step> for StepStatus {
    fn from(s: &crate::step::Step) -> Self {
        Self {
            dn: s.dn.clone(),
            step_type: s.step_type,
            state: s.state,
            retry_count: s.retry_count,
            switch_over: s.switch_over,
        }
    }
}

impl From<&Procedure> for ProcedureStatus {
    fn from(p: &Procedure) -> Self {
        Self {
            dn: p.dn.clone(),
            name: p.name.clone(),
            exec_level: p.exec_level,
            state: p.state,
            current_step: p.current_step,
            error: p.error.clone(),
            steps: p.steps.iter().map(StepStatus::from).collect(),
            rollback_steps: p.rollback_steps.iter().map(StepStatus::from).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    campaigns: Mutex<BTreeMap<String, Arc<Mutex<Campaign>>>>,
    slot: Arc<ExecutorSlot>,
    runtime: Option<Runtime>,
}

fn lock(campaign: &Mutex<Campaign>) -> MutexGuard<'_, Campaign> {
    campaign.lock().unwrap_or_else(|e| e.into_inner())
}

impl Orchestrator {
    /// Build the orchestrator and load every campaign object already in the
    /// store. Nothing is resumed until `recover` is called.
    pub fn new(ctx: OrchestratorContext) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("smf-executor")
            .enable_all()
            .build()?;
        let orchestrator = Self {
            ctx: Arc::new(ctx),
            campaigns: Mutex::new(BTreeMap::new()),
            slot: Arc::new(ExecutorSlot::default()),
            runtime: Some(runtime),
        };
        orchestrator.load_campaigns()?;
        Ok(orchestrator)
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Mutex<Campaign>>>> {
        self.campaigns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_campaigns(&self) -> Result<()> {
        let mut registry = self.registry();
        for dn in self.ctx.store.list()? {
            if !is_campaign_dn(&dn) || registry.contains_key(&dn) {
                continue;
            }
            let Some(attrs) = self.ctx.store.read(&dn)? else {
                continue;
            };
            let campaign = Campaign::from_attributes(&dn, &attrs)?;
            debug!(campaign = %dn, state = %campaign.state, "loaded campaign");
            registry.insert(dn, Arc::new(Mutex::new(campaign)));
        }
        Ok(())
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| SmfError::BadOperation("orchestrator is shut down".to_string()))?;
        Ok(runtime.block_on(future))
    }

    fn get(&self, dn: &str) -> Result<Arc<Mutex<Campaign>>> {
        self.registry()
            .get(dn)
            .cloned()
            .ok_or_else(|| SmfError::CampaignNotFound(dn.to_string()))
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    pub fn create_campaign(&self, dn: &str, file_uri: &Path) -> Result<()> {
        let campaign = Campaign::new(dn, file_uri)?;
        let mut registry = self.registry();
        if registry.contains_key(dn) || self.ctx.store.exists(dn)? {
            return Err(SmfError::CampaignExists(dn.to_string()));
        }
        self.ctx.store.create(dn, campaign.to_attributes())?;
        info!(campaign = %dn, file = %file_uri.display(), "campaign created");
        registry.insert(dn.to_string(), Arc::new(Mutex::new(campaign)));
        Ok(())
    }

    pub fn delete_campaign(&self, dn: &str) -> Result<()> {
        let campaign = self.get(dn)?;
        if self.slot.active_campaign().as_deref() == Some(dn) {
            return Err(SmfError::BadOperation(format!(
                "campaign {dn} has an active executor"
            )));
        }
        let state = lock(&campaign).state;
        if !state.allows_deletion() {
            return Err(SmfError::BadOperation(format!(
                "campaign {dn} cannot be deleted in state {state}"
            )));
        }
        for child in self.ctx.store.descendants(dn)? {
            self.ctx.store.delete(&child)?;
        }
        self.ctx.store.delete(dn)?;
        self.registry().remove(dn);
        info!(campaign = %dn, "campaign deleted");
        Ok(())
    }

    pub fn campaigns(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    pub fn campaign_state(&self, dn: &str) -> Result<CampaignState> {
        let campaign = self.get(dn)?;
        let state = lock(&campaign).state;
        Ok(state)
    }

    /// Snapshot of a campaign with procedure and step state read back from
    /// the store.
    pub fn status(&self, dn: &str) -> Result<CampaignStatus> {
        let shared = self.get(dn)?;
        let campaign = lock(&shared).clone();
        let store = self.ctx.store.as_ref();

        let mut procedures: Vec<Procedure> = if campaign.has_procedures() {
            campaign.procedures().to_vec()
        } else {
            match self.ctx.parser.parse(&campaign.file_uri) {
                Ok(desc) => {
                    let mut list: Vec<Procedure> = desc
                        .procedures
                        .iter()
                        .map(|p| Procedure::from_description(dn, p))
                        .collect();
                    list.sort_by_key(|p| p.exec_level);
                    list
                }
                Err(e) => {
                    debug!(campaign = %dn, error = %e, "status without procedure list");
                    Vec::new()
                }
            }
        };
        for p in &mut procedures {
            // Ask a running executor to publish its runtime attributes first.
            store.request_runtime_update(&p.dn, "state")?;
            p.reload(store)?;
        }

        Ok(CampaignStatus {
            dn: campaign.dn.clone(),
            state: campaign.state,
            file_uri: campaign.file_uri.clone(),
            error: campaign.error.clone(),
            config_base: campaign.config_base,
            expected_time_secs: campaign.expected_time_secs,
            elapsed_ms: campaign.elapsed().as_millis() as u64,
            active: self.slot.active_campaign().as_deref() == Some(dn),
            procedures: procedures.iter().map(ProcedureStatus::from).collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Attribute modification
    // -----------------------------------------------------------------------

    pub fn verify(&self, dn: &str, mods: &[AttributeModification]) -> Result<()> {
        let campaign = self.get(dn)?;
        let c = lock(&campaign);
        c.verify(mods)
    }

    pub fn modify(&self, dn: &str, mods: &[AttributeModification]) -> Result<()> {
        let campaign = self.get(dn)?;
        let mut c = lock(&campaign);
        c.modify(&self.ctx, mods)
    }

    // -----------------------------------------------------------------------
    // Admin operations
    // -----------------------------------------------------------------------

    /// Validate `op` and hand it to the campaign executor, starting the
    /// executor if needed. Returns once the event is queued.
    pub fn admin_operation(&self, dn: &str, op: AdminOperation) -> Result<()> {
        let campaign = self.get(dn)?;
        let mut stale = None;
        let result = self.queue_admin_event(dn, op, campaign, &mut stale);
        // An exiting executor releases the slot itself, so it is joined only
        // after the slot lock is dropped.
        if let Some(mut executor) = stale {
            self.block_on(executor.stop())?;
        }
        result
    }

    fn queue_admin_event(
        &self,
        dn: &str,
        op: AdminOperation,
        campaign: Arc<Mutex<Campaign>>,
        stale: &mut Option<CampaignExecutor>,
    ) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(CampaignExecutor::is_finished) {
            *stale = slot.take();
        }
        if let Some(active) = slot.as_ref() {
            if active.campaign() != dn {
                return Err(SmfError::ConcurrencyConflict {
                    active: active.campaign().to_string(),
                });
            }
        }
        lock(&campaign).check_admin_operation(op)?;

        let event = CampaignEvent::from_admin(op);
        if let Some(active) = slot.as_ref() {
            match active.post(event.clone()) {
                Ok(()) => {
                    info!(campaign = %dn, %op, "admin operation queued");
                    return Ok(());
                }
                // Executor exited between the check and the post.
                Err(SmfError::ExecutorGone(_)) => *stale = slot.take(),
                Err(e) => return Err(e),
            }
        }

        let executor = self.block_on(CampaignExecutor::start(
            self.ctx.clone(),
            campaign,
            self.slot.clone(),
            slot.as_ref(),
        ))??;
        executor.post(event)?;
        *slot = Some(executor);
        info!(campaign = %dn, %op, "admin operation queued");
        Ok(())
    }

    /// `admin_operation` reduced to the administrative result code.
    pub fn admin(&self, dn: &str, op: AdminOperation) -> AdminResult {
        match self.admin_operation(dn, op) {
            Ok(()) => AdminResult::Ok,
            Err(e) => {
                warn!(campaign = %dn, %op, error = %e, "admin operation rejected");
                e.admin_result()
            }
        }
    }

    /// Report an externally detected fault against the running campaign.
    pub fn error_detected(&self, dn: &str, reason: &str) -> Result<()> {
        let campaign = self.get(dn)?;
        let slot = self.slot.lock();
        let state = lock(&campaign).state;
        if !state.is_running() {
            return Err(SmfError::StateViolation {
                state: state.to_string(),
                reason: "error detection only applies to a running campaign".to_string(),
            });
        }
        match slot.as_ref() {
            Some(active) if active.campaign() == dn => {
                active.post(CampaignEvent::ErrorDetected(reason.to_string()))
            }
            _ => Err(SmfError::ExecutorGone(dn.to_string())),
        }
    }

    pub fn active_campaign(&self) -> Option<String> {
        self.slot.active_campaign()
    }

    // -----------------------------------------------------------------------
    // Recovery / lifecycle
    // -----------------------------------------------------------------------

    /// Resume a campaign that was executing or rolling back when the
    /// previous orchestrator instance stopped. Returns its DN.
    pub fn recover(&self) -> Result<Option<String>> {
        self.load_campaigns()?;
        let running = self.registry().iter().find_map(|(dn, c)| {
            let state = lock(c.as_ref()).state;
            state.is_running().then(|| (dn.clone(), c.clone(), state))
        });
        let Some((dn, campaign, state)) = running else {
            return Ok(None);
        };

        let mut slot = self.slot.lock();
        let event = match state {
            CampaignState::RollingBack => CampaignEvent::RollbackProc,
            _ => CampaignEvent::ExecuteProc,
        };
        info!(campaign = %dn, %state, "resuming campaign");
        let executor = self.block_on(CampaignExecutor::start(
            self.ctx.clone(),
            campaign,
            self.slot.clone(),
            slot.as_ref(),
        ))??;
        executor.post(event)?;
        *slot = Some(executor);
        Ok(Some(dn))
    }

    /// Block until the active executor has no queued work or running
    /// procedure. True when idle (or nothing is active).
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let work = self.slot.lock().as_ref().map(CampaignExecutor::work);
        match work {
            Some(work) => self.block_on(work.wait_idle(timeout)).unwrap_or(true),
            None => true,
        }
    }

    /// Stop the active executor, if any, and wait for it.
    pub fn shutdown(&self) {
        if let Some(mut executor) = self.slot.take() {
            info!(campaign = %executor.campaign(), "stopping campaign executor");
            if let Err(e) = self.block_on(executor.stop()) {
                warn!(campaign = %executor.campaign(), error = %e, "executor not stopped");
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
