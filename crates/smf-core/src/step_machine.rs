//! Step state machine.
//!
//! A step starts in `Initial`, where it is classified into one of the four
//! step types. It then moves to `Executing`, runs the ordered sub-operation
//! plan for its type and ends in `Completed` or `Failed`. A failed
//! sub-operation is never undone; the step either consumes a retry and stays
//! `Executing`, or fails.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::{AgentResult, ClusterAgent, HookPhase};
use crate::dn::{bundle_record_dn, UnitClass};
use crate::error::{Result, SmfError};
use crate::step::{Bundle, ImmModification, Step};
use crate::store::{Attributes, ObjectStore};
use crate::types::StepType;

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Initial,
    Executing,
    Completed,
    Failed,
}

impl StepState {
    pub fn as_str(self) -> &'static str {
        match self {
            StepState::Initial => "initial",
            StepState::Executing => "executing",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }

    pub fn can_transition_to(self, next: StepState) -> bool {
        matches!(
            (self, next),
            (StepState::Initial, StepState::Executing)
                | (StepState::Initial, StepState::Failed)
                | (StepState::Executing, StepState::Completed)
                | (StepState::Executing, StepState::Failed)
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepState {
    type Err = SmfError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "initial" => Ok(StepState::Initial),
            "executing" => Ok(StepState::Executing),
            "completed" => Ok(StepState::Completed),
            "failed" => Ok(StepState::Failed),
            _ => Err(SmfError::Parse(format!("unknown step state '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Context / outcome
// ---------------------------------------------------------------------------

/// Everything a step needs from its surroundings while executing.
pub struct StepContext<'a> {
    pub agent: &'a dyn ClusterAgent,
    pub store: &'a dyn ObjectStore,
    /// DN of the node the orchestrator itself runs on.
    pub local_node: &'a str,
    pub activation_hook: bool,
    pub reboot_timeout: Duration,
    pub bundle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
    /// The step must reboot the node the orchestrator runs on. The step is
    /// still `Initial` and is resumed by the peer after the switchover.
    SwitchOverRequired,
    /// A sub-operation failed and a retry was consumed; run the step again.
    Retry(String),
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub step_type: StepType,
    /// Node the step is bound to; the reboot target for NODE_REBOOT.
    pub node: Option<String>,
}

/// Decide the step type from the first activation unit and the bundle scopes.
pub fn classify(step: &Step) -> std::result::Result<Classification, String> {
    let reboot = step.has_reboot_bundles();

    let classification = if let Some(first) = step.activation_units.first() {
        match UnitClass::of(first) {
            Some(UnitClass::Node) => Classification {
                step_type: if reboot {
                    StepType::NodeReboot
                } else {
                    StepType::AuLock
                },
                node: Some(first.clone()),
            },
            Some(class @ (UnitClass::Unit | UnitClass::Component)) if reboot => {
                return Err(format!(
                    "reboot-scoped bundle cannot be applied through {class} activation unit {first}"
                ));
            }
            Some(UnitClass::Unit) => Classification {
                step_type: StepType::AuLock,
                node: step.target_node.clone(),
            },
            Some(UnitClass::Component) => Classification {
                step_type: StepType::AuRestart,
                node: step.target_node.clone(),
            },
            None => return Err(format!("unknown activation unit class: {first}")),
        }
    } else if !step.deactivation_units.is_empty() {
        Classification {
            step_type: StepType::AuLock,
            node: step.target_node.clone(),
        }
    } else if reboot {
        match &step.target_node {
            Some(node) => Classification {
                step_type: StepType::NodeReboot,
                node: Some(node.clone()),
            },
            None => return Err("reboot-scoped bundle without a target node".to_string()),
        }
    } else {
        Classification {
            step_type: StepType::SwInstall,
            node: step.target_node.clone(),
        }
    };

    let has_bundles = !step.bundles_add.is_empty() || !step.bundles_remove.is_empty();
    if has_bundles && step.nodes.is_empty() && classification.node.is_none() {
        return Err("bundles listed but no node to apply them on".to_string());
    }

    Ok(classification)
}

// ---------------------------------------------------------------------------
// SubOperation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubOperation {
    OnlineInstall { bundle: String, node: String },
    OnlineRemove { bundle: String, node: String },
    OfflineInstall { bundle: String, node: String },
    OfflineRemove { bundle: String, node: String },
    Lock(String),
    Terminate(String),
    Instantiate(String),
    Unlock(String),
    Restart(String),
    ActivationHook { phase: HookPhase, units: Vec<String> },
    ApplyModifications(Vec<ImmModification>),
    SetMaintenanceStatus(String),
    RebootNode(String),
    WaitNodeUp(String),
    CreateBundleRecord { bundle: String, node: String },
}

impl fmt::Display for SubOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubOperation::OnlineInstall { bundle, node } => {
                write!(f, "online_install {bundle}@{node}")
            }
            SubOperation::OnlineRemove { bundle, node } => {
                write!(f, "online_remove {bundle}@{node}")
            }
            SubOperation::OfflineInstall { bundle, node } => {
                write!(f, "offline_install {bundle}@{node}")
            }
            SubOperation::OfflineRemove { bundle, node } => {
                write!(f, "offline_remove {bundle}@{node}")
            }
            SubOperation::Lock(u) => write!(f, "lock {u}"),
            SubOperation::Terminate(u) => write!(f, "terminate {u}"),
            SubOperation::Instantiate(u) => write!(f, "instantiate {u}"),
            SubOperation::Unlock(u) => write!(f, "unlock {u}"),
            SubOperation::Restart(u) => write!(f, "restart {u}"),
            SubOperation::ActivationHook { phase, units } => {
                write!(f, "hook_{phase} {}", units.join(";"))
            }
            SubOperation::ApplyModifications(mods) => {
                write!(f, "apply_modifications ({})", mods.len())
            }
            SubOperation::SetMaintenanceStatus(u) => write!(f, "maintenance {u}"),
            SubOperation::RebootNode(n) => write!(f, "reboot {n}"),
            SubOperation::WaitNodeUp(n) => write!(f, "wait_node_up {n}"),
            SubOperation::CreateBundleRecord { bundle, node } => {
                write!(f, "create_record {bundle}@{node}")
            }
        }
    }
}

impl SubOperation {
    /// Run one cluster agent call or store update. Modifications are
    /// applied by the step itself, which tracks how far it got.
    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let agent = ctx.agent;
        let outcome: AgentResult = match self {
            SubOperation::OnlineInstall { bundle, node } => {
                agent.online_install(bundle, node, ctx.bundle_timeout)
            }
            SubOperation::OnlineRemove { bundle, node } => {
                agent.online_remove(bundle, node, ctx.bundle_timeout)
            }
            SubOperation::OfflineInstall { bundle, node } => {
                agent.offline_install(bundle, node, ctx.bundle_timeout)
            }
            SubOperation::OfflineRemove { bundle, node } => {
                agent.offline_remove(bundle, node, ctx.bundle_timeout)
            }
            SubOperation::Lock(u) => agent.lock(u),
            SubOperation::Terminate(u) => agent.terminate(u),
            SubOperation::Instantiate(u) => agent.instantiate(u),
            SubOperation::Unlock(u) => agent.unlock(u),
            SubOperation::Restart(u) => agent.restart(u),
            SubOperation::ActivationHook { phase, units } => agent.activation_hook(*phase, units),
            SubOperation::ApplyModifications(_) => Ok(()),
            SubOperation::SetMaintenanceStatus(u) => agent.set_maintenance_status(u),
            SubOperation::RebootNode(n) => agent.reboot_node(n),
            SubOperation::WaitNodeUp(n) => agent.wait_node_up(n, ctx.reboot_timeout),
            SubOperation::CreateBundleRecord { bundle, node } => {
                create_bundle_record(ctx.store, bundle, node).map_err(|e| e.to_string())
            }
        };
        outcome.map_err(|reason| self.failure(reason))
    }

    fn failure(&self, reason: String) -> SmfError {
        let text = self.to_string();
        let (operation, target) = text.split_once(' ').unwrap_or((text.as_str(), ""));
        SmfError::ExecutionFailure {
            operation: operation.to_string(),
            target: target.to_string(),
            reason,
        }
    }
}

/// Record that `bundle` is installed on `node`. A record left behind by an
/// earlier attempt is kept as is.
pub fn create_bundle_record(store: &dyn ObjectStore, bundle: &str, node: &str) -> Result<()> {
    let dn = bundle_record_dn(bundle, node);
    if store.exists(&dn)? {
        return Ok(());
    }
    let mut attrs = Attributes::new();
    attrs.insert("bundle".into(), bundle.into());
    attrs.insert("node".into(), node.into());
    store.create(&dn, attrs)
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

struct PlanBuilder<'a> {
    step: &'a Step,
    nodes: Vec<String>,
    ops: Vec<SubOperation>,
}

impl<'a> PlanBuilder<'a> {
    fn new(step: &'a Step) -> Self {
        Self {
            step,
            nodes: step.bundle_nodes(),
            ops: Vec::new(),
        }
    }

    fn per_bundle_node<F>(&mut self, bundles: &[&Bundle], make: F)
    where
        F: Fn(String, String) -> SubOperation,
    {
        for bundle in bundles {
            for node in &self.nodes {
                self.ops.push(make(bundle.dn.clone(), node.clone()));
            }
        }
    }

    fn online_install_added(&mut self) {
        let bundles: Vec<&Bundle> = self.step.bundles_add.iter().collect();
        self.per_bundle_node(&bundles, |bundle, node| SubOperation::OnlineInstall { bundle, node });
    }

    fn offline_remove_removed(&mut self) {
        let bundles: Vec<&Bundle> = self.step.bundles_remove.iter().collect();
        self.per_bundle_node(&bundles, |bundle, node| SubOperation::OfflineRemove { bundle, node });
    }

    fn offline_install_added(&mut self) {
        let bundles: Vec<&Bundle> = self.step.bundles_add.iter().collect();
        self.per_bundle_node(&bundles, |bundle, node| SubOperation::OfflineInstall { bundle, node });
    }

    fn create_records(&mut self) {
        let bundles: Vec<&Bundle> = self.step.bundles_add.iter().collect();
        self.per_bundle_node(&bundles, |bundle, node| SubOperation::CreateBundleRecord {
            bundle,
            node,
        });
    }

    fn modifications(&mut self) {
        if !self.step.modifications.is_empty() {
            self.ops
                .push(SubOperation::ApplyModifications(self.step.modifications.clone()));
        }
    }

    fn maintenance(&mut self) {
        for unit in &self.step.activation_units {
            self.ops.push(SubOperation::SetMaintenanceStatus(unit.clone()));
        }
    }

    fn deactivate(&mut self, hook: bool) {
        let units = &self.step.deactivation_units;
        if units.is_empty() {
            return;
        }
        if hook {
            self.ops.push(SubOperation::ActivationHook {
                phase: HookPhase::Deactivate,
                units: units.clone(),
            });
        } else {
            for u in units {
                self.ops.push(SubOperation::Lock(u.clone()));
            }
            for u in units {
                self.ops.push(SubOperation::Terminate(u.clone()));
            }
        }
    }

    fn activate(&mut self, hook: bool) {
        let units = &self.step.activation_units;
        if units.is_empty() {
            return;
        }
        if hook {
            self.ops.push(SubOperation::ActivationHook {
                phase: HookPhase::Activate,
                units: units.clone(),
            });
        } else {
            for u in units {
                self.ops.push(SubOperation::Instantiate(u.clone()));
            }
            for u in units {
                self.ops.push(SubOperation::Unlock(u.clone()));
            }
        }
    }

    fn restart(&mut self, hook: bool) {
        let units = &self.step.activation_units;
        if units.is_empty() {
            return;
        }
        if hook {
            self.ops.push(SubOperation::ActivationHook {
                phase: HookPhase::Restart,
                units: units.clone(),
            });
        } else {
            for u in units {
                self.ops.push(SubOperation::Restart(u.clone()));
            }
        }
    }

    fn reboot(&mut self, node: &str) {
        self.ops.push(SubOperation::RebootNode(node.to_string()));
        self.ops.push(SubOperation::WaitNodeUp(node.to_string()));
    }
}

impl Step {
    /// The ordered sub-operations for this step's type.
    pub fn plan(&self, activation_hook: bool) -> Result<Vec<SubOperation>> {
        let step_type = self.step_type.ok_or_else(|| SmfError::ClassificationFailure {
            step: self.dn.clone(),
            reason: "step has not been classified".to_string(),
        })?;

        let mut b = PlanBuilder::new(self);
        match step_type {
            StepType::SwInstall => {
                b.online_install_added();
                b.offline_remove_removed();
                b.modifications();
                b.offline_install_added();
                b.create_records();
            }
            StepType::AuLock => {
                b.online_install_added();
                b.deactivate(activation_hook);
                b.offline_remove_removed();
                b.modifications();
                b.maintenance();
                b.offline_install_added();
                b.create_records();
                b.activate(activation_hook);
            }
            StepType::AuRestart => {
                b.online_install_added();
                b.modifications();
                b.maintenance();
                b.offline_install_added();
                b.create_records();
                b.restart(activation_hook);
            }
            StepType::NodeReboot => {
                let node = self.target_node.clone().ok_or_else(|| {
                    SmfError::ClassificationFailure {
                        step: self.dn.clone(),
                        reason: "node reboot step without target node".to_string(),
                    }
                })?;
                b.online_install_added();
                b.deactivate(activation_hook);
                b.offline_remove_removed();
                b.modifications();
                b.maintenance();

                let reboot_removed: Vec<&Bundle> = self
                    .bundles_remove
                    .iter()
                    .filter(|bundle| bundle.remove_needs_reboot())
                    .collect();
                if !reboot_removed.is_empty() {
                    b.per_bundle_node(&reboot_removed, |bundle, node| {
                        SubOperation::OnlineRemove { bundle, node }
                    });
                    b.reboot(&node);
                }

                b.offline_install_added();
                b.create_records();
                if self.bundles_add.iter().any(Bundle::install_needs_reboot) {
                    b.reboot(&node);
                }
                b.activate(activation_hook);
            }
        }
        Ok(b.ops)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    pub fn transition_to(&mut self, next: StepState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            debug_assert!(
                false,
                "invalid step transition {} -> {next} on {}",
                self.state, self.dn
            );
            return Err(SmfError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
                reason: format!("not a legal step transition for {}", self.dn),
            });
        }
        debug!(step = %self.dn, from = %self.state, to = %next, "step transition");
        self.state = next;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Drive the step from its current state.
    pub fn execute(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        match self.state {
            StepState::Initial => self.execute_initial(ctx),
            StepState::Executing => self.execute_executing(ctx),
            StepState::Completed => Ok(StepOutcome::Completed),
            StepState::Failed => Ok(StepOutcome::Failed(format!(
                "step {} has already failed",
                self.dn
            ))),
        }
    }

    fn execute_initial(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let classification = match classify(self) {
            Ok(c) => c,
            Err(reason) => {
                warn!(step = %self.dn, %reason, "step classification failed");
                self.transition_to(StepState::Failed)?;
                let failure = SmfError::ClassificationFailure {
                    step: self.dn.clone(),
                    reason,
                };
                return Ok(StepOutcome::Failed(failure.to_string()));
            }
        };

        self.step_type = Some(classification.step_type);
        if let Some(node) = classification.node {
            self.target_node = Some(node);
        }

        if self.step_type == Some(StepType::NodeReboot)
            && self.target_node.as_deref() == Some(ctx.local_node)
        {
            info!(step = %self.dn, node = ctx.local_node, "step reboots local node, switchover required");
            self.switch_over = true;
            return Ok(StepOutcome::SwitchOverRequired);
        }

        self.switch_over = false;
        self.transition_to(StepState::Executing)?;
        self.execute_executing(ctx)
    }

    fn execute_executing(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let plan = self.plan(ctx.activation_hook)?;
        info!(
            step = %self.dn,
            step_type = ?self.step_type,
            operations = plan.len(),
            attempt = self.retry_count + 1,
            "executing step"
        );

        for op in &plan {
            debug!(step = %self.dn, op = %op, "sub-operation");
            let result = match op {
                SubOperation::ApplyModifications(mods) => self.apply_modifications(mods, ctx),
                _ => op.run(ctx),
            };
            if let Err(err) = result {
                let reason = err.to_string();
                if self.retry_count < self.max_retry {
                    self.retry_count += 1;
                    warn!(
                        step = %self.dn,
                        %reason,
                        retry = self.retry_count,
                        max_retry = self.max_retry,
                        "sub-operation failed, retrying step"
                    );
                    return Ok(StepOutcome::Retry(reason));
                }
                warn!(step = %self.dn, %reason, "step failed");
                self.transition_to(StepState::Failed)?;
                return Ok(StepOutcome::Failed(reason));
            }
        }

        self.transition_to(StepState::Completed)?;
        Ok(StepOutcome::Completed)
    }

    /// Apply the modifications not yet applied by an earlier attempt.
    fn apply_modifications(&mut self, mods: &[ImmModification], ctx: &StepContext<'_>) -> Result<()> {
        for m in mods.iter().skip(self.applied_modifications) {
            m.apply(ctx.store).map_err(|e| SmfError::ExecutionFailure {
                operation: "apply_modification".to_string(),
                target: m.to_string(),
                reason: e.to_string(),
            })?;
            self.applied_modifications += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
