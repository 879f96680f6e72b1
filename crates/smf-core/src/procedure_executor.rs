//! Procedure executor task.
//!
//! One task per active procedure. On start it attaches a store session for
//! the procedure DN (refresh callbacks land in the same mailbox as control
//! events) and creates or reloads the persisted procedure. Steps run one per
//! `ExecuteStep` event, which the executor posts to itself, so SUSPEND and
//! TERMINATE are seen between steps. Step bodies and other cluster agent
//! calls block, so they run on the blocking pool. When the procedure settles
//! the executor reports to the campaign and exits, handing the procedure back
//! through its join handle.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentResult, ClusterAgent};
use crate::campaign_executor::CampaignEvent;
use crate::dn::bundle_record_dn;
use crate::error::{Result, SmfError};
use crate::executor::{spawn_executor, ExecutorHandle};
use crate::mailbox::{Mailbox, MailboxSender, Priority};
use crate::notify::SourceIndicator;
use crate::orchestrator::OrchestratorContext;
use crate::procedure::{Direction, Procedure};
use crate::step_machine::StepOutcome;
use crate::store::StoreCallback;
use crate::types::ProcedureState;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureEvent {
    Execute,
    Rollback,
    Suspend,
    Terminate,
    ExecuteStep,
    RollbackStep,
    StoreCallback(StoreCallback),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureOutcome {
    Completed,
    Suspended,
    Failed(String),
    /// A step must reboot the orchestrator's own node; the peer takes over.
    SwitchOver,
    RolledBack,
    RollbackSuspended,
    RollbackFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureReport {
    pub index: usize,
    pub dn: String,
    pub outcome: ProcedureOutcome,
}

pub type ProcedureHandle = ExecutorHandle<ProcedureEvent, Procedure>;

/// Start the executor for the `index`-th procedure of a campaign. Returns
/// once the procedure object has been created or reloaded.
pub async fn start(
    ctx: Arc<OrchestratorContext>,
    index: usize,
    mut procedure: Procedure,
    report_to: MailboxSender<CampaignEvent>,
) -> Result<ProcedureHandle> {
    let name = format!("smf-proc-{}", procedure.name);
    spawn_executor(&name, move |mut mailbox: Mailbox<ProcedureEvent>, rv| async move {
        let sink = mailbox.sender();
        let session = match ctx.store.attach(
            &procedure.dn,
            Box::new(move |cb| {
                sink.send(ProcedureEvent::StoreCallback(cb), Priority::Normal);
            }),
        ) {
            Ok(id) => id,
            Err(e) => {
                rv.failed(e);
                return procedure;
            }
        };

        if let Err(e) = procedure.load_or_create(ctx.store.as_ref()) {
            ctx.store.detach(session);
            rv.failed(e);
            return procedure;
        }

        rv.ready();

        let mut runner = ProcedureRunner {
            ctx: ctx.clone(),
            procedure,
            index,
            self_tx: mailbox.sender(),
            report_to,
            running: true,
            suspend_requested: false,
        };
        while runner.running {
            let Some(event) = mailbox.recv().await else {
                break;
            };
            runner.handle(event).await;
        }

        ctx.store.detach(session);
        debug!(procedure = %runner.procedure.dn, "procedure executor stopped");
        runner.procedure
    })
    .await
}

/// Run a blocking cluster agent call on the blocking pool. A failure comes
/// back as an `ExecutionFailure` naming `operation` and `target`.
async fn agent_call<F>(
    agent: Arc<dyn ClusterAgent>,
    operation: &str,
    target: &str,
    call: F,
) -> Result<()>
where
    F: FnOnce(&dyn ClusterAgent) -> AgentResult + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || call(agent.as_ref()))
        .await
        .unwrap_or_else(|e| Err(e.to_string()));
    outcome.map_err(|reason| SmfError::ExecutionFailure {
        operation: operation.to_string(),
        target: target.to_string(),
        reason,
    })
}

struct ProcedureRunner {
    ctx: Arc<OrchestratorContext>,
    procedure: Procedure,
    index: usize,
    self_tx: MailboxSender<ProcedureEvent>,
    report_to: MailboxSender<CampaignEvent>,
    running: bool,
    suspend_requested: bool,
}

impl ProcedureRunner {
    async fn handle(&mut self, event: ProcedureEvent) {
        let direction = match event {
            ProcedureEvent::Rollback | ProcedureEvent::RollbackStep => Direction::Rollback,
            _ if self.procedure.is_rolling_back() => Direction::Rollback,
            _ => Direction::Forward,
        };
        let result = match event {
            ProcedureEvent::Execute => self.on_execute(),
            ProcedureEvent::Rollback => self.on_rollback(),
            ProcedureEvent::ExecuteStep => self.on_step(Direction::Forward).await,
            ProcedureEvent::RollbackStep => self.on_step(Direction::Rollback).await,
            ProcedureEvent::Suspend => {
                self.suspend_requested = true;
                Ok(())
            }
            ProcedureEvent::Terminate => {
                self.running = false;
                Ok(())
            }
            ProcedureEvent::StoreCallback(cb) => self.on_store_callback(cb),
        };
        if let Err(e) = result {
            error!(procedure = %self.procedure.dn, error = %e, "procedure event failed");
            self.fail(direction, e.to_string());
        }
    }

    fn set_state(&mut self, state: ProcedureState, source: SourceIndicator) -> Result<()> {
        self.procedure.set_state(
            self.ctx.store.as_ref(),
            self.ctx.notifier.as_ref(),
            state,
            source,
        )
    }

    fn post(&self, event: ProcedureEvent) {
        self.self_tx.send(event, Priority::Normal);
    }

    /// Report to the campaign and leave the event loop.
    fn finish(&mut self, outcome: ProcedureOutcome) {
        info!(procedure = %self.procedure.dn, outcome = ?outcome, "procedure settled");
        let report = ProcedureReport {
            index: self.index,
            dn: self.procedure.dn.clone(),
            outcome,
        };
        if !self
            .report_to
            .send(CampaignEvent::ProcedureResult(report), Priority::Normal)
        {
            warn!(procedure = %self.procedure.dn, "campaign executor gone, result dropped");
        }
        self.running = false;
    }

    fn fail(&mut self, dir: Direction, reason: String) {
        let (state, outcome) = match dir {
            Direction::Forward => (
                ProcedureState::Failed,
                ProcedureOutcome::Failed(reason.clone()),
            ),
            Direction::Rollback => (
                ProcedureState::RollbackFailed,
                ProcedureOutcome::RollbackFailed(reason.clone()),
            ),
        };
        self.procedure.error = Some(reason);
        let persisted = self
            .procedure
            .persist_attr(self.ctx.store.as_ref(), "error")
            .and_then(|_| self.set_state(state, SourceIndicator::ObjectOperation));
        if let Err(e) = persisted {
            error!(procedure = %self.procedure.dn, error = %e, "failed to persist procedure failure");
        }
        self.finish(outcome);
    }

    // -----------------------------------------------------------------------
    // Control events
    // -----------------------------------------------------------------------

    fn on_execute(&mut self) -> Result<()> {
        match self.procedure.state {
            ProcedureState::Initial | ProcedureState::Suspended => {
                self.set_state(ProcedureState::Executing, SourceIndicator::ObjectOperation)?;
                self.post(ProcedureEvent::ExecuteStep);
            }
            // Interrupted run, resumed after restart or switchover.
            ProcedureState::Executing => self.post(ProcedureEvent::ExecuteStep),
            ProcedureState::Completed => self.finish(ProcedureOutcome::Completed),
            other => {
                return Err(SmfError::BadOperation(format!(
                    "procedure {} cannot execute in state {other}",
                    self.procedure.dn
                )))
            }
        }
        Ok(())
    }

    fn on_rollback(&mut self) -> Result<()> {
        match self.procedure.state {
            ProcedureState::Executing
            | ProcedureState::Suspended
            | ProcedureState::Completed
            | ProcedureState::Failed => {
                self.procedure.build_rollback_steps();
                self.procedure
                    .persist_rollback_plan(self.ctx.store.as_ref())?;
                info!(
                    procedure = %self.procedure.dn,
                    steps = self.procedure.rollback_steps.len(),
                    "rolling back procedure"
                );
                self.set_state(ProcedureState::RollingBack, SourceIndicator::ManagementOperation)?;
                self.post(ProcedureEvent::RollbackStep);
            }
            ProcedureState::RollbackSuspended => {
                self.set_state(ProcedureState::RollingBack, SourceIndicator::ManagementOperation)?;
                self.post(ProcedureEvent::RollbackStep);
            }
            ProcedureState::RollingBack => self.post(ProcedureEvent::RollbackStep),
            ProcedureState::Initial | ProcedureState::RolledBack => {
                self.finish(ProcedureOutcome::RolledBack)
            }
            ProcedureState::RollbackFailed => {
                let reason = self
                    .procedure
                    .error
                    .clone()
                    .unwrap_or_else(|| "rollback previously failed".to_string());
                self.finish(ProcedureOutcome::RollbackFailed(reason))
            }
        }
        Ok(())
    }

    fn on_store_callback(&mut self, cb: StoreCallback) -> Result<()> {
        let StoreCallback::RuntimeUpdate { dn, attribute } = cb;
        if dn != self.procedure.dn {
            debug!(procedure = %self.procedure.dn, %dn, "callback for foreign object ignored");
            return Ok(());
        }
        match attribute.as_str() {
            "state" | "current_step" | "rollback_step" | "error" => {
                debug!(procedure = %dn, %attribute, "refreshing runtime attribute");
                self.procedure
                    .persist_attr(self.ctx.store.as_ref(), &attribute)
            }
            _ => {
                debug!(procedure = %dn, %attribute, "no such runtime attribute");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn step_event(dir: Direction) -> ProcedureEvent {
        match dir {
            Direction::Forward => ProcedureEvent::ExecuteStep,
            Direction::Rollback => ProcedureEvent::RollbackStep,
        }
    }

    async fn on_step(&mut self, dir: Direction) -> Result<()> {
        if self.suspend_requested {
            self.suspend_requested = false;
            let (state, outcome) = match dir {
                Direction::Forward => (ProcedureState::Suspended, ProcedureOutcome::Suspended),
                Direction::Rollback => (
                    ProcedureState::RollbackSuspended,
                    ProcedureOutcome::RollbackSuspended,
                ),
            };
            self.set_state(state, SourceIndicator::ManagementOperation)?;
            self.finish(outcome);
            return Ok(());
        }

        let cursor = self.procedure.cursor(dir);
        let Some(mut step) = self.procedure.steps(dir).get(cursor).cloned() else {
            return self.wrap_up(dir).await;
        };
        let step_dn = step.dn.clone();
        let ctx = self.ctx.clone();
        let task_ctx = ctx.clone();
        let (step, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = step.execute(&task_ctx.step_context());
            (step, outcome)
        })
        .await
        .map_err(|e| SmfError::ExecutionFailure {
            operation: "step".to_string(),
            target: step_dn.clone(),
            reason: e.to_string(),
        })?;
        if let Some(slot) = self.procedure.current_mut(dir) {
            *slot = step;
        }
        self.procedure.persist_step(ctx.store.as_ref(), dir, cursor)?;

        match outcome? {
            StepOutcome::Completed => {
                debug!(step = %step_dn, "step completed");
                let attr = match dir {
                    Direction::Forward => {
                        self.procedure.current_step += 1;
                        "current_step"
                    }
                    Direction::Rollback => {
                        self.procedure.rollback_step += 1;
                        "rollback_step"
                    }
                };
                self.procedure.persist_attr(ctx.store.as_ref(), attr)?;
                self.post(Self::step_event(dir));
            }
            StepOutcome::Retry(reason) => {
                debug!(step = %step_dn, %reason, "re-running step");
                self.post(Self::step_event(dir));
            }
            StepOutcome::Failed(reason) => {
                self.fail(dir, format!("step {step_dn} failed: {reason}"));
            }
            StepOutcome::SwitchOverRequired => {
                let node = ctx.config.node.clone();
                info!(step = %step_dn, %node, "requesting orchestrator switchover");
                let target = node.clone();
                let switched = agent_call(ctx.agent.clone(), "switch_over", &node, move |agent| {
                    agent.switch_over(&target)
                })
                .await;
                match switched {
                    Ok(()) => self.finish(ProcedureOutcome::SwitchOver),
                    Err(e) => self.fail(dir, e.to_string()),
                }
            }
        }
        Ok(())
    }

    /// All steps done: online-remove the removed bundles once and delete
    /// their installation records. Bundles a node reboot step already
    /// removed only lose their record.
    async fn wrap_up(&mut self, dir: Direction) -> Result<()> {
        let ctx = self.ctx.clone();
        let timeout = ctx.config.bundle_timeout();
        for removal in Procedure::removed_bundles(self.procedure.steps(dir)) {
            let target = format!("{}@{}", removal.bundle, removal.node);
            if removal.removed_by_step {
                debug!(procedure = %self.procedure.dn, %target, "removed before reboot");
            } else {
                debug!(procedure = %self.procedure.dn, %target, "online remove");
                let (bundle, node) = (removal.bundle.clone(), removal.node.clone());
                let removed = agent_call(ctx.agent.clone(), "online_remove", &target, move |agent| {
                    agent.online_remove(&bundle, &node, timeout)
                })
                .await;
                if let Err(e) = removed {
                    self.fail(dir, e.to_string());
                    return Ok(());
                }
            }
            ctx.store
                .delete(&bundle_record_dn(&removal.bundle, &removal.node))?;
        }

        let (state, outcome) = match dir {
            Direction::Forward => (ProcedureState::Completed, ProcedureOutcome::Completed),
            Direction::Rollback => (ProcedureState::RolledBack, ProcedureOutcome::RolledBack),
        };
        self.set_state(state, SourceIndicator::ObjectOperation)?;
        self.finish(outcome);
        Ok(())
    }
}
