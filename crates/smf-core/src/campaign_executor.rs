//! Campaign executor task and the process-wide executor slot.
//!
//! At most one campaign executor exists at a time. The executor owns the
//! campaign's event loop: admin operations arrive as events, and the executor
//! drives procedures one at a time by starting a procedure executor and
//! waiting for its `ProcedureResult`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::campaign::Campaign;
use crate::error::{Result, SmfError};
use crate::executor::{spawn_executor, ExecutorHandle};
use crate::mailbox::{Mailbox, MailboxSender, Priority};
use crate::notify::SourceIndicator;
use crate::orchestrator::OrchestratorContext;
use crate::procedure::Procedure;
use crate::procedure_executor::{self, ProcedureEvent, ProcedureHandle, ProcedureOutcome, ProcedureReport};
use crate::types::{AdminOperation, CampaignState};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CampaignEvent {
    Execute,
    Suspend,
    Commit,
    Rollback,
    Terminate,
    ExecuteInit,
    ExecuteProc,
    ExecuteWrapup,
    RollbackProc,
    RollbackWrapup,
    ErrorDetected(String),
    ProcedureResult(ProcedureReport),
}

impl CampaignEvent {
    pub fn from_admin(op: AdminOperation) -> Self {
        match op {
            AdminOperation::Execute => CampaignEvent::Execute,
            AdminOperation::Suspend => CampaignEvent::Suspend,
            AdminOperation::Commit => CampaignEvent::Commit,
            AdminOperation::Rollback => CampaignEvent::Rollback,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            CampaignEvent::Suspend | CampaignEvent::Terminate | CampaignEvent::ErrorDetected(_) => {
                Priority::High
            }
            _ => Priority::Normal,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CampaignEvent::Execute => "execute",
            CampaignEvent::Suspend => "suspend",
            CampaignEvent::Commit => "commit",
            CampaignEvent::Rollback => "rollback",
            CampaignEvent::Terminate => "terminate",
            CampaignEvent::ExecuteInit => "execute_init",
            CampaignEvent::ExecuteProc => "execute_proc",
            CampaignEvent::ExecuteWrapup => "execute_wrapup",
            CampaignEvent::RollbackProc => "rollback_proc",
            CampaignEvent::RollbackWrapup => "rollback_wrapup",
            CampaignEvent::ErrorDetected(_) => "error_detected",
            CampaignEvent::ProcedureResult(_) => "procedure_result",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct Load {
    pending: usize,
    closed: bool,
}

/// Counts events in flight plus the running procedure, so callers can wait
/// until the executor has nothing left to do.
pub struct WorkTracker {
    load: watch::Sender<Load>,
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self {
            load: watch::channel(Load::default()).0,
        }
    }
}

impl WorkTracker {
    fn begin(&self) {
        self.load.send_modify(|l| l.pending += 1);
    }

    fn end(&self) {
        self.load
            .send_modify(|l| l.pending = l.pending.saturating_sub(1));
    }

    fn close(&self) {
        self.load.send_modify(|l| {
            l.pending = 0;
            l.closed = true;
        });
    }

    /// Wait until no work is pending or the executor has exited.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.load.subscribe();
        let idle = rx.wait_for(|l| l.pending == 0 || l.closed);
        let idle_reached = matches!(tokio::time::timeout(timeout, idle).await, Ok(Ok(_)));
        idle_reached
    }
}

// ---------------------------------------------------------------------------
// CampaignExecutor
// ---------------------------------------------------------------------------

pub struct CampaignExecutor {
    campaign: String,
    id: u64,
    handle: ExecutorHandle<CampaignEvent>,
    work: Arc<WorkTracker>,
}

impl CampaignExecutor {
    /// Start the executor task for `campaign`. Refused while `occupant` is
    /// still running; otherwise returns once the new mailbox exists.
    pub async fn start(
        ctx: Arc<OrchestratorContext>,
        campaign: Arc<Mutex<Campaign>>,
        slot: Arc<ExecutorSlot>,
        occupant: Option<&CampaignExecutor>,
    ) -> Result<Self> {
        if let Some(active) = occupant.filter(|e| !e.is_finished()) {
            return Err(SmfError::ExecutorAlreadyRunning(active.campaign.clone()));
        }
        let dn = lock_campaign(&campaign).dn.clone();
        let id = slot.next_id();
        let work = Arc::new(WorkTracker::default());
        let task_work = work.clone();
        let task_dn = dn.clone();

        let handle = spawn_executor("smf-campaign", move |mut mailbox: Mailbox<CampaignEvent>, rv| async move {
            rv.ready();
            if let Err(e) = ctx.notifier.open_session() {
                warn!(campaign = %task_dn, error = %e, "notification session unavailable");
            }
            info!(campaign = %task_dn, "campaign executor started");

            let mut runner = CampaignRunner {
                ctx: ctx.clone(),
                campaign,
                dn: task_dn.clone(),
                self_tx: mailbox.sender(),
                work: task_work.clone(),
                active: None,
                running: true,
                suspend_requested: false,
            };
            while runner.running {
                let Some(event) = mailbox.recv().await else {
                    break;
                };
                runner.handle(event).await;
                task_work.end();
            }
            // Refuse further events; the orchestrator then starts a new executor.
            mailbox.close();
            runner.stop_procedure().await;

            ctx.notifier.close_session();
            task_work.close();
            let released = tokio::task::spawn_blocking(move || slot.release(id)).await;
            if let Err(e) = released {
                error!(campaign = %task_dn, error = %e, "executor slot not released");
            }
            info!(campaign = %task_dn, "campaign executor stopped");
        })
        .await?;

        Ok(Self {
            campaign: dn,
            id,
            handle,
            work,
        })
    }

    pub fn campaign(&self) -> &str {
        &self.campaign
    }

    pub fn post(&self, event: CampaignEvent) -> Result<()> {
        let priority = event.priority();
        self.work.begin();
        self.handle.post(event, priority).inspect_err(|_| self.work.end())
    }

    pub fn work(&self) -> Arc<WorkTracker> {
        self.work.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Terminate the executor and wait for its task.
    pub async fn stop(&mut self) {
        self.handle.stop(CampaignEvent::Terminate).await;
    }
}

fn lock_campaign(campaign: &Mutex<Campaign>) -> MutexGuard<'_, Campaign> {
    campaign.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// ExecutorSlot
// ---------------------------------------------------------------------------

/// Holds the single active campaign executor.
#[derive(Default)]
pub struct ExecutorSlot {
    active: Mutex<Option<CampaignExecutor>>,
    next_id: AtomicU64,
}

impl ExecutorSlot {
    pub fn lock(&self) -> MutexGuard<'_, Option<CampaignExecutor>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn active_campaign(&self) -> Option<String> {
        self.lock().as_ref().map(|e| e.campaign.clone())
    }

    /// Remove the executor, leaving the slot free. The caller stops it.
    pub fn take(&self) -> Option<CampaignExecutor> {
        self.lock().take()
    }

    /// Called by an exiting executor task. Clears the slot only if it still
    /// holds that executor.
    fn release(&self, id: u64) {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|e| e.id == id) {
            *active = None;
            debug!(id, "executor slot released");
        }
    }
}

// ---------------------------------------------------------------------------
// CampaignRunner
// ---------------------------------------------------------------------------

/// What `EXECUTE_PROC` / `ROLLBACK_PROC` should do next.
enum NextProcedure {
    /// The campaign left the expected state in the meantime.
    Skip,
    Run(usize, Procedure),
    Done,
}

struct CampaignRunner {
    ctx: Arc<OrchestratorContext>,
    campaign: Arc<Mutex<Campaign>>,
    dn: String,
    self_tx: MailboxSender<CampaignEvent>,
    work: Arc<WorkTracker>,
    active: Option<(usize, ProcedureHandle)>,
    running: bool,
    suspend_requested: bool,
}

impl CampaignRunner {
    fn campaign(&self) -> MutexGuard<'_, Campaign> {
        lock_campaign(&self.campaign)
    }

    fn post(&self, event: CampaignEvent) {
        let priority = event.priority();
        self.work.begin();
        if !self.self_tx.send(event, priority) {
            self.work.end();
        }
    }

    async fn handle(&mut self, event: CampaignEvent) {
        let name = event.name();
        debug!(campaign = %self.dn, event = name, "campaign event");
        let result = match event {
            CampaignEvent::Execute => self.on_execute(),
            CampaignEvent::Suspend => self.on_suspend(),
            CampaignEvent::Commit => self.on_commit(),
            CampaignEvent::Rollback => self.on_rollback(),
            CampaignEvent::Terminate => {
                self.running = false;
                Ok(())
            }
            CampaignEvent::ExecuteInit => self.on_execute_init(),
            CampaignEvent::ExecuteProc => self.on_execute_proc().await,
            CampaignEvent::ExecuteWrapup => self.on_wrapup(CampaignState::Executing),
            CampaignEvent::RollbackProc => self.on_rollback_proc().await,
            CampaignEvent::RollbackWrapup => self.on_wrapup(CampaignState::RollingBack),
            CampaignEvent::ErrorDetected(reason) => self.on_error_detected(&reason),
            CampaignEvent::ProcedureResult(report) => self.on_procedure_result(report).await,
        };
        if let Err(e) = result {
            error!(campaign = %self.dn, event = name, error = %e, "campaign event failed");
            self.fail(e.to_string());
        }
    }

    /// Move a running campaign to its failed state and end the executor.
    fn fail(&self, reason: String) {
        let persisted = {
            let mut c = self.campaign();
            let failed = match c.state {
                CampaignState::Executing => CampaignState::ExecutionFailed,
                CampaignState::RollingBack => CampaignState::RollbackFailed,
                _ => return,
            };
            c.set_error(&self.ctx, Some(reason))
                .and_then(|_| c.set_state(&self.ctx, failed, SourceIndicator::ObjectOperation))
        };
        if let Err(e) = persisted {
            error!(campaign = %self.dn, error = %e, "failed to persist campaign failure");
        }
        self.post(CampaignEvent::Terminate);
    }

    /// Skip admin events that are no longer legal by the time they are
    /// dequeued, e.g. a duplicate EXECUTE.
    fn still_allowed(&self, op: AdminOperation) -> bool {
        match self.campaign().check_admin_operation(op) {
            Ok(()) => true,
            Err(e) => {
                warn!(campaign = %self.dn, op = %op, error = %e, "admin event ignored");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Admin events
    // -----------------------------------------------------------------------

    fn on_execute(&mut self) -> Result<()> {
        if !self.still_allowed(AdminOperation::Execute) {
            return Ok(());
        }
        let (started, from) = {
            let mut c = self.campaign();
            let from = c.state;
            (c.admin_op_execute(&self.ctx)?, from)
        };
        self.suspend_requested = false;
        match (started, from) {
            // Nothing to run; free the executor slot.
            (false, _) => self.post(CampaignEvent::Terminate),
            (true, CampaignState::Initial) => self.post(CampaignEvent::ExecuteInit),
            (true, _) => self.post(CampaignEvent::ExecuteProc),
        }
        Ok(())
    }

    fn on_suspend(&mut self) -> Result<()> {
        if !self.still_allowed(AdminOperation::Suspend) {
            return Ok(());
        }
        if let Some((_, handle)) = &self.active {
            // The procedure stops at its next step boundary and reports. If it
            // already exited, its queued result sees `suspend_requested`.
            self.suspend_requested = true;
            let _ = handle.post(ProcedureEvent::Suspend, Priority::High);
            return Ok(());
        }
        let mut c = self.campaign();
        let suspended = match c.state {
            CampaignState::RollingBack => CampaignState::RollbackSuspended,
            _ => CampaignState::ExecutionSuspended,
        };
        c.set_state(&self.ctx, suspended, SourceIndicator::ManagementOperation)
    }

    fn on_commit(&mut self) -> Result<()> {
        if !self.still_allowed(AdminOperation::Commit) {
            return Ok(());
        }
        self.campaign().commit(&self.ctx)?;
        self.post(CampaignEvent::Terminate);
        Ok(())
    }

    fn on_rollback(&mut self) -> Result<()> {
        if !self.still_allowed(AdminOperation::Rollback) {
            return Ok(());
        }
        self.campaign().begin_rollback(&self.ctx)?;
        self.suspend_requested = false;
        // With a procedure still winding down after an error, rollback
        // starts when its result arrives.
        if self.active.is_none() {
            self.post(CampaignEvent::RollbackProc);
        }
        Ok(())
    }

    fn on_error_detected(&mut self, reason: &str) -> Result<()> {
        {
            let mut c = self.campaign();
            if !c.state.is_running() {
                warn!(campaign = %self.dn, state = %c.state, "error report ignored");
                return Ok(());
            }
            c.error_detected(&self.ctx, reason)?;
        }
        if let Some((_, handle)) = &self.active {
            let _ = handle.post(ProcedureEvent::Suspend, Priority::High);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal events
    // -----------------------------------------------------------------------

    fn on_execute_init(&mut self) -> Result<()> {
        let count = {
            let mut c = self.campaign();
            if c.state != CampaignState::Executing {
                return Ok(());
            }
            c.ensure_procedures(&self.ctx)?;
            c.procedures().len()
        };
        info!(campaign = %self.dn, procedures = count, "campaign initialised");
        self.post(CampaignEvent::ExecuteProc);
        Ok(())
    }

    fn next_procedure(&self, expected: CampaignState) -> Result<NextProcedure> {
        let mut c = self.campaign();
        if c.state != expected {
            return Ok(NextProcedure::Skip);
        }
        c.ensure_procedures(&self.ctx)?;
        let next = match expected {
            CampaignState::RollingBack => c.next_rollback_procedure(),
            _ => c.next_procedure(),
        };
        Ok(match next {
            Some(i) => NextProcedure::Run(i, c.procedures()[i].clone()),
            None => NextProcedure::Done,
        })
    }

    async fn on_execute_proc(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        match self.next_procedure(CampaignState::Executing)? {
            NextProcedure::Skip => Ok(()),
            NextProcedure::Run(index, procedure) => {
                self.start_procedure(index, procedure, ProcedureEvent::Execute)
                    .await
            }
            NextProcedure::Done => {
                self.post(CampaignEvent::ExecuteWrapup);
                Ok(())
            }
        }
    }

    async fn on_rollback_proc(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        match self.next_procedure(CampaignState::RollingBack)? {
            NextProcedure::Skip => Ok(()),
            NextProcedure::Run(index, procedure) => {
                self.start_procedure(index, procedure, ProcedureEvent::Rollback)
                    .await
            }
            NextProcedure::Done => {
                self.post(CampaignEvent::RollbackWrapup);
                Ok(())
            }
        }
    }

    fn on_wrapup(&mut self, expected: CampaignState) -> Result<()> {
        let mut c = self.campaign();
        if c.state != expected {
            return Ok(());
        }
        let done = match expected {
            CampaignState::RollingBack => CampaignState::RollbackCompleted,
            _ => CampaignState::ExecutionCompleted,
        };
        c.set_state(&self.ctx, done, SourceIndicator::ObjectOperation)?;
        info!(campaign = %self.dn, elapsed = ?c.elapsed(), "campaign {done}");
        Ok(())
    }

    async fn start_procedure(
        &mut self,
        index: usize,
        procedure: Procedure,
        first: ProcedureEvent,
    ) -> Result<()> {
        info!(campaign = %self.dn, procedure = %procedure.dn, event = ?first, "starting procedure");
        self.work.begin();
        let started = procedure_executor::start(
            self.ctx.clone(),
            index,
            procedure,
            self.self_tx.clone(),
        )
        .await;
        let handle = match started {
            Ok(h) => h,
            Err(e) => {
                self.work.end();
                return Err(e);
            }
        };
        let posted = handle.post(first, Priority::Normal);
        self.active = Some((index, handle));
        if posted.is_err() {
            self.stop_procedure().await;
        }
        posted
    }

    async fn on_procedure_result(&mut self, report: ProcedureReport) -> Result<()> {
        let procedure = match self.active.take() {
            Some((index, mut handle)) if index == report.index => handle.join().await,
            other => {
                self.active = other;
                warn!(campaign = %self.dn, procedure = %report.dn, "unexpected procedure result");
                return Ok(());
            }
        };
        let procedure = procedure.ok_or_else(|| SmfError::ExecutorGone(report.dn.clone()))?;
        let suspend = std::mem::take(&mut self.suspend_requested);

        if let Some(event) = self.settle_procedure(report, procedure, suspend)? {
            self.post(event);
        }
        Ok(())
    }

    /// Fold a finished procedure back into the campaign and pick the
    /// campaign's next event.
    fn settle_procedure(
        &self,
        report: ProcedureReport,
        procedure: Procedure,
        suspend: bool,
    ) -> Result<Option<CampaignEvent>> {
        let mut c = self.campaign();
        c.replace_procedure(report.index, procedure);
        let state = c.state;

        let next = match report.outcome {
            ProcedureOutcome::Completed => match state {
                CampaignState::Executing if suspend => {
                    c.set_state(&self.ctx, CampaignState::ExecutionSuspended, SourceIndicator::ManagementOperation)?;
                    None
                }
                CampaignState::Executing => Some(CampaignEvent::ExecuteProc),
                CampaignState::RollingBack => Some(CampaignEvent::RollbackProc),
                _ => None,
            },
            ProcedureOutcome::Suspended => match state {
                CampaignState::Executing => {
                    c.set_state(&self.ctx, CampaignState::ExecutionSuspended, SourceIndicator::ManagementOperation)?;
                    None
                }
                CampaignState::RollingBack => Some(CampaignEvent::RollbackProc),
                _ => None,
            },
            ProcedureOutcome::Failed(reason) => match state {
                CampaignState::Executing => {
                    c.set_error(&self.ctx, Some(reason))?;
                    c.set_state(&self.ctx, CampaignState::ExecutionFailed, SourceIndicator::ObjectOperation)?;
                    // No admin operation leaves EXECUTION_FAILED.
                    Some(CampaignEvent::Terminate)
                }
                CampaignState::RollingBack => Some(CampaignEvent::RollbackProc),
                // Keep the detected error as the campaign's reason.
                _ => None,
            },
            ProcedureOutcome::SwitchOver => {
                info!(campaign = %self.dn, "switchover requested, stopping executor");
                Some(CampaignEvent::Terminate)
            }
            ProcedureOutcome::RolledBack => match state {
                CampaignState::RollingBack if suspend => {
                    c.set_state(&self.ctx, CampaignState::RollbackSuspended, SourceIndicator::ManagementOperation)?;
                    None
                }
                CampaignState::RollingBack => Some(CampaignEvent::RollbackProc),
                _ => None,
            },
            ProcedureOutcome::RollbackSuspended => {
                if state == CampaignState::RollingBack {
                    c.set_state(&self.ctx, CampaignState::RollbackSuspended, SourceIndicator::ManagementOperation)?;
                }
                None
            }
            ProcedureOutcome::RollbackFailed(reason) => {
                if state == CampaignState::RollingBack {
                    c.set_error(&self.ctx, Some(reason))?;
                    c.set_state(&self.ctx, CampaignState::RollbackFailed, SourceIndicator::ObjectOperation)?;
                }
                Some(CampaignEvent::Terminate)
            }
        };
        Ok(next)
    }

    /// Stop a procedure that is still running when the executor exits.
    async fn stop_procedure(&mut self) {
        let Some((index, mut handle)) = self.active.take() else {
            return;
        };
        if let Some(procedure) = handle.stop(ProcedureEvent::Terminate).await {
            self.campaign().replace_procedure(index, procedure);
        }
        self.work.end();
    }
}
