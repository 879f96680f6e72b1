//! End-to-end campaign runs against in-process collaborators.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use smf_core::agent::{AgentResult, ClusterAgent, HookPhase, RecordingAgent};
use smf_core::campaign::AttributeModification;
use smf_core::config::SmfConfig;
use smf_core::dn::bundle_record_dn;
use smf_core::notify::{MemoryNotifier, CAMPAIGN_STATE_CLASS, PROCEDURE_STATE_CLASS};
use smf_core::parser::YamlCampaignParser;
use smf_core::step_machine::StepState;
use smf_core::store::{AttrValue, MemoryStore, ObjectStore};
use smf_core::{
    AdminOperation, AdminResult, CampaignState, Orchestrator, OrchestratorContext, ProcedureState,
    SmfError, StepType,
};
use tempfile::TempDir;

const SC1: &str = "safAmfNode=SC-1,safAmfCluster=c";
const SC2: &str = "safAmfNode=SC-2,safAmfCluster=c";
const PL3: &str = "safAmfNode=PL-3,safAmfCluster=c";
const SU1: &str = "safSu=SU1,safSg=SG1,safApp=A";
const SU2: &str = "safSu=SU2,safSg=SG1,safApp=A";
const SU3: &str = "safSu=SU3,safSg=SG1,safApp=A";
const CAMPAIGN: &str = "safSmfCampaign=upgrade-1";
const TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Gated agent
// ---------------------------------------------------------------------------

/// Records through `RecordingAgent`, and can block once on a chosen call
/// or fail a chosen call a fixed number of times.
#[derive(Default)]
struct GatedAgent {
    inner: RecordingAgent,
    gate: Mutex<Option<(String, mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    flaky: Mutex<Vec<(String, u32)>>,
}

struct GateHandle {
    reached: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl GateHandle {
    fn wait_reached(&self) {
        self.reached.recv_timeout(TIMEOUT).expect("gate never reached");
    }

    fn open(&self) {
        self.release.send(()).unwrap();
    }
}

impl GatedAgent {
    /// Block the first `call` ("op target") until the handle opens it.
    fn gate(&self, call: &str) -> GateHandle {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((call.to_string(), reached_tx, release_rx));
        GateHandle {
            reached: reached_rx,
            release: release_tx,
        }
    }

    fn fail_times(&self, call: &str, times: u32) {
        self.flaky.lock().unwrap().push((call.to_string(), times));
    }

    fn check(&self, op: &str, target: &str) -> AgentResult {
        let call = format!("{op} {target}");
        let gated = {
            let mut gate = self.gate.lock().unwrap();
            if gate.as_ref().is_some_and(|(name, _, _)| *name == call) {
                gate.take()
            } else {
                None
            }
        };
        if let Some((_, reached, release)) = gated {
            reached.send(()).unwrap();
            release.recv_timeout(TIMEOUT).unwrap();
        }
        let mut flaky = self.flaky.lock().unwrap();
        if let Some(entry) = flaky.iter_mut().find(|(c, n)| *c == call && *n > 0) {
            entry.1 -= 1;
            return Err(format!("{call} flaked"));
        }
        Ok(())
    }

    fn call_log(&self) -> Vec<String> {
        self.inner.call_log()
    }
}

impl ClusterAgent for GatedAgent {
    fn lock(&self, unit: &str) -> AgentResult {
        self.check("lock", unit)?;
        self.inner.lock(unit)
    }
    fn unlock(&self, unit: &str) -> AgentResult {
        self.check("unlock", unit)?;
        self.inner.unlock(unit)
    }
    fn terminate(&self, unit: &str) -> AgentResult {
        self.check("terminate", unit)?;
        self.inner.terminate(unit)
    }
    fn instantiate(&self, unit: &str) -> AgentResult {
        self.check("instantiate", unit)?;
        self.inner.instantiate(unit)
    }
    fn restart(&self, unit: &str) -> AgentResult {
        self.check("restart", unit)?;
        self.inner.restart(unit)
    }
    fn online_install(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.check("online_install", &format!("{bundle}@{node}"))?;
        self.inner.online_install(bundle, node, timeout)
    }
    fn online_remove(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.check("online_remove", &format!("{bundle}@{node}"))?;
        self.inner.online_remove(bundle, node, timeout)
    }
    fn offline_install(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.check("offline_install", &format!("{bundle}@{node}"))?;
        self.inner.offline_install(bundle, node, timeout)
    }
    fn offline_remove(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.check("offline_remove", &format!("{bundle}@{node}"))?;
        self.inner.offline_remove(bundle, node, timeout)
    }
    fn set_maintenance_status(&self, unit: &str) -> AgentResult {
        self.check("maintenance", unit)?;
        self.inner.set_maintenance_status(unit)
    }
    fn reboot_node(&self, node: &str) -> AgentResult {
        self.check("reboot", node)?;
        self.inner.reboot_node(node)
    }
    fn wait_node_up(&self, node: &str, timeout: Duration) -> AgentResult {
        self.check("wait_node_up", node)?;
        self.inner.wait_node_up(node, timeout)
    }
    fn activation_hook(&self, phase: HookPhase, units: &[String]) -> AgentResult {
        self.check(&format!("hook_{phase}"), &units.join(";"))?;
        self.inner.activation_hook(phase, units)
    }
    fn switch_over(&self, from_node: &str) -> AgentResult {
        self.check("switch_over", from_node)?;
        self.inner.switch_over(from_node)
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    file: PathBuf,
    store: Arc<MemoryStore>,
    notifier: Arc<MemoryNotifier>,
    agent: Arc<GatedAgent>,
    orchestrator: Orchestrator,
}

fn orchestrator_on(
    store: Arc<MemoryStore>,
    notifier: Arc<MemoryNotifier>,
    agent: Arc<GatedAgent>,
    node: &str,
) -> Orchestrator {
    Orchestrator::new(OrchestratorContext {
        store,
        notifier,
        agent,
        parser: Arc::new(YamlCampaignParser),
        config: SmfConfig::new(node),
    })
    .unwrap()
}

fn harness(campaign_yaml: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let file = write_file(dir.path(), "campaign.yaml", campaign_yaml);
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let agent = Arc::new(GatedAgent::default());
    let orchestrator = orchestrator_on(store.clone(), notifier.clone(), agent.clone(), SC1);
    orchestrator.create_campaign(CAMPAIGN, &file).unwrap();
    Harness {
        _dir: dir,
        file,
        store,
        notifier,
        agent,
        orchestrator,
    }
}

fn write_file(dir: &Path, name: &str, data: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

impl Harness {
    fn admin(&self, op: AdminOperation) -> AdminResult {
        self.orchestrator.admin(CAMPAIGN, op)
    }

    fn settle(&self) -> CampaignState {
        assert!(self.orchestrator.wait_idle(TIMEOUT), "campaign did not settle");
        self.orchestrator.campaign_state(CAMPAIGN).unwrap()
    }

    fn campaign_states(&self) -> Vec<u32> {
        self.notifier
            .for_dn(CAMPAIGN)
            .iter()
            .map(|n| {
                assert_eq!(n.class_id, CAMPAIGN_STATE_CLASS);
                n.new_state
            })
            .collect()
    }

    fn attr(&self, dn: &str, name: &str) -> Option<AttrValue> {
        self.store.read_attr(dn, name).unwrap()
    }
}

fn states(list: &[CampaignState]) -> Vec<u32> {
    list.iter().map(|s| s.value()).collect()
}

fn proc_dn(name: &str) -> String {
    format!("safSmfProc={name},{CAMPAIGN}")
}

fn step_dn(procedure: &str, n: u32) -> String {
    format!("safSmfStep={n:04},{}", proc_dn(procedure))
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Give the campaign executor time to forward a control event to the
/// blocked procedure before the gate opens.
fn let_executor_forward() {
    std::thread::sleep(Duration::from_millis(200));
}

fn unit_steps(units: &[&str]) -> String {
    units
        .iter()
        .map(|u| format!("      - activation_units: [\"{u}\"]\n        deactivation_units: [\"{u}\"]\n"))
        .collect()
}

fn three_step_campaign() -> String {
    format!(
        "procedures:\n  - name: apps\n    steps:\n{}",
        unit_steps(&[SU1, SU2, SU3])
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn execute_runs_to_completion_with_one_notification_per_state() {
    let yaml = format!(
        r#"
procedures:
  - name: apps
    steps:
      - activation_units: ["{SU1}"]
        deactivation_units: ["{SU1}"]
        bundles_add: [{{ dn: "safSmfBundle=app-2" }}]
        bundles_remove: [{{ dn: "safSmfBundle=app-1" }}]
        nodes: ["{PL3}"]
      - activation_units: ["{SU2}"]
        bundles_remove: [{{ dn: "safSmfBundle=app-1" }}]
        nodes: ["{PL3}"]
"#
    );
    let h = harness(&yaml);
    h.store
        .create(&bundle_record_dn("safSmfBundle=app-1", PL3), Default::default())
        .unwrap();

    assert_eq!(h.admin(AdminOperation::Execute), AdminResult::Ok);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);

    assert_eq!(
        h.campaign_states(),
        states(&[CampaignState::Executing, CampaignState::ExecutionCompleted])
    );
    let proc_states: Vec<u32> = h
        .notifier
        .for_dn(&proc_dn("apps"))
        .iter()
        .map(|n| {
            assert_eq!(n.class_id, PROCEDURE_STATE_CLASS);
            n.new_state
        })
        .collect();
    assert_eq!(
        proc_states,
        vec![ProcedureState::Executing.value(), ProcedureState::Completed.value()]
    );

    let log = h.agent.call_log();
    let first = log.iter().position(|c| c == &format!("lock {SU1}")).unwrap();
    let second = log.iter().position(|c| c == &format!("unlock {SU2}")).unwrap();
    assert!(first < second);

    // The removed bundle goes exactly once, after the last step.
    let removes: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, c)| *c == &format!("online_remove safSmfBundle=app-1@{PL3}"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(removes, vec![log.len() - 1]);
    assert!(h
        .store
        .exists(&bundle_record_dn("safSmfBundle=app-2", PL3))
        .unwrap());
    assert!(!h
        .store
        .exists(&bundle_record_dn("safSmfBundle=app-1", PL3))
        .unwrap());

    assert_eq!(
        h.attr(&step_dn("apps", 1), "step_type"),
        Some(AttrValue::Str(StepType::AuLock.as_str().into()))
    );
    assert_eq!(
        h.attr(CAMPAIGN, "state"),
        Some(AttrValue::Str("execution_completed".into()))
    );
    assert!(h.attr(CAMPAIGN, "config_base").is_some());
}

#[test]
fn procedures_run_in_execution_level_order() {
    let yaml = format!(
        "procedures:\n  - name: second\n    exec_level: 2\n    steps:\n{}  - name: first\n    exec_level: 1\n    steps:\n{}",
        unit_steps(&[SU2]),
        unit_steps(&[SU1]),
    );
    let h = harness(&yaml);
    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);

    let log = h.agent.call_log();
    let su1 = log.iter().position(|c| c == &format!("lock {SU1}")).unwrap();
    let su2 = log.iter().position(|c| c == &format!("lock {SU2}")).unwrap();
    assert!(su1 < su2);
}

#[test]
fn failing_step_fails_campaign() {
    let h = harness(&three_step_campaign());
    h.agent.fail_times(&format!("unlock {SU2}"), u32::MAX);

    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionFailed);

    let error = h.orchestrator.status(CAMPAIGN).unwrap().error.unwrap();
    assert!(error.contains(&format!("unlock {SU2}")), "{error}");
    assert_eq!(
        h.attr(&step_dn("apps", 2), "state"),
        Some(AttrValue::Str(StepState::Failed.as_str().into()))
    );
    // No compensation and no further steps.
    assert!(!h.agent.call_log().iter().any(|c| c.contains("SU3")));
    assert_eq!(
        h.campaign_states(),
        states(&[CampaignState::Executing, CampaignState::ExecutionFailed])
    );
}

#[test]
fn step_retries_until_success() {
    let yaml = format!(
        "procedures:\n  - name: apps\n    steps:\n      - activation_units: [\"{SU1}\"]\n        max_retry: 2\n"
    );
    let h = harness(&yaml);
    h.agent.fail_times(&format!("unlock {SU1}"), 2);

    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);
    assert_eq!(h.attr(&step_dn("apps", 1), "retry_count"), Some(AttrValue::Uint(2)));
    let instantiations = h
        .agent
        .call_log()
        .iter()
        .filter(|c| *c == &format!("instantiate {SU1}"))
        .count();
    assert_eq!(instantiations, 3);
}

#[test]
fn retries_exhausted_fails_step() {
    let yaml = format!(
        "procedures:\n  - name: apps\n    steps:\n      - activation_units: [\"{SU1}\"]\n        max_retry: 1\n"
    );
    let h = harness(&yaml);
    h.agent.fail_times(&format!("unlock {SU1}"), 2);

    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionFailed);
    assert_eq!(h.attr(&step_dn("apps", 1), "retry_count"), Some(AttrValue::Uint(1)));
}

#[test]
fn failed_campaign_releases_executor_for_the_next_one() {
    let h = harness(&three_step_campaign());
    let other = "safSmfCampaign=upgrade-2";
    h.orchestrator.create_campaign(other, &h.file).unwrap();
    h.agent.fail_times(&format!("unlock {SU2}"), 1);

    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionFailed);
    wait_until("executor exit", || h.orchestrator.active_campaign().is_none());
    assert_eq!(h.notifier.session_counts(), (1, 1));
    // No admin operation leaves EXECUTION_FAILED.
    assert_eq!(h.admin(AdminOperation::Rollback), AdminResult::CampaignErrorDetected);
    assert_eq!(h.orchestrator.active_campaign(), None);

    assert_eq!(h.orchestrator.admin(other, AdminOperation::Execute), AdminResult::Ok);
    assert!(h.orchestrator.wait_idle(TIMEOUT));
    assert_eq!(
        h.orchestrator.campaign_state(other).unwrap(),
        CampaignState::ExecutionCompleted
    );

    h.orchestrator.delete_campaign(CAMPAIGN).unwrap();
    assert!(!h.store.exists(CAMPAIGN).unwrap());
    assert!(h.store.descendants(CAMPAIGN).unwrap().is_empty());
    assert_eq!(h.orchestrator.campaigns(), vec![other.to_string()]);
}

#[test]
fn retry_after_applied_modification_completes() {
    let yaml = format!(
        r#"
procedures:
  - name: apps
    steps:
      - activation_units: ["safComp=C1,{SU1}"]
        max_retry: 1
        modifications: [{{ kind: create, dn: "safApp=New", attributes: {{ version: "2" }} }}]
"#
    );
    let h = harness(&yaml);
    h.agent.fail_times(&format!("restart safComp=C1,{SU1}"), 1);

    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);

    let step = step_dn("apps", 1);
    assert_eq!(h.attr(&step, "retry_count"), Some(AttrValue::Uint(1)));
    assert_eq!(h.attr(&step, "applied_modifications"), Some(AttrValue::Uint(1)));
    assert_eq!(
        h.attr("safApp=New", "version"),
        Some(AttrValue::Str("2".into()))
    );
    let restarts = h
        .agent
        .call_log()
        .iter()
        .filter(|c| *c == &format!("restart safComp=C1,{SU1}"))
        .count();
    assert_eq!(restarts, 1);
}

#[test]
fn node_reboot_removals_run_once_per_bundle() {
    let yaml = format!(
        r#"
procedures:
  - name: nodes
    steps:
      - activation_units: ["{PL3}"]
        deactivation_units: ["{PL3}"]
        bundles_remove:
          - {{ dn: "safSmfBundle=kmod-1", remove_scope: reboot }}
          - {{ dn: "safSmfBundle=tools-1" }}
"#
    );
    let h = harness(&yaml);
    for bundle in ["safSmfBundle=kmod-1", "safSmfBundle=tools-1"] {
        h.store
            .create(&bundle_record_dn(bundle, PL3), Default::default())
            .unwrap();
    }

    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);

    let log = h.agent.call_log();
    let position = |call: String| -> Vec<usize> {
        log.iter()
            .enumerate()
            .filter(|(_, c)| **c == call)
            .map(|(i, _)| i)
            .collect()
    };
    let kmod = position(format!("online_remove safSmfBundle=kmod-1@{PL3}"));
    let tools = position(format!("online_remove safSmfBundle=tools-1@{PL3}"));
    let reboot = position(format!("reboot {PL3}"));
    assert_eq!(kmod.len(), 1, "{log:?}");
    assert_eq!(tools.len(), 1, "{log:?}");
    assert_eq!(reboot.len(), 1, "{log:?}");
    // The reboot-scoped bundle goes before the reboot, the other one at wrap-up.
    assert!(kmod[0] < reboot[0]);
    assert!(tools[0] > reboot[0]);
    for bundle in ["safSmfBundle=kmod-1", "safSmfBundle=tools-1"] {
        assert!(!h.store.exists(&bundle_record_dn(bundle, PL3)).unwrap());
    }
}

#[test]
fn component_with_reboot_bundle_fails_without_executing() {
    let yaml = format!(
        r#"
procedures:
  - name: apps
    steps:
      - activation_units: ["safComp=C1,{SU1}"]
        bundles_remove: [{{ dn: "safSmfBundle=kmod-1", remove_scope: reboot }}]
        nodes: ["{PL3}"]
"#
    );
    let h = harness(&yaml);
    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionFailed);

    assert!(h.agent.call_log().is_empty());
    let status = h.orchestrator.status(CAMPAIGN).unwrap();
    let step = &status.procedures[0].steps[0];
    assert_eq!(step.state, StepState::Failed);
    assert_eq!(step.step_type, None);
}

#[test]
fn second_campaign_is_rejected_while_first_holds_executor() {
    let h = harness(&three_step_campaign());
    let other = "safSmfCampaign=upgrade-2";
    h.orchestrator.create_campaign(other, &h.file).unwrap();

    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);

    assert!(matches!(
        h.orchestrator.admin_operation(other, AdminOperation::Execute),
        Err(SmfError::ConcurrencyConflict { .. })
    ));
    assert_eq!(
        h.orchestrator.admin(other, AdminOperation::Execute),
        AdminResult::BadOperation
    );
    assert_eq!(
        h.orchestrator.campaign_state(other).unwrap(),
        CampaignState::Initial
    );

    // Commit releases the slot.
    assert_eq!(h.admin(AdminOperation::Commit), AdminResult::Ok);
    wait_until("executor exit", || h.orchestrator.active_campaign().is_none());
    assert_eq!(
        h.orchestrator.campaign_state(CAMPAIGN).unwrap(),
        CampaignState::CampaignCommitted
    );
    assert!(h.store.descendants(CAMPAIGN).unwrap().is_empty());
    assert_eq!(h.orchestrator.admin(other, AdminOperation::Execute), AdminResult::Ok);
    assert!(h.orchestrator.wait_idle(TIMEOUT));
}

#[test]
fn suspend_stops_at_step_boundary_and_execute_resumes() {
    let h = harness(&three_step_campaign());
    let gate = h.agent.gate(&format!("lock {SU2}"));

    h.admin(AdminOperation::Execute);
    gate.wait_reached();
    assert_eq!(h.admin(AdminOperation::Suspend), AdminResult::Ok);
    let_executor_forward();
    gate.open();

    assert_eq!(h.settle(), CampaignState::ExecutionSuspended);
    assert_eq!(h.attr(&proc_dn("apps"), "current_step"), Some(AttrValue::Uint(2)));
    assert!(!h.agent.call_log().iter().any(|c| c.contains("SU3")));
    // SUSPEND is illegal now; EXECUTE resumes.
    assert_eq!(h.admin(AdminOperation::Suspend), AdminResult::CampaignErrorDetected);

    assert_eq!(h.admin(AdminOperation::Execute), AdminResult::Ok);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);
    assert!(h.agent.call_log().contains(&format!("unlock {SU3}")));
    assert_eq!(
        h.campaign_states(),
        states(&[
            CampaignState::Executing,
            CampaignState::ExecutionSuspended,
            CampaignState::Executing,
            CampaignState::ExecutionCompleted,
        ])
    );
}

#[test]
fn rollback_undoes_completed_steps_in_reverse() {
    let yaml = format!(
        "procedures:\n  - name: first\n    exec_level: 1\n    steps:\n{}  - name: second\n    exec_level: 2\n    steps:\n{}",
        ["      - activation_units: [\"", SU1, "\"]\n      - activation_units: [\"", SU2, "\"]\n"].concat(),
        ["      - activation_units: [\"", SU3, "\"]\n"].concat(),
    );
    let h = harness(&yaml);
    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);
    let forward_calls = h.agent.call_log().len();

    assert_eq!(h.admin(AdminOperation::Rollback), AdminResult::Ok);
    assert_eq!(h.settle(), CampaignState::RollbackCompleted);

    // Inverse steps only deactivate.
    let rollback: Vec<String> = h.agent.call_log()[forward_calls..]
        .iter()
        .filter(|c| c.starts_with("lock "))
        .cloned()
        .collect();
    assert_eq!(
        rollback,
        vec![format!("lock {SU3}"), format!("lock {SU2}"), format!("lock {SU1}")]
    );
    assert_eq!(
        h.attr(&proc_dn("first"), "state"),
        Some(AttrValue::Str(ProcedureState::RolledBack.as_str().into()))
    );
    assert!(h
        .store
        .exists(&format!("safSmfStep=R0002,{}", proc_dn("first")))
        .unwrap());

    assert_eq!(h.admin(AdminOperation::Commit), AdminResult::Ok);
    wait_until("executor exit", || h.orchestrator.active_campaign().is_none());
    assert_eq!(
        h.orchestrator.campaign_state(CAMPAIGN).unwrap(),
        CampaignState::RollbackCommitted
    );
}

#[test]
fn detected_error_suspends_and_allows_only_rollback() {
    let h = harness(&three_step_campaign());
    let gate = h.agent.gate(&format!("lock {SU2}"));

    h.admin(AdminOperation::Execute);
    gate.wait_reached();
    h.orchestrator.error_detected(CAMPAIGN, "PL-3 lost").unwrap();
    let_executor_forward();
    gate.open();

    assert_eq!(h.settle(), CampaignState::ErrorDetected);
    assert_eq!(h.admin(AdminOperation::Execute), AdminResult::CampaignErrorDetected);
    assert_eq!(
        h.attr(&proc_dn("apps"), "state"),
        Some(AttrValue::Str(ProcedureState::Suspended.as_str().into()))
    );

    assert_eq!(h.admin(AdminOperation::Rollback), AdminResult::Ok);
    assert_eq!(h.settle(), CampaignState::RollbackCompleted);
    let status = h.orchestrator.status(CAMPAIGN).unwrap();
    assert_eq!(status.error.as_deref(), Some("PL-3 lost"));
    assert_eq!(status.procedures[0].rollback_steps.len(), 2);
}

#[test]
fn parse_failure_leaves_campaign_initial_and_reexecutable() {
    let h = harness("procedures: [unclosed");
    assert_eq!(h.admin(AdminOperation::Execute), AdminResult::Ok);
    assert_eq!(h.settle(), CampaignState::Initial);
    wait_until("executor exit", || h.orchestrator.active_campaign().is_none());
    assert!(h.orchestrator.status(CAMPAIGN).unwrap().error.is_some());

    let fixed = write_file(
        h.file.parent().unwrap(),
        "fixed.yaml",
        &three_step_campaign(),
    );
    h.orchestrator
        .modify(CAMPAIGN, &[AttributeModification::file_uri(&fixed)])
        .unwrap();
    assert_eq!(h.admin(AdminOperation::Execute), AdminResult::Ok);
    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);
    assert_eq!(h.orchestrator.status(CAMPAIGN).unwrap().error, None);
}

#[test]
fn runtime_update_request_is_answered_by_running_procedure() {
    let h = harness(&three_step_campaign());
    let gate = h.agent.gate(&format!("lock {SU2}"));
    let dn = proc_dn("apps");

    h.admin(AdminOperation::Execute);
    gate.wait_reached();
    h.store.write_attr(&dn, "error", "stale".into()).unwrap();
    assert!(h.store.request_runtime_update(&dn, "error").unwrap());
    gate.open();

    assert_eq!(h.settle(), CampaignState::ExecutionCompleted);
    assert_eq!(h.attr(&dn, "error"), Some(AttrValue::Str(String::new())));
    // The session went away with the procedure executor.
    assert!(!h.store.request_runtime_update(&dn, "error").unwrap());
}

#[test]
fn switchover_hands_campaign_to_peer() {
    let yaml = format!(
        r#"
procedures:
  - name: controllers
    steps:
      - activation_units: ["{SC1}"]
        bundles_add: [{{ dn: "safSmfBundle=os-2", install_scope: reboot }}]
"#
    );
    let h = harness(&yaml);
    h.admin(AdminOperation::Execute);
    assert_eq!(h.settle(), CampaignState::Executing);
    wait_until("executor exit", || h.orchestrator.active_campaign().is_none());

    assert_eq!(h.agent.call_log(), vec![format!("switch_over {SC1}")]);
    let step = step_dn("controllers", 1);
    assert_eq!(h.attr(&step, "switch_over"), Some(AttrValue::Uint(1)));
    assert_eq!(
        h.attr(&step, "state"),
        Some(AttrValue::Str(StepState::Initial.as_str().into()))
    );

    // The peer controller recovers from the same store.
    let peer_agent = Arc::new(GatedAgent::default());
    let peer = orchestrator_on(h.store.clone(), h.notifier.clone(), peer_agent.clone(), SC2);
    assert_eq!(peer.recover().unwrap().as_deref(), Some(CAMPAIGN));
    assert!(peer.wait_idle(TIMEOUT));
    assert_eq!(
        peer.campaign_state(CAMPAIGN).unwrap(),
        CampaignState::ExecutionCompleted
    );

    let log = peer_agent.call_log();
    let reboot = log.iter().position(|c| c == &format!("reboot {SC1}")).unwrap();
    assert_eq!(log[reboot + 1], format!("wait_node_up {SC1}"));
    assert_eq!(h.attr(&step, "switch_over"), Some(AttrValue::Uint(0)));
}

#[test]
fn recovery_reloads_objects_instead_of_recreating_them() {
    let h = harness(&three_step_campaign());
    let gate = h.agent.gate(&format!("lock {SU2}"));
    h.admin(AdminOperation::Execute);
    gate.wait_reached();
    h.admin(AdminOperation::Suspend);
    let_executor_forward();
    gate.open();
    assert_eq!(h.settle(), CampaignState::ExecutionSuspended);

    // A restarted orchestrator sees the persisted progress; MemoryStore
    // rejects a second create of the same object.
    let restarted = orchestrator_on(
        h.store.clone(),
        h.notifier.clone(),
        Arc::new(GatedAgent::default()),
        SC1,
    );
    assert_eq!(restarted.recover().unwrap(), None);
    assert_eq!(
        restarted.admin(CAMPAIGN, AdminOperation::Execute),
        AdminResult::Ok
    );
    assert!(restarted.wait_idle(TIMEOUT));
    assert_eq!(
        restarted.campaign_state(CAMPAIGN).unwrap(),
        CampaignState::ExecutionCompleted
    );
    let status = restarted.status(CAMPAIGN).unwrap();
    assert!(status.procedures[0]
        .steps
        .iter()
        .all(|s| s.state == StepState::Completed));
}
