//! Remote execution seam.
//!
//! Each sub-operation of a step (lock/unlock/instantiate/terminate a unit,
//! install/remove a bundle, reboot a node) is one blocking call that either
//! succeeds or returns a failure reason. Internal retries and transport
//! timeouts belong to the implementation; the orchestrator only passes the
//! explicit script and reboot-wait bounds it is configured with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

pub type AgentResult = std::result::Result<(), String>;

// ---------------------------------------------------------------------------
// HookPhase
// ---------------------------------------------------------------------------

/// Phase passed to the external activation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Deactivate,
    Activate,
    Restart,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPhase::Deactivate => "deactivate",
            HookPhase::Activate => "activate",
            HookPhase::Restart => "restart",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ClusterAgent
// ---------------------------------------------------------------------------

pub trait ClusterAgent: Send + Sync {
    fn lock(&self, unit: &str) -> AgentResult;
    fn unlock(&self, unit: &str) -> AgentResult;
    fn terminate(&self, unit: &str) -> AgentResult;
    fn instantiate(&self, unit: &str) -> AgentResult;
    fn restart(&self, unit: &str) -> AgentResult;

    fn online_install(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult;
    fn online_remove(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult;
    fn offline_install(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult;
    fn offline_remove(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult;

    /// Mark a unit as being under maintenance before it is brought back.
    fn set_maintenance_status(&self, unit: &str) -> AgentResult;

    fn reboot_node(&self, node: &str) -> AgentResult;

    /// Block until `node` has rejoined the cluster, or fail after `timeout`.
    fn wait_node_up(&self, node: &str, timeout: Duration) -> AgentResult;

    fn activation_hook(&self, phase: HookPhase, units: &[String]) -> AgentResult;

    /// Hand the active orchestrator role to a peer controller.
    fn switch_over(&self, from_node: &str) -> AgentResult;
}

// ---------------------------------------------------------------------------
// RecordingAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCall {
    pub op: String,
    pub target: String,
}

impl AgentCall {
    pub fn new(op: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for AgentCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.target)
    }
}

/// Agent that performs nothing and records every call in order.
///
/// Used for dry runs and tests. Individual calls can be made to fail with
/// `fail_on`.
#[derive(Debug, Default)]
pub struct RecordingAgent {
    calls: Mutex<Vec<AgentCall>>,
    failures: Mutex<Vec<AgentCall>>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` on `target` fail.
    pub fn fail_on(&self, op: &str, target: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AgentCall::new(op, target));
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls rendered as `"op target"` strings.
    pub fn call_log(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.to_string()).collect()
    }

    fn record(&self, op: &str, target: &str) -> AgentResult {
        let call = AgentCall::new(op, target);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.clone());
        let failing = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&call);
        if failing {
            Err(format!("{op} rejected for {target}"))
        } else {
            Ok(())
        }
    }
}

impl ClusterAgent for RecordingAgent {
    fn lock(&self, unit: &str) -> AgentResult {
        self.record("lock", unit)
    }

    fn unlock(&self, unit: &str) -> AgentResult {
        self.record("unlock", unit)
    }

    fn terminate(&self, unit: &str) -> AgentResult {
        self.record("terminate", unit)
    }

    fn instantiate(&self, unit: &str) -> AgentResult {
        self.record("instantiate", unit)
    }

    fn restart(&self, unit: &str) -> AgentResult {
        self.record("restart", unit)
    }

    fn online_install(&self, bundle: &str, node: &str, _timeout: Duration) -> AgentResult {
        self.record("online_install", &format!("{bundle}@{node}"))
    }

    fn online_remove(&self, bundle: &str, node: &str, _timeout: Duration) -> AgentResult {
        self.record("online_remove", &format!("{bundle}@{node}"))
    }

    fn offline_install(&self, bundle: &str, node: &str, _timeout: Duration) -> AgentResult {
        self.record("offline_install", &format!("{bundle}@{node}"))
    }

    fn offline_remove(&self, bundle: &str, node: &str, _timeout: Duration) -> AgentResult {
        self.record("offline_remove", &format!("{bundle}@{node}"))
    }

    fn set_maintenance_status(&self, unit: &str) -> AgentResult {
        self.record("maintenance", unit)
    }

    fn reboot_node(&self, node: &str) -> AgentResult {
        self.record("reboot", node)
    }

    fn wait_node_up(&self, node: &str, _timeout: Duration) -> AgentResult {
        self.record("wait_node_up", node)
    }

    fn activation_hook(&self, phase: HookPhase, units: &[String]) -> AgentResult {
        self.record(&format!("hook_{phase}"), &units.join(";"))
    }

    fn switch_over(&self, from_node: &str) -> AgentResult {
        self.record("switch_over", from_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_in_order_and_fails_on_request() {
        let agent = RecordingAgent::new();
        agent.fail_on("unlock", "safSu=SU2");

        assert!(agent.lock("safSu=SU1").is_ok());
        assert!(agent.unlock("safSu=SU2").is_err());
        assert!(agent
            .online_install("b1", "safAmfNode=PL-3", Duration::from_secs(1))
            .is_ok());

        assert_eq!(
            agent.call_log(),
            vec![
                "lock safSu=SU1",
                "unlock safSu=SU2",
                "online_install b1@safAmfNode=PL-3"
            ]
        );

        agent.clear_failures();
        assert!(agent.unlock("safSu=SU2").is_ok());
    }
}
