//! `ClusterAgent` backed by shell command templates.
//!
//! Each operation runs its configured template through `sh -c` after
//! substituting `{dn}`, `{node}`, `{bundle}` and `{phase}` (values are
//! single-quoted). Exit status 0 is success; anything else fails the
//! sub-operation with the command's trimmed output as the reason.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{mpsc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::agent::{AgentResult, ClusterAgent, HookPhase};
use crate::config::CommandTemplates;

const MAX_OUTPUT: usize = 4 * 1024;

pub struct ShellAgent {
    commands: CommandTemplates,
    /// Bound for commands whose operation carries no explicit timeout.
    default_timeout: Duration,
    poll_interval: Duration,
}

impl ShellAgent {
    pub fn new(commands: CommandTemplates, default_timeout: Duration) -> Self {
        Self {
            commands,
            default_timeout,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Interval between `node_up` checks while waiting for a reboot.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn run(
        &self,
        op: &str,
        template: Option<&String>,
        vars: &[(&str, String)],
        timeout: Duration,
    ) -> AgentResult {
        let Some(template) = template else {
            debug!(op, "no command configured, skipping");
            return Ok(());
        };
        let command = render(template, vars);
        debug!(op, %command, "running cluster command");
        match execute(&command, timeout) {
            Ok(_) => Ok(()),
            Err(reason) => {
                warn!(op, %command, %reason, "cluster command failed");
                Err(reason)
            }
        }
    }

    fn unit_op(&self, op: &str, template: Option<&String>, unit: &str) -> AgentResult {
        self.run(op, template, &[("dn", quote(unit))], self.default_timeout)
    }

    fn bundle_op(
        &self,
        op: &str,
        template: Option<&String>,
        bundle: &str,
        node: &str,
        timeout: Duration,
    ) -> AgentResult {
        self.run(
            op,
            template,
            &[("bundle", quote(bundle)), ("node", quote(node))],
            timeout,
        )
    }
}

impl ClusterAgent for ShellAgent {
    fn lock(&self, unit: &str) -> AgentResult {
        self.unit_op("lock", self.commands.lock.as_ref(), unit)
    }

    fn unlock(&self, unit: &str) -> AgentResult {
        self.unit_op("unlock", self.commands.unlock.as_ref(), unit)
    }

    fn terminate(&self, unit: &str) -> AgentResult {
        self.unit_op("terminate", self.commands.terminate.as_ref(), unit)
    }

    fn instantiate(&self, unit: &str) -> AgentResult {
        self.unit_op("instantiate", self.commands.instantiate.as_ref(), unit)
    }

    fn restart(&self, unit: &str) -> AgentResult {
        self.unit_op("restart", self.commands.restart.as_ref(), unit)
    }

    fn online_install(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.bundle_op("online_install", self.commands.online_install.as_ref(), bundle, node, timeout)
    }

    fn online_remove(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.bundle_op("online_remove", self.commands.online_remove.as_ref(), bundle, node, timeout)
    }

    fn offline_install(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.bundle_op("offline_install", self.commands.offline_install.as_ref(), bundle, node, timeout)
    }

    fn offline_remove(&self, bundle: &str, node: &str, timeout: Duration) -> AgentResult {
        self.bundle_op("offline_remove", self.commands.offline_remove.as_ref(), bundle, node, timeout)
    }

    fn set_maintenance_status(&self, unit: &str) -> AgentResult {
        self.unit_op("maintenance", self.commands.maintenance.as_ref(), unit)
    }

    fn reboot_node(&self, node: &str) -> AgentResult {
        self.run(
            "reboot",
            self.commands.reboot.as_ref(),
            &[("node", quote(node))],
            self.default_timeout,
        )
    }

    fn wait_node_up(&self, node: &str, timeout: Duration) -> AgentResult {
        let Some(template) = self.commands.node_up.as_ref() else {
            return Ok(());
        };
        let command = render(template, &[("node", quote(node))]);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if execute(&command, remaining.max(Duration::from_millis(1))).is_ok() {
                debug!(%node, "node is up");
                return Ok(());
            }
            if Instant::now() + self.poll_interval >= deadline {
                return Err(format!(
                    "node {node} not up after {}s",
                    timeout.as_secs()
                ));
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn activation_hook(&self, phase: HookPhase, units: &[String]) -> AgentResult {
        let dns = units.iter().map(|u| quote(u)).collect::<Vec<_>>().join(" ");
        self.run(
            "activation_hook",
            self.commands.activation_hook.as_ref(),
            &[("phase", phase.to_string()), ("dn", dns)],
            self.default_timeout,
        )
    }

    fn switch_over(&self, from_node: &str) -> AgentResult {
        self.run(
            "switchover",
            self.commands.switchover.as_ref(),
            &[("node", quote(from_node))],
            self.default_timeout,
        )
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{(dn|node|bundle|phase)\}").unwrap())
}

/// Substitute every placeholder in one pass; values are never rescanned.
/// Placeholders without a value are left as written.
fn render(template: &str, vars: &[(&str, String)]) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures<'_>| {
            vars.iter()
                .find(|(name, _)| *name == &caps[1])
                .map_or_else(|| caps[0].to_string(), |(_, value)| value.clone())
        })
        .into_owned()
}

/// Single-quote `value` for `sh`.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Run `command` under `sh -c` in its own process group, killing the group
/// after `timeout`. Returns the trimmed output on success, the failure reason
/// otherwise.
fn execute(command: &str, timeout: Duration) -> Result<String, String> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn: {e}"))?;
    let pid = child.id();

    // Drain both pipes so a chatty command cannot block on a full buffer.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_thread = thread::spawn(move || read_all(stdout));
    let stderr_thread = thread::spawn(move || read_all(stderr));

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(child.wait());
    });
    let status = match rx.recv_timeout(timeout) {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(format!("wait failed: {e}")),
        Err(_) => {
            // Also ends the grandchildren holding the pipes, so the reader
            // threads finish on their own.
            kill_process_group(pid);
            return Err(format!("timed out after {}s", timeout.as_secs()));
        }
    };

    let out = stdout_thread.join().unwrap_or_default();
    let err = stderr_thread.join().unwrap_or_default();
    let output = cap(&format!("{out}\n{err}"));
    if status.success() {
        Ok(output)
    } else {
        let code = status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Err(if output.is_empty() {
            format!("exit {code}")
        } else {
            format!("exit {code}: {output}")
        })
    }
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut r) = pipe {
        let _ = r.read_to_string(&mut buf);
    }
    buf
}

/// Trim and keep at most the last `MAX_OUTPUT` bytes.
fn cap(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= MAX_OUTPUT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - MAX_OUTPUT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

fn kill_process_group(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
