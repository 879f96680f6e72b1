pub mod commit;
pub mod config;
pub mod rollback;
pub mod run;
pub mod status;

use anyhow::{bail, Context};
use smf_core::config::SmfConfig;
use smf_core::notify::LogNotifier;
use smf_core::parser::YamlCampaignParser;
use smf_core::redb_store::RedbStore;
use smf_core::shell_agent::ShellAgent;
use smf_core::{CampaignState, Orchestrator, OrchestratorContext};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn load_config(config_path: &Path) -> anyhow::Result<SmfConfig> {
    SmfConfig::load(config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))
}

/// Build an orchestrator over the redb store named in the config, driving
/// the cluster through the configured shell commands.
pub fn open(config_path: &Path) -> anyhow::Result<Orchestrator> {
    let config = load_config(config_path)?;
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let store_path = config.store_path(dir);
    let store = RedbStore::open(&store_path)
        .with_context(|| format!("failed to open store {}", store_path.display()))?;
    let agent = ShellAgent::new(config.commands.clone(), config.bundle_timeout());

    let ctx = OrchestratorContext {
        store: Arc::new(store),
        notifier: Arc::new(LogNotifier),
        agent: Arc::new(agent),
        parser: Arc::new(YamlCampaignParser),
        config,
    };
    Orchestrator::new(ctx).context("failed to load campaigns")
}

/// Resume whatever campaign an earlier invocation left running. True when
/// that campaign is `dn`.
pub fn resume(orch: &Orchestrator, dn: &str) -> anyhow::Result<bool> {
    match orch.recover().context("failed to resume interrupted campaign")? {
        Some(resumed) if resumed == dn => Ok(true),
        Some(other) => bail!("campaign {other} is still running; resolve it first"),
        None => Ok(false),
    }
}

/// Wait for the campaign executor to go quiet, then report the state the
/// campaign settled in.
pub fn settle(orch: &Orchestrator, dn: &str, wait: u64) -> anyhow::Result<CampaignState> {
    if !orch.wait_idle(Duration::from_secs(wait)) {
        bail!("campaign {dn} did not settle within {wait}s");
    }
    Ok(orch.campaign_state(dn)?)
}

/// States a command should report as a failed outcome.
pub fn is_failure(state: CampaignState) -> bool {
    matches!(
        state,
        CampaignState::ExecutionFailed
            | CampaignState::RollbackFailed
            | CampaignState::ErrorDetected
            | CampaignState::ExecutionSuspended
            | CampaignState::RollbackSuspended
    )
}
