use crate::cmd::{is_failure, open, resume, settle, status};
use anyhow::{bail, Context};
use smf_core::AdminOperation;
use std::path::Path;

pub fn run(config_path: &Path, dn: &str, wait: u64, json: bool) -> anyhow::Result<()> {
    let orch = open(config_path)?;
    let resumed = resume(&orch, dn)?;
    if !(resumed && orch.campaign_state(dn)? == smf_core::CampaignState::RollingBack) {
        if resumed {
            // An interrupted execution has to settle before it can be undone.
            settle(&orch, dn, wait)?;
        }
        orch.admin_operation(dn, AdminOperation::Rollback)
            .with_context(|| format!("failed to roll back {dn}"))?;
    }

    let state = settle(&orch, dn, wait)?;
    status::print_campaign(&orch.status(dn)?, json)?;
    if is_failure(state) {
        bail!("campaign {dn} ended in state {state}");
    }
    Ok(())
}
