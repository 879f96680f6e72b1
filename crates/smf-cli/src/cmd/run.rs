use crate::cmd::{is_failure, open, resume, settle, status};
use anyhow::{bail, Context};
use smf_core::campaign::AttributeModification;
use smf_core::{AdminOperation, CampaignState};
use std::path::Path;
use tracing::info;

pub fn run(
    config_path: &Path,
    dn: &str,
    file: Option<&Path>,
    wait: u64,
    json: bool,
) -> anyhow::Result<()> {
    let orch = open(config_path)?;

    // Stored paths must survive a change of working directory.
    let file = file
        .map(|f| {
            std::fs::canonicalize(f)
                .with_context(|| format!("campaign file not found: {}", f.display()))
        })
        .transpose()?;

    if !orch.campaigns().iter().any(|c| c == dn) {
        let Some(file) = file.as_deref() else {
            bail!("campaign {dn} does not exist; pass --file to create it");
        };
        orch.create_campaign(dn, file)
            .with_context(|| format!("failed to create campaign {dn}"))?;
    } else if let Some(file) = file.as_deref().filter(|f| {
        orch.status(dn).map_or(true, |s| s.file_uri.as_path() != *f)
    }) {
        orch.modify(dn, &[AttributeModification::file_uri(file)])
            .with_context(|| format!("failed to update source file of {dn}"))?;
    }

    if resume(&orch, dn)? {
        info!(campaign = %dn, "resumed interrupted campaign");
    } else {
        orch.admin_operation(dn, AdminOperation::Execute)
            .with_context(|| format!("failed to execute {dn}"))?;
    }

    let state = settle(&orch, dn, wait)?;
    let report = orch.status(dn)?;
    status::print_campaign(&report, json)?;
    if is_failure(state) {
        bail!("campaign {dn} ended in state {state}");
    }
    // A description that fails to parse leaves the campaign in INITIAL.
    if state == CampaignState::Initial {
        if let Some(err) = &report.error {
            bail!("campaign {dn} did not start: {err}");
        }
    }
    Ok(())
}
