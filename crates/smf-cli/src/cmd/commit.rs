use crate::cmd::{open, settle};
use crate::output::print_json;
use anyhow::Context;
use smf_core::AdminOperation;
use std::path::Path;

const COMMIT_WAIT_SECS: u64 = 60;

pub fn run(config_path: &Path, dn: &str, json: bool) -> anyhow::Result<()> {
    let orch = open(config_path)?;
    orch.admin_operation(dn, AdminOperation::Commit)
        .with_context(|| format!("failed to commit {dn}"))?;
    let state = settle(&orch, dn, COMMIT_WAIT_SECS)?;

    if json {
        print_json(&serde_json::json!({ "campaign": dn, "state": state }))?;
    } else {
        println!("{dn}: {state}");
    }
    Ok(())
}
