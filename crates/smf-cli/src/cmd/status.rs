use crate::cmd::open;
use crate::output::{print_json, print_table};
use smf_core::orchestrator::StepStatus;
use smf_core::CampaignStatus;
use std::path::Path;

pub fn run(config_path: &Path, dn: Option<&str>, json: bool) -> anyhow::Result<()> {
    let orch = open(config_path)?;
    match dn {
        Some(dn) => print_campaign(&orch.status(dn)?, json),
        None => {
            let all = orch
                .campaigns()
                .iter()
                .map(|dn| orch.status(dn))
                .collect::<Result<Vec<_>, _>>()?;
            list(&all, json)
        }
    }
}

fn list(all: &[CampaignStatus], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&all);
    }
    if all.is_empty() {
        println!("No campaigns.");
        return Ok(());
    }
    let rows = all
        .iter()
        .map(|c| {
            vec![
                c.dn.clone(),
                c.state.to_string(),
                c.procedures.len().to_string(),
                c.error.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(&["CAMPAIGN", "STATE", "PROCEDURES", "ERROR"], rows);
    Ok(())
}

pub fn print_campaign(status: &CampaignStatus, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(status);
    }

    println!("Campaign: {}", status.dn);
    println!("State:    {}", status.state);
    println!("File:     {}", status.file_uri.display());
    println!("Elapsed:  {}s", status.elapsed_ms / 1000);
    if let Some(secs) = status.expected_time_secs {
        println!("Expected: {secs}s");
    }
    if let Some(err) = &status.error {
        println!("Error:    {err}");
    }
    if status.procedures.is_empty() {
        return Ok(());
    }

    println!();
    let mut rows = Vec::new();
    for p in &status.procedures {
        rows.extend(p.steps.iter().map(|s| step_row(&p.name, p.exec_level, s)));
        rows.extend(
            p.rollback_steps
                .iter()
                .map(|s| step_row(&format!("{} (rollback)", p.name), p.exec_level, s)),
        );
    }
    print_table(&["PROCEDURE", "LEVEL", "STEP", "TYPE", "STATE", "RETRIES"], rows);

    for p in status.procedures.iter().filter(|p| p.error.is_some()) {
        println!();
        println!("{}: {} ({})", p.name, p.state, p.error.as_deref().unwrap_or_default());
    }
    Ok(())
}

fn step_row(procedure: &str, level: u32, step: &StepStatus) -> Vec<String> {
    vec![
        procedure.to_string(),
        level.to_string(),
        step.dn.clone(),
        step.step_type
            .map_or_else(|| "-".to_string(), |t| t.to_string()),
        step.state.to_string(),
        step.retry_count.to_string(),
    ]
}
