//! Campaign description loading.
//!
//! A campaign source file describes the procedures to run, each with an
//! execution level and an ordered list of steps. `CampaignParser` is the
//! seam; `YamlCampaignParser` reads the YAML form:
//!
//! ```yaml
//! expected_time_secs: 900
//! procedures:
//!   - name: upgrade-pl
//!     exec_level: 1
//!     steps:
//!       - activation_units: ["safSu=SU1,safSg=SG1,safApp=App1"]
//!         deactivation_units: ["safSu=SU1,safSg=SG1,safApp=App1"]
//!         bundles_add: [{ dn: "safSmfBundle=app-2.0" }]
//!         bundles_remove: [{ dn: "safSmfBundle=app-1.0" }]
//!         nodes: ["safAmfNode=PL-3,safAmfCluster=myCluster"]
//!         max_retry: 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::dn::validate_dn;
use crate::error::{Result, SmfError};
use crate::step::{Bundle, ImmModification, Step};

// ---------------------------------------------------------------------------
// Description types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_time_secs: Option<u64>,
    #[serde(default)]
    pub procedures: Vec<ProcedureDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDescription {
    pub name: String,
    #[serde(default = "default_exec_level")]
    pub exec_level: u32,
    #[serde(default)]
    pub steps: Vec<StepDescription>,
}

fn default_exec_level() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDescription {
    #[serde(default)]
    pub activation_units: Vec<String>,
    #[serde(default)]
    pub deactivation_units: Vec<String>,
    #[serde(default)]
    pub bundles_add: Vec<Bundle>,
    #[serde(default)]
    pub bundles_remove: Vec<Bundle>,
    #[serde(default)]
    pub modifications: Vec<ImmModification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub max_retry: u32,
}

impl StepDescription {
    pub fn into_step(self, dn: impl Into<String>) -> Step {
        let mut step = Step::new(dn);
        step.activation_units = self.activation_units;
        step.deactivation_units = self.deactivation_units;
        step.bundles_add = self.bundles_add;
        step.bundles_remove = self.bundles_remove;
        step.modifications = self.modifications;
        step.target_node = self.target_node;
        step.nodes = self.nodes;
        step.max_retry = self.max_retry;
        step
    }
}

impl CampaignDescription {
    /// Reject descriptions that cannot be turned into procedures.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for procedure in &self.procedures {
            if procedure.name.is_empty() || procedure.name.contains([',', '=', '\\']) {
                return Err(SmfError::Parse(format!(
                    "invalid procedure name '{}'",
                    procedure.name
                )));
            }
            if !names.insert(procedure.name.as_str()) {
                return Err(SmfError::Parse(format!(
                    "duplicate procedure name '{}'",
                    procedure.name
                )));
            }
            for (i, step) in procedure.steps.iter().enumerate() {
                let dns = step
                    .activation_units
                    .iter()
                    .chain(&step.deactivation_units)
                    .chain(&step.nodes)
                    .chain(step.target_node.iter())
                    .chain(step.modifications.iter().map(|m| &m.dn));
                for dn in dns {
                    validate_dn(dn).map_err(|_| {
                        SmfError::Parse(format!(
                            "procedure '{}' step {}: invalid DN '{dn}'",
                            procedure.name,
                            i + 1
                        ))
                    })?;
                }
                if let Some(b) = step
                    .bundles_add
                    .iter()
                    .chain(&step.bundles_remove)
                    .find(|b| b.dn.trim().is_empty())
                {
                    return Err(SmfError::Parse(format!(
                        "procedure '{}' step {}: empty bundle DN '{}'",
                        procedure.name,
                        i + 1,
                        b.dn
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CampaignParser
// ---------------------------------------------------------------------------

pub trait CampaignParser: Send + Sync {
    fn parse(&self, source: &Path) -> Result<CampaignDescription>;
}

#[derive(Debug, Default)]
pub struct YamlCampaignParser;

impl YamlCampaignParser {
    pub fn parse_str(&self, data: &str) -> Result<CampaignDescription> {
        let description: CampaignDescription = serde_yaml::from_str(data)?;
        description.validate()?;
        Ok(description)
    }
}

impl CampaignParser for YamlCampaignParser {
    fn parse(&self, source: &Path) -> Result<CampaignDescription> {
        if !source.exists() {
            return Err(SmfError::SourceFileMissing(source.display().to_string()));
        }
        let data = std::fs::read_to_string(source)?;
        self.parse_str(&data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::BundleScope;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
expected_time_secs: 900
procedures:
  - name: pl-nodes
    exec_level: 2
    steps:
      - activation_units: ["safAmfNode=PL-3,safAmfCluster=c"]
        deactivation_units: ["safAmfNode=PL-3,safAmfCluster=c"]
        bundles_add:
          - dn: "safSmfBundle=kernel-2"
            install_scope: reboot
        max_retry: 2
  - name: apps
    steps:
      - activation_units: ["safSu=SU1,safSg=SG1,safApp=A"]
        nodes: ["safAmfNode=PL-3,safAmfCluster=c"]
"#;

    #[test]
    fn parses_procedures_and_steps() {
        let desc = YamlCampaignParser.parse_str(SAMPLE).unwrap();
        assert_eq!(desc.expected_time_secs, Some(900));
        assert_eq!(desc.procedures.len(), 2);

        let pl = &desc.procedures[0];
        assert_eq!(pl.exec_level, 2);
        assert_eq!(pl.steps[0].max_retry, 2);
        assert_eq!(pl.steps[0].bundles_add[0].install_scope, BundleScope::Reboot);
        assert_eq!(pl.steps[0].bundles_add[0].remove_scope, BundleScope::Unit);

        assert_eq!(desc.procedures[1].exec_level, 1);
    }

    #[test]
    fn step_description_becomes_initial_step() {
        let desc = YamlCampaignParser.parse_str(SAMPLE).unwrap();
        let step = desc.procedures[1].steps[0].clone().into_step("safSmfStep=0001,p=1");
        assert_eq!(step.activation_units.len(), 1);
        assert_eq!(step.nodes, vec!["safAmfNode=PL-3,safAmfCluster=c".to_string()]);
        assert_eq!(step.step_type, None);
        assert_eq!(step.retry_count, 0);
    }

    #[test]
    fn rejects_duplicate_procedure_names() {
        let yaml = "procedures:\n  - name: a\n  - name: a\n";
        assert!(matches!(
            YamlCampaignParser.parse_str(yaml),
            Err(SmfError::Parse(_))
        ));
    }

    #[test]
    fn rejects_invalid_unit_dn() {
        let yaml = "procedures:\n  - name: a\n    steps:\n      - activation_units: [\"nodn\"]\n";
        assert!(matches!(
            YamlCampaignParser.parse_str(yaml),
            Err(SmfError::Parse(_))
        ));
    }

    #[test]
    fn malformed_yaml_is_yaml_error() {
        assert!(matches!(
            YamlCampaignParser.parse_str("procedures: [unclosed"),
            Err(SmfError::Yaml(_))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            YamlCampaignParser.parse(&dir.path().join("campaign.yaml")),
            Err(SmfError::SourceFileMissing(_))
        ));
    }
}
