use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SmfError};
use crate::step_machine::StepState;
use crate::store::{AttrValue, Attributes, ObjectStore};
use crate::types::StepType;

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Scope of a bundle's install or remove command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleScope {
    /// Takes effect once the affected units are restarted.
    #[default]
    Unit,
    /// Takes effect only after the node is rebooted.
    Reboot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub dn: String,
    #[serde(default)]
    pub install_scope: BundleScope,
    #[serde(default)]
    pub remove_scope: BundleScope,
}

impl Bundle {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            install_scope: BundleScope::Unit,
            remove_scope: BundleScope::Unit,
        }
    }

    pub fn install_needs_reboot(&self) -> bool {
        self.install_scope == BundleScope::Reboot
    }

    pub fn remove_needs_reboot(&self) -> bool {
        self.remove_scope == BundleScope::Reboot
    }
}

// ---------------------------------------------------------------------------
// ImmModification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Create,
    Modify,
    Delete,
}

/// One change to the information model applied while the affected units are
/// out of service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmModification {
    pub kind: ModificationKind,
    pub dn: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ImmModification {
    pub fn apply(&self, store: &dyn ObjectStore) -> Result<()> {
        match self.kind {
            ModificationKind::Create => {
                let attrs: Attributes = self
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), AttrValue::from(v.as_str())))
                    .collect();
                store.create(&self.dn, attrs)
            }
            ModificationKind::Modify => {
                for (name, value) in &self.attributes {
                    store.write_attr(&self.dn, name, value.as_str().into())?;
                }
                Ok(())
            }
            ModificationKind::Delete => store.delete(&self.dn),
        }
    }
}

impl fmt::Display for ImmModification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ModificationKind::Create => "create",
            ModificationKind::Modify => "modify",
            ModificationKind::Delete => "delete",
        };
        write!(f, "{kind} {}", self.dn)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// The smallest unit of upgrade work.
///
/// Everything except `step_type`, `target_node`, `retry_count`,
/// `applied_modifications`, `switch_over` and `state` comes from the campaign
/// description and never changes. `step_type` is assigned once by the
/// Initial classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub dn: String,
    pub step_type: Option<StepType>,
    pub activation_units: Vec<String>,
    pub deactivation_units: Vec<String>,
    pub bundles_add: Vec<Bundle>,
    pub bundles_remove: Vec<Bundle>,
    pub modifications: Vec<ImmModification>,
    /// Node to reboot; for node-level activation units this is the unit itself.
    pub target_node: Option<String>,
    /// Nodes the bundles are installed on or removed from.
    pub nodes: Vec<String>,
    pub max_retry: u32,
    pub retry_count: u32,
    /// Leading entries of `modifications` already applied; a retry skips
    /// them.
    pub applied_modifications: usize,
    pub switch_over: bool,
    pub state: StepState,
}

impl Step {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            step_type: None,
            activation_units: Vec::new(),
            deactivation_units: Vec::new(),
            bundles_add: Vec::new(),
            bundles_remove: Vec::new(),
            modifications: Vec::new(),
            target_node: None,
            nodes: Vec::new(),
            max_retry: 0,
            retry_count: 0,
            applied_modifications: 0,
            switch_over: false,
            state: StepState::Initial,
        }
    }

    /// Nodes bundle operations run on: the explicit node list, falling back
    /// to the target node.
    pub fn bundle_nodes(&self) -> Vec<String> {
        if !self.nodes.is_empty() {
            return self.nodes.clone();
        }
        self.target_node.iter().cloned().collect()
    }

    pub fn has_reboot_bundles(&self) -> bool {
        self.bundles_add.iter().any(Bundle::install_needs_reboot)
            || self.bundles_remove.iter().any(Bundle::remove_needs_reboot)
    }

    /// The step that undoes this one during rollback.
    ///
    /// Activation and deactivation units swap, added and removed bundles
    /// swap, and model modifications are dropped. The result starts from
    /// Initial and is classified afresh.
    pub fn inverse(&self, dn: impl Into<String>) -> Step {
        Step {
            dn: dn.into(),
            step_type: None,
            activation_units: self.deactivation_units.clone(),
            deactivation_units: self.activation_units.clone(),
            bundles_add: self.bundles_remove.clone(),
            bundles_remove: self.bundles_add.clone(),
            modifications: Vec::new(),
            target_node: self.target_node.clone(),
            nodes: self.nodes.clone(),
            max_retry: self.max_retry,
            retry_count: 0,
            applied_modifications: 0,
            switch_over: false,
            state: StepState::Initial,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("state".into(), self.state.as_str().into());
        if let Some(t) = self.step_type {
            attrs.insert("step_type".into(), t.as_str().into());
        }
        if let Some(node) = &self.target_node {
            attrs.insert("target_node".into(), node.as_str().into());
        }
        attrs.insert("retry_count".into(), self.retry_count.into());
        attrs.insert("max_retry".into(), self.max_retry.into());
        attrs.insert(
            "applied_modifications".into(),
            (self.applied_modifications as u64).into(),
        );
        attrs.insert("switch_over".into(), u64::from(self.switch_over).into());
        attrs
    }

    /// Restore the runtime part of the step from a persisted object.
    pub fn apply_attributes(&mut self, attrs: &Attributes) -> Result<()> {
        if let Some(state) = attrs.get("state").and_then(AttrValue::as_str) {
            self.state = state.parse()?;
        }
        if let Some(t) = attrs.get("step_type").and_then(AttrValue::as_str) {
            self.step_type = Some(t.parse()?);
        }
        if let Some(node) = attrs.get("target_node").and_then(AttrValue::as_str) {
            self.target_node = Some(node.to_string());
        }
        if let Some(count) = attrs.get("retry_count").and_then(AttrValue::as_u64) {
            self.retry_count = u32::try_from(count)
                .map_err(|_| SmfError::Store(format!("retry_count out of range on {}", self.dn)))?;
        }
        if let Some(count) = attrs.get("applied_modifications").and_then(AttrValue::as_u64) {
            self.applied_modifications = usize::try_from(count).map_err(|_| {
                SmfError::Store(format!("applied_modifications out of range on {}", self.dn))
            })?;
        }
        if let Some(flag) = attrs.get("switch_over").and_then(AttrValue::as_u64) {
            self.switch_over = flag != 0;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sample() -> Step {
        let mut step = Step::new("safSmfStep=0001,safSmfProc=p1,safSmfCampaign=c1");
        step.activation_units = vec!["safSu=SU1,safSg=SG1,safApp=A".into()];
        step.deactivation_units = vec!["safSu=SU0,safSg=SG1,safApp=A".into()];
        step.bundles_add = vec![Bundle::new("safSmfBundle=new")];
        step.bundles_remove = vec![Bundle::new("safSmfBundle=old")];
        step.modifications = vec![ImmModification {
            kind: ModificationKind::Delete,
            dn: "x=1".into(),
            attributes: BTreeMap::new(),
        }];
        step.nodes = vec!["safAmfNode=PL-3".into()];
        step.max_retry = 2;
        step.retry_count = 1;
        step.state = StepState::Completed;
        step
    }

    #[test]
    fn inverse_swaps_units_and_bundles() {
        let step = sample();
        let inv = step.inverse("safSmfStep=0002,safSmfProc=p1,safSmfCampaign=c1");
        assert_eq!(inv.activation_units, step.deactivation_units);
        assert_eq!(inv.deactivation_units, step.activation_units);
        assert_eq!(inv.bundles_add, step.bundles_remove);
        assert_eq!(inv.bundles_remove, step.bundles_add);
        assert!(inv.modifications.is_empty());
        assert_eq!(inv.state, StepState::Initial);
        assert_eq!(inv.retry_count, 0);
        assert_eq!(inv.step_type, None);
    }

    #[test]
    fn bundle_nodes_fall_back_to_target_node() {
        let mut step = Step::new("s=1");
        assert!(step.bundle_nodes().is_empty());
        step.target_node = Some("safAmfNode=PL-4".into());
        assert_eq!(step.bundle_nodes(), vec!["safAmfNode=PL-4".to_string()]);
        step.nodes = vec!["safAmfNode=PL-3".into()];
        assert_eq!(step.bundle_nodes(), vec!["safAmfNode=PL-3".to_string()]);
    }

    #[test]
    fn reboot_scope_detection() {
        let mut step = Step::new("s=1");
        step.bundles_remove = vec![Bundle {
            dn: "b=1".into(),
            install_scope: BundleScope::Reboot,
            remove_scope: BundleScope::Unit,
        }];
        // Only the remove scope matters for removed bundles.
        assert!(!step.has_reboot_bundles());
        step.bundles_remove[0].remove_scope = BundleScope::Reboot;
        assert!(step.has_reboot_bundles());
    }

    #[test]
    fn attributes_restore_runtime_fields() {
        let mut step = sample();
        step.step_type = Some(StepType::AuLock);
        step.target_node = Some("safAmfNode=PL-3".into());
        step.switch_over = true;
        step.applied_modifications = 1;
        let attrs = step.to_attributes();

        let mut fresh = Step::new(step.dn.clone());
        fresh.apply_attributes(&attrs).unwrap();
        assert_eq!(fresh.state, StepState::Completed);
        assert_eq!(fresh.step_type, Some(StepType::AuLock));
        assert_eq!(fresh.target_node.as_deref(), Some("safAmfNode=PL-3"));
        assert_eq!(fresh.retry_count, 1);
        assert_eq!(fresh.applied_modifications, 1);
        assert!(fresh.switch_over);
    }

    #[test]
    fn modifications_apply_to_store() {
        let store = MemoryStore::new();
        let mut attrs = BTreeMap::new();
        attrs.insert("version".to_string(), "1".to_string());
        ImmModification {
            kind: ModificationKind::Create,
            dn: "safComp=C1".into(),
            attributes: attrs.clone(),
        }
        .apply(&store)
        .unwrap();

        attrs.insert("version".to_string(), "2".to_string());
        ImmModification {
            kind: ModificationKind::Modify,
            dn: "safComp=C1".into(),
            attributes: attrs,
        }
        .apply(&store)
        .unwrap();
        assert_eq!(
            store.read_attr("safComp=C1", "version").unwrap(),
            Some(AttrValue::Str("2".into()))
        );

        ImmModification {
            kind: ModificationKind::Delete,
            dn: "safComp=C1".into(),
            attributes: BTreeMap::new(),
        }
        .apply(&store)
        .unwrap();
        assert!(!store.exists("safComp=C1").unwrap());
    }
}
