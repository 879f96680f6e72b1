use tracing::{debug, info, warn};

use crate::dn::{procedure_dn, rollback_step_dn, step_dn};
use crate::error::{Result, SmfError};
use crate::notify::{
    Notifier, SourceIndicator, StateChangeNotification, PROCEDURE_STATE_ATTR_ID,
    PROCEDURE_STATE_CLASS,
};
use crate::parser::ProcedureDescription;
use crate::step::Step;
use crate::step_machine::StepState;
use crate::store::{AttrValue, Attributes, ObjectStore};
use crate::types::{ProcedureState, StepType};

/// Which step list a procedure is working through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Rollback,
}

/// A bundle to uninstall from a node once every step of a procedure is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedBundle {
    pub bundle: String,
    pub node: String,
    /// Already online-removed by a node reboot step, ahead of its reboot.
    pub removed_by_step: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub dn: String,
    pub name: String,
    pub exec_level: u32,
    pub state: ProcedureState,
    pub steps: Vec<Step>,
    /// Index of the next forward step to execute.
    pub current_step: usize,
    /// Inverse steps, built when rollback starts.
    pub rollback_steps: Vec<Step>,
    pub rollback_step: usize,
    pub error: Option<String>,
}

impl Procedure {
    pub fn from_description(campaign_dn: &str, desc: &ProcedureDescription) -> Self {
        let dn = procedure_dn(campaign_dn, &desc.name);
        let steps = desc
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| s.clone().into_step(step_dn(&dn, i)))
            .collect();
        Self {
            dn,
            name: desc.name.clone(),
            exec_level: desc.exec_level,
            state: ProcedureState::Initial,
            steps,
            current_step: 0,
            rollback_steps: Vec::new(),
            rollback_step: 0,
            error: None,
        }
    }

    pub fn steps(&self, dir: Direction) -> &[Step] {
        match dir {
            Direction::Forward => &self.steps,
            Direction::Rollback => &self.rollback_steps,
        }
    }

    pub fn cursor(&self, dir: Direction) -> usize {
        match dir {
            Direction::Forward => self.current_step,
            Direction::Rollback => self.rollback_step,
        }
    }

    /// Step at the cursor for `dir`, if any remain.
    pub fn current_mut(&mut self, dir: Direction) -> Option<&mut Step> {
        match dir {
            Direction::Forward => self.steps.get_mut(self.current_step),
            Direction::Rollback => self.rollback_steps.get_mut(self.rollback_step),
        }
    }

    /// True once the procedure has done anything that rollback must undo.
    pub fn needs_rollback(&self) -> bool {
        !matches!(
            self.state,
            ProcedureState::Initial | ProcedureState::RolledBack
        )
    }

    pub fn is_rolling_back(&self) -> bool {
        matches!(
            self.state,
            ProcedureState::RollingBack
                | ProcedureState::RollbackSuspended
                | ProcedureState::RolledBack
                | ProcedureState::RollbackFailed
        )
    }

    /// Inverse of every completed forward step, last step first.
    pub fn build_rollback_steps(&mut self) {
        let completed: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .collect();
        self.rollback_steps = completed
            .into_iter()
            .rev()
            .enumerate()
            .map(|(i, s)| s.inverse(rollback_step_dn(&self.dn, i)))
            .collect();
        self.rollback_step = 0;
    }

    /// Removed bundles of `steps` per node, first occurrence order, without
    /// duplicates.
    pub fn removed_bundles(steps: &[Step]) -> Vec<RemovedBundle> {
        let mut removed: Vec<RemovedBundle> = Vec::new();
        for step in steps {
            let reboot_step = step.step_type == Some(StepType::NodeReboot);
            for bundle in &step.bundles_remove {
                let by_step = reboot_step && bundle.remove_needs_reboot();
                for node in step.bundle_nodes() {
                    match removed
                        .iter_mut()
                        .find(|r| r.bundle == bundle.dn && r.node == node)
                    {
                        Some(existing) => existing.removed_by_step |= by_step,
                        None => removed.push(RemovedBundle {
                            bundle: bundle.dn.clone(),
                            node,
                            removed_by_step: by_step,
                        }),
                    }
                }
            }
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn attr(&self, name: &str) -> Option<AttrValue> {
        match name {
            "state" => Some(self.state.as_str().into()),
            "current_step" => Some((self.current_step as u64).into()),
            "rollback_step" => Some((self.rollback_step as u64).into()),
            "exec_level" => Some(self.exec_level.into()),
            "error" => Some(self.error.clone().unwrap_or_default().into()),
            _ => None,
        }
    }

    pub fn to_attributes(&self) -> Attributes {
        ["state", "current_step", "rollback_step", "exec_level", "error"]
            .into_iter()
            .filter_map(|name| self.attr(name).map(|v| (name.to_string(), v)))
            .collect()
    }

    fn apply_attributes(&mut self, attrs: &Attributes) -> Result<()> {
        if let Some(state) = attrs.get("state").and_then(AttrValue::as_str) {
            self.state = state.parse()?;
        }
        if let Some(v) = attrs.get("current_step").and_then(AttrValue::as_u64) {
            self.current_step = v as usize;
        }
        if let Some(v) = attrs.get("rollback_step").and_then(AttrValue::as_u64) {
            self.rollback_step = v as usize;
        }
        if let Some(e) = attrs.get("error").and_then(AttrValue::as_str) {
            self.error = (!e.is_empty()).then(|| e.to_string());
        }
        Ok(())
    }

    /// Write the current value of one procedure attribute.
    pub fn persist_attr(&self, store: &dyn ObjectStore, name: &str) -> Result<()> {
        let value = self
            .attr(name)
            .ok_or_else(|| SmfError::Store(format!("unknown procedure attribute '{name}'")))?;
        store.write_attr(&self.dn, name, value)
    }

    pub fn persist_step(&self, store: &dyn ObjectStore, dir: Direction, index: usize) -> Result<()> {
        let Some(step) = self.steps(dir).get(index) else {
            return Ok(());
        };
        let attrs = step.to_attributes();
        if !store.exists(&step.dn)? {
            return store.create(&step.dn, attrs);
        }
        for (name, value) in attrs {
            store.write_attr(&step.dn, &name, value)?;
        }
        Ok(())
    }

    fn create_step_objects(&self, store: &dyn ObjectStore, dir: Direction) -> Result<()> {
        for step in self.steps(dir) {
            if !store.exists(&step.dn)? {
                store.create(&step.dn, step.to_attributes())?;
            }
        }
        Ok(())
    }

    /// Create the persisted rollback step objects after `build_rollback_steps`.
    pub fn persist_rollback_plan(&self, store: &dyn ObjectStore) -> Result<()> {
        self.create_step_objects(store, Direction::Rollback)?;
        self.persist_attr(store, "rollback_step")
    }

    /// Refresh runtime state from the persisted objects, if they exist.
    /// Returns false when the procedure was never persisted.
    pub fn reload(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        let Some(attrs) = store.read(&self.dn)? else {
            return Ok(false);
        };
        self.apply_attributes(&attrs)?;
        for step in &mut self.steps {
            if let Some(attrs) = store.read(&step.dn)? {
                step.apply_attributes(&attrs)?;
            }
        }
        if self.is_rolling_back() {
            let cursor = self.rollback_step;
            self.build_rollback_steps();
            self.rollback_step = cursor;
            for step in &mut self.rollback_steps {
                if let Some(attrs) = store.read(&step.dn)? {
                    step.apply_attributes(&attrs)?;
                }
            }
        }
        Ok(true)
    }

    /// Reload the persisted procedure, or create it when it does not exist
    /// yet. Creation happens at most once per procedure. Returns true when
    /// an existing object was reloaded.
    pub fn load_or_create(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        if self.reload(store)? {
            info!(
                procedure = %self.dn,
                state = %self.state,
                current_step = self.current_step,
                "reloaded persisted procedure"
            );
            return Ok(true);
        }
        store.create(&self.dn, self.to_attributes())?;
        self.create_step_objects(store, Direction::Forward)?;
        debug!(procedure = %self.dn, steps = self.steps.len(), "created procedure object");
        Ok(false)
    }

    /// Delete the procedure object and all its step objects.
    pub fn delete_objects(&self, store: &dyn ObjectStore) -> Result<()> {
        for dn in store.descendants(&self.dn)? {
            store.delete(&dn)?;
        }
        store.delete(&self.dn)
    }

    pub fn set_state(
        &mut self,
        store: &dyn ObjectStore,
        notifier: &dyn Notifier,
        state: ProcedureState,
        source: SourceIndicator,
    ) -> Result<()> {
        info!(procedure = %self.dn, from = %self.state, to = %state, "procedure state change");
        self.state = state;
        self.persist_attr(store, "state")?;
        let n = StateChangeNotification::new(
            &self.dn,
            PROCEDURE_STATE_CLASS,
            source,
            PROCEDURE_STATE_ATTR_ID,
            state.value(),
        );
        if let Err(e) = notifier.send(&n) {
            warn!(procedure = %self.dn, error = %e, "state change notification failed");
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
    use crate::notify::MemoryNotifier;
    use crate::parser::StepDescription;
    use crate::step::{Bundle, BundleScope};
    use crate::store::MemoryStore;

    const CAMPAIGN: &str = "safSmfCampaign=c1";
    const PL3: &str = "safAmfNode=PL-3,safAmfCluster=c";
    const PL4: &str = "safAmfNode=PL-4,safAmfCluster=c";

    fn unit(n: u32) -> String {
        format!("safSu=SU{n},safSg=SG1,safApp=A")
    }

    fn description(steps: usize) -> ProcedureDescription {
        ProcedureDescription {
            name: "p1".into(),
            exec_level: 1,
            steps: (0..steps)
                .map(|i| StepDescription {
                    activation_units: vec![unit(i as u32)],
                    deactivation_units: vec![unit(i as u32)],
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn step_dns_are_children_of_procedure() {
        let p = Procedure::from_description(CAMPAIGN, &description(2));
        assert_eq!(p.dn, "safSmfProc=p1,safSmfCampaign=c1");
        assert_eq!(p.steps[1].dn, "safSmfStep=0002,safSmfProc=p1,safSmfCampaign=c1");
    }

    #[test]
    fn load_or_create_creates_once_then_reloads() {
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let mut p = Procedure::from_description(CAMPAIGN, &description(2));
        assert!(!p.load_or_create(&store).unwrap());
        assert!(store.exists(&p.steps[1].dn).unwrap());

        p.set_state(&store, &notifier, ProcedureState::Executing, SourceIndicator::ObjectOperation)
            .unwrap();
        p.steps[0].state = StepState::Completed;
        p.persist_step(&store, Direction::Forward, 0).unwrap();
        p.current_step = 1;
        p.persist_attr(&store, "current_step").unwrap();

        let mut again = Procedure::from_description(CAMPAIGN, &description(2));
        assert!(again.load_or_create(&store).unwrap());
        assert_eq!(again.state, ProcedureState::Executing);
        assert_eq!(again.current_step, 1);
        assert_eq!(again.steps[0].state, StepState::Completed);
        assert_eq!(again.steps[1].state, StepState::Initial);
    }

    #[test]
    fn rollback_steps_invert_completed_steps_in_reverse() {
        let mut p = Procedure::from_description(CAMPAIGN, &description(3));
        p.steps[0].state = StepState::Completed;
        p.steps[1].state = StepState::Completed;
        p.steps[2].state = StepState::Failed;
        p.steps[0].bundles_add = vec![Bundle::new("b0")];

        p.build_rollback_steps();
        assert_eq!(p.rollback_steps.len(), 2);
        assert_eq!(p.rollback_steps[0].activation_units, vec![unit(1)]);
        assert_eq!(p.rollback_steps[1].activation_units, vec![unit(0)]);
        assert_eq!(p.rollback_steps[1].bundles_remove, vec![Bundle::new("b0")]);
        assert!(p.rollback_steps[0].dn.starts_with("safSmfStep=R0001,"));
    }

    #[test]
    fn reload_rebuilds_rollback_progress() {
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let mut p = Procedure::from_description(CAMPAIGN, &description(2));
        p.load_or_create(&store).unwrap();
        for i in 0..2 {
            p.steps[i].state = StepState::Completed;
            p.persist_step(&store, Direction::Forward, i).unwrap();
        }
        p.build_rollback_steps();
        p.persist_rollback_plan(&store).unwrap();
        p.set_state(&store, &notifier, ProcedureState::RollingBack, SourceIndicator::ManagementOperation)
            .unwrap();
        p.rollback_steps[0].state = StepState::Completed;
        p.persist_step(&store, Direction::Rollback, 0).unwrap();
        p.rollback_step = 1;
        p.persist_attr(&store, "rollback_step").unwrap();

        let mut again = Procedure::from_description(CAMPAIGN, &description(2));
        again.reload(&store).unwrap();
        assert_eq!(again.rollback_steps.len(), 2);
        assert_eq!(again.rollback_step, 1);
        assert_eq!(again.rollback_steps[0].state, StepState::Completed);
    }

    fn removed(bundle: &str, node: &str, removed_by_step: bool) -> RemovedBundle {
        RemovedBundle {
            bundle: bundle.into(),
            node: node.into(),
            removed_by_step,
        }
    }

    #[test]
    fn removed_bundles_are_deduplicated() {
        let mut a = Step::new("s=1");
        a.nodes = vec![PL3.into(), PL4.into()];
        a.bundles_remove = vec![Bundle::new("old")];
        let mut b = Step::new("s=2");
        b.nodes = vec![PL3.into()];
        b.bundles_remove = vec![Bundle::new("old"), Bundle::new("older")];

        assert_eq!(
            Procedure::removed_bundles(&[a, b]),
            vec![
                removed("old", PL3, false),
                removed("old", PL4, false),
                removed("older", PL3, false),
            ]
        );
    }

    #[test]
    fn reboot_scoped_removals_of_node_reboot_steps_are_marked() {
        let kmod = Bundle {
            dn: "kmod".into(),
            install_scope: BundleScope::Unit,
            remove_scope: BundleScope::Reboot,
        };
        let mut reboot = Step::new("s=1");
        reboot.step_type = Some(StepType::NodeReboot);
        reboot.target_node = Some(PL3.into());
        reboot.bundles_remove = vec![kmod.clone(), Bundle::new("plain")];
        // The same bundle on a node no reboot step touched.
        let mut sw = Step::new("s=2");
        sw.step_type = Some(StepType::SwInstall);
        sw.nodes = vec![PL4.into()];
        sw.bundles_remove = vec![kmod];

        assert_eq!(
            Procedure::removed_bundles(&[reboot, sw]),
            vec![
                removed("kmod", PL3, true),
                removed("plain", PL3, false),
                removed("kmod", PL4, false),
            ]
        );
    }

    #[test]
    fn set_state_notifies_once() {
        let store = MemoryStore::new();
        let notifier = MemoryNotifier::new();
        let mut p = Procedure::from_description(CAMPAIGN, &description(1));
        p.load_or_create(&store).unwrap();
        p.set_state(&store, &notifier, ProcedureState::Executing, SourceIndicator::ObjectOperation)
            .unwrap();
        let sent = notifier.for_dn(&p.dn);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].new_state, ProcedureState::Executing.value());
        assert_eq!(sent[0].class_id, PROCEDURE_STATE_CLASS);
    }

    #[test]
    fn delete_objects_removes_steps() {
        let store = MemoryStore::new();
        let mut p = Procedure::from_description(CAMPAIGN, &description(2));
        p.load_or_create(&store).unwrap();
        p.delete_objects(&store).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
