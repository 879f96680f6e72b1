use crate::error::{Result, SmfError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// RDN attribute names
// ---------------------------------------------------------------------------

pub const CAMPAIGN_RDN: &str = "safSmfCampaign";
pub const NODE_RDN: &str = "safAmfNode";
pub const UNIT_RDN: &str = "safSu";
pub const COMPONENT_RDN: &str = "safComp";
pub const PROCEDURE_RDN: &str = "safSmfProc";
pub const STEP_RDN: &str = "safSmfStep";
pub const BUNDLE_RECORD_RDN: &str = "safInstalledSwBundle";

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

static DN_RE: OnceLock<Regex> = OnceLock::new();

fn dn_re() -> &'static Regex {
    // One or more `attr=value` pairs separated by commas; values may contain
    // escaped commas (`\,`).
    DN_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9]*=(?:[^,\\]|\\.)+(?:,[A-Za-z][A-Za-z0-9]*=(?:[^,\\]|\\.)+)*$")
            .unwrap()
    })
}

pub fn validate_dn(dn: &str) -> Result<()> {
    if dn.is_empty() || dn.len() > 256 || !dn_re().is_match(dn) {
        return Err(SmfError::InvalidDn(dn.to_string()));
    }
    Ok(())
}

/// The attribute name of the leftmost RDN (`safSu` for `safSu=SU1,safSg=..`).
pub fn rdn_attribute(dn: &str) -> &str {
    dn.split_once('=').map(|(attr, _)| attr).unwrap_or("")
}

pub fn procedure_dn(campaign: &str, name: &str) -> String {
    format!("{PROCEDURE_RDN}={name},{campaign}")
}

pub fn step_dn(procedure: &str, index: usize) -> String {
    format!("{STEP_RDN}={:04},{procedure}", index + 1)
}

/// DN of the `index`-th rollback step; rollback steps sort after the forward
/// steps of the same procedure.
pub fn rollback_step_dn(procedure: &str, index: usize) -> String {
    format!("{STEP_RDN}=R{:04},{procedure}", index + 1)
}

/// True for top-level campaign objects.
pub fn is_campaign_dn(dn: &str) -> bool {
    rdn_attribute(dn) == CAMPAIGN_RDN
}

pub fn bundle_record_dn(bundle: &str, node: &str) -> String {
    // The bundle DN is embedded as an RDN value, so its commas are escaped.
    format!(
        "{BUNDLE_RECORD_RDN}={},{node}",
        bundle.replace(',', "\\,")
    )
}

// ---------------------------------------------------------------------------
// UnitClass
// ---------------------------------------------------------------------------

/// Class of an activation or deactivation unit, derived from its DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitClass {
    Node,
    Unit,
    Component,
}

impl UnitClass {
    pub fn of(dn: &str) -> Option<UnitClass> {
        match rdn_attribute(dn) {
            NODE_RDN => Some(UnitClass::Node),
            UNIT_RDN => Some(UnitClass::Unit),
            COMPONENT_RDN => Some(UnitClass::Component),
            _ => None,
        }
    }
}

impl fmt::Display for UnitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitClass::Node => "node",
            UnitClass::Unit => "unit",
            UnitClass::Component => "component",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_dns() {
        for dn in [
            "safSmfCampaign=upgrade-1,safApp=safSmfService",
            "safAmfNode=PL-3,safAmfCluster=myCluster",
            "safSu=SU1,safSg=SG1,safApp=App1",
            "safInstalledSwBundle=safSmfBundle=b1\\,safRepository=r,safAmfNode=PL-3",
        ] {
            validate_dn(dn).unwrap_or_else(|_| panic!("expected valid: {dn}"));
        }
    }

    #[test]
    fn invalid_dns() {
        for dn in ["", "noequals", "=value", "a=b,", "a=b,,c=d", "1a=b"] {
            assert!(validate_dn(dn).is_err(), "expected invalid: {dn}");
        }
    }

    #[test]
    fn unit_class_from_first_rdn() {
        assert_eq!(
            UnitClass::of("safAmfNode=SC-1,safAmfCluster=c"),
            Some(UnitClass::Node)
        );
        assert_eq!(UnitClass::of("safSu=SU1,safSg=SG1,safApp=A"), Some(UnitClass::Unit));
        assert_eq!(
            UnitClass::of("safComp=C1,safSu=SU1,safSg=SG1,safApp=A"),
            Some(UnitClass::Component)
        );
        assert_eq!(UnitClass::of("safSg=SG1,safApp=A"), None);
    }

    #[test]
    fn child_dns() {
        let proc_dn = procedure_dn("safSmfCampaign=c1", "p1");
        assert_eq!(proc_dn, "safSmfProc=p1,safSmfCampaign=c1");
        assert_eq!(
            step_dn(&proc_dn, 0),
            "safSmfStep=0001,safSmfProc=p1,safSmfCampaign=c1"
        );
        assert_eq!(
            rollback_step_dn(&proc_dn, 1),
            "safSmfStep=R0002,safSmfProc=p1,safSmfCampaign=c1"
        );
        assert!(is_campaign_dn("safSmfCampaign=c1"));
        assert!(!is_campaign_dn(&proc_dn));
        let record = bundle_record_dn("safSmfBundle=b1,safRepository=r", "safAmfNode=PL-3");
        validate_dn(&record).unwrap();
        assert!(record.ends_with(",safAmfNode=PL-3"));
    }
}
