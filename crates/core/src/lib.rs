//! kptcond core types: object references, condition records and the package model.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod kptfile;
pub mod object;
pub mod package;

pub use object::KubeObjectExt;
pub use package::{Package, ResultItem, Severity};

/// Re-export of the KRM object type every package item is parsed into.
pub use kube::core::DynamicObject;

/// Annotation carrying the encoded for-Reference that owns a child object.
pub const OWNER_ANNOTATION: &str = "specializer.nephio.org/owner";
/// Two-phase delete marker; the object is physically removed by whoever owns its lifecycle.
pub const DELETE_ANNOTATION: &str = "specializer.nephio.org/delete";
/// Presence on a for-object turns on verbose inventory listings.
pub const DEBUG_ANNOTATION: &str = "specializer.nephio.org/debug";

/// Matches any apiVersion or kind in an own registration.
pub const WILDCARD: &str = "*";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// (apiVersion, kind, name) triple identifying a configuration object.
///
/// Equality is structural and empty fields are significant. Ordering follows
/// the field order, which keeps every map keyed by `Reference` deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl Reference {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), name: name.into() }
    }

    pub fn gvk(&self) -> Gvk {
        Gvk { api_version: self.api_version.clone(), kind: self.kind.clone() }
    }

    /// A reference addressing a single object: apiVersion, kind and name all set.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.api_version.is_empty() || self.kind.is_empty() || self.name.is_empty() {
            return Err(CoreError::InvalidReference(format!("gvk or name not initialized, got: {:?}", self)));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool { self.validate().is_ok() }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&condition_type(self))
    }
}

/// (apiVersion, kind) pair; the key the role registry is built on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gvk {
    pub api_version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    pub fn wildcard() -> Self { Self::new(WILDCARD, WILDCARD) }

    pub fn is_wildcard(&self) -> bool { self.api_version == WILDCARD && self.kind == WILDCARD }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.api_version.is_empty() || self.kind.is_empty() {
            return Err(CoreError::InvalidReference(format!("gvk not initialized, got: {:?}", self)));
        }
        Ok(())
    }

    pub fn with_name(&self, name: impl Into<String>) -> Reference {
        Reference { api_version: self.api_version.clone(), kind: self.kind.clone(), name: name.into() }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Render a reference as `group/version.Kind.name`; empty parts are left out.
pub fn condition_type(r: &Reference) -> String {
    let mut parts: SmallVec<[&str; 3]> = SmallVec::new();
    // apiVersion with more than one '/' is not a group/version and is dropped
    if !r.api_version.is_empty() && r.api_version.matches('/').count() <= 1 {
        parts.push(&r.api_version);
    }
    if !r.kind.is_empty() { parts.push(&r.kind); }
    if !r.name.is_empty() { parts.push(&r.name); }
    parts.join(".")
}

/// Inverse of [`condition_type`] for fully qualified references.
///
/// Only strings carrying version, kind and name decode; the name is everything
/// after the second dot so dotted object names survive the round trip.
pub fn parse_condition_type(s: &str) -> Option<Reference> {
    let (group, vkn) = match s.split_once('/') {
        Some((g, rest)) => {
            if g.is_empty() { return None; }
            (g, rest)
        }
        None => ("", s),
    };
    let mut it = vkn.splitn(3, '.');
    let version = it.next().filter(|v| !v.is_empty())?;
    let kind = it.next().filter(|k| !k.is_empty())?;
    let name = it.next().filter(|n| !n.is_empty())?;
    let api_version = if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) };
    Some(Reference { api_version, kind: kind.to_string(), name: name.to_string() })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Self::True => "True", Self::False => "False", Self::Unknown => "Unknown" };
        f.write_str(s)
    }
}

/// Condition as persisted in the Kptfile `status.conditions` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Well-known reasons written by the engine on records without an owner.
pub mod reason {
    pub const READY: &str = "Ready";
    pub const FAILED: &str = "Failed";
    pub const SPECIALIZE: &str = "Specialize";
}

/// Structured view of a condition: the owner is a typed field instead of a
/// string hidden in `reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRecord {
    pub reference: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Reference>,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl ConditionRecord {
    /// Build the record addressed by `[forRef]` or `[forRef, childRef]`.
    pub fn for_refs(refs: &[Reference], status: ConditionStatus, message: impl Into<String>) -> Result<Self, CoreError> {
        match refs {
            [for_ref] => {
                for_ref.validate()?;
                Ok(Self { reference: for_ref.clone(), owner: None, status, reason: String::new(), message: message.into() })
            }
            [for_ref, child] => {
                for_ref.validate()?;
                child.validate()?;
                Ok(Self {
                    reference: child.clone(),
                    owner: Some(for_ref.clone()),
                    status,
                    reason: String::new(),
                    message: message.into(),
                })
            }
            _ => Err(CoreError::InvalidReference(format!("expected 1 or 2 refs, got {}", refs.len()))),
        }
    }

    /// Decode a persisted condition. Returns `None` when the type is not a reference.
    pub fn from_wire(c: &Condition) -> Option<Self> {
        let reference = parse_condition_type(&c.type_)?;
        let owner = parse_condition_type(&c.reason);
        let reason = if owner.is_some() { String::new() } else { c.reason.clone() };
        Some(Self { reference, owner, status: c.status, reason, message: c.message.clone() })
    }

    pub fn to_wire(&self) -> Condition {
        let reason = match &self.owner {
            Some(o) => condition_type(o),
            None => self.reason.clone(),
        };
        Condition { type_: condition_type(&self.reference), status: self.status, reason, message: self.message.clone() }
    }

    pub fn condition_type(&self) -> String { condition_type(&self.reference) }

    pub fn is_true(&self) -> bool { self.status == ConditionStatus::True }
}

pub mod prelude {
    pub use super::{
        condition_type, parse_condition_type, Condition, ConditionRecord, ConditionStatus, DynamicObject, Gvk,
        KubeObjectExt, Package, Reference,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_type_renders_group_version_kind_name() {
        let r = Reference::new("ipam.resource.nephio.org/v1alpha1", "IPClaim", "n3");
        assert_eq!(condition_type(&r), "ipam.resource.nephio.org/v1alpha1.IPClaim.n3");
        let core = Reference::new("v1", "ConfigMap", "cm");
        assert_eq!(condition_type(&core), "v1.ConfigMap.cm");
        let gvk_only = Reference::new("a/b", "Kind", "");
        assert_eq!(condition_type(&gvk_only), "a/b.Kind");
    }

    #[test]
    fn parse_condition_type_requires_all_parts() {
        assert_eq!(
            parse_condition_type("req.nephio.org/v1alpha1.Interface.n3"),
            Some(Reference::new("req.nephio.org/v1alpha1", "Interface", "n3"))
        );
        assert_eq!(parse_condition_type("v1.ConfigMap.cm"), Some(Reference::new("v1", "ConfigMap", "cm")));
        assert_eq!(parse_condition_type("a/b.Kind"), None);
        assert_eq!(parse_condition_type("Failed"), None);
        assert_eq!(parse_condition_type(""), None);
        assert_eq!(parse_condition_type("/v1.Kind.name"), None);
    }

    #[test]
    fn dotted_names_survive_round_trip() {
        let r = Reference::new("a.b/v1", "Thing", "upf.region1.example");
        assert_eq!(parse_condition_type(&condition_type(&r)), Some(r));
    }

    #[test]
    fn condition_record_keeps_owner_structured() {
        let x = Reference::new("a/v1", "X", "x");
        let c = Reference::new("b/v1", "C", "c");
        let rec = ConditionRecord::for_refs(&[x.clone(), c.clone()], ConditionStatus::False, "create condition").unwrap();
        let wire = rec.to_wire();
        assert_eq!(wire.type_, "b/v1.C.c");
        assert_eq!(wire.reason, "a/v1.X.x");
        let back = ConditionRecord::from_wire(&wire).unwrap();
        assert_eq!(back.owner, Some(x));
        assert_eq!(back.reference, c);
        assert!(back.reason.is_empty());
    }

    #[test]
    fn literal_reasons_do_not_decode_as_owner() {
        let wire = Condition {
            type_: "a/v1.X.x".into(),
            status: ConditionStatus::False,
            reason: reason::FAILED.into(),
            message: "boom".into(),
        };
        let rec = ConditionRecord::from_wire(&wire).unwrap();
        assert_eq!(rec.owner, None);
        assert_eq!(rec.reason, "Failed");
        assert_eq!(rec.to_wire(), wire);
    }

    #[test]
    fn for_refs_rejects_bad_shapes() {
        assert!(ConditionRecord::for_refs(&[], ConditionStatus::True, "").is_err());
        let partial = Reference::new("a/v1", "X", "");
        assert!(ConditionRecord::for_refs(&[partial], ConditionStatus::True, "").is_err());
        let x = Reference::new("a/v1", "X", "x");
        assert!(ConditionRecord::for_refs(&[x.clone(), x.clone(), x], ConditionStatus::True, "").is_err());
    }
}
