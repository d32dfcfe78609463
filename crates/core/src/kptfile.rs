//! Kptfile view: `status.conditions` and `info.readinessGates` of the package root.

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::warn;

use crate::{condition_type, Condition, ConditionStatus, CoreError, KubeObjectExt, Reference};

pub const KPTFILE_API_VERSION: &str = "kpt.dev/v1";
pub const KPTFILE_KIND: &str = "Kptfile";
/// Path annotation kpt sets on every item; the root Kptfile sits at `Kptfile`.
pub const PATH_ANNOTATION: &str = "internal.config.kubernetes.io/path";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessGate {
    pub condition_type: String,
}

pub fn is_root_kptfile(o: &DynamicObject) -> bool {
    if o.kind() != KPTFILE_KIND || o.api_version() != KPTFILE_API_VERSION {
        return false;
    }
    match o.annotation(PATH_ANNOTATION) {
        None => true,
        Some(p) => p == "Kptfile",
    }
}

fn nested<'a>(o: &'a DynamicObject, outer: &str, inner: &str) -> Option<&'a Json> {
    o.data.get(outer).and_then(|v| v.get(inner))
}

fn set_nested(o: &mut DynamicObject, outer: &str, inner: &str, value: Json) -> Result<(), CoreError> {
    if !o.data.is_object() {
        o.data = Json::Object(serde_json::Map::new());
    }
    let root = o.data.as_object_mut().ok_or_else(|| CoreError::MissingField("data".into()))?;
    let entry = root.entry(outer.to_string()).or_insert_with(|| Json::Object(serde_json::Map::new()));
    if !entry.is_object() {
        *entry = Json::Object(serde_json::Map::new());
    }
    let map = entry.as_object_mut().ok_or_else(|| CoreError::MissingField(outer.to_string()))?;
    map.insert(inner.to_string(), value);
    Ok(())
}

/// Copy of the current condition list; malformed entries are skipped.
pub fn conditions(o: &DynamicObject) -> Vec<Condition> {
    let Some(list) = nested(o, "status", "conditions").and_then(|v| v.as_array()) else { return Vec::new() };
    list.iter()
        .filter_map(|c| match serde_json::from_value::<Condition>(c.clone()) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "skipping malformed Kptfile condition");
                None
            }
        })
        .collect()
}

pub fn condition<'a>(list: &'a [Condition], ct: &str) -> Option<&'a Condition> {
    list.iter().find(|c| c.type_ == ct)
}

fn write_conditions(o: &mut DynamicObject, list: &[Condition]) -> Result<(), CoreError> {
    set_nested(o, "status", "conditions", serde_json::to_value(list)?)
}

/// Overwrite conditions with a matching type, append the rest.
pub fn set_conditions(o: &mut DynamicObject, new: &[Condition]) -> Result<(), CoreError> {
    let mut list = conditions(o);
    for nc in new {
        match list.iter_mut().find(|ec| ec.type_ == nc.type_) {
            Some(ec) => *ec = nc.clone(),
            None => list.push(nc.clone()),
        }
    }
    write_conditions(o, &list)
}

pub fn delete_condition(o: &mut DynamicObject, ct: &str) -> Result<(), CoreError> {
    let mut list = conditions(o);
    let before = list.len();
    list.retain(|c| c.type_ != ct);
    if list.len() == before {
        return Ok(());
    }
    write_conditions(o, &list)
}

/// Flip the condition of `r` to False with `msg`, keeping its reason (and so its owner).
pub fn set_failed(o: &mut DynamicObject, r: &Reference, msg: &str) -> Result<(), CoreError> {
    let ct = condition_type(r);
    let list = conditions(o);
    let c = match condition(&list, &ct) {
        Some(ec) => Condition { status: ConditionStatus::False, message: msg.to_string(), ..ec.clone() },
        None => Condition { type_: ct, status: ConditionStatus::False, reason: String::new(), message: msg.to_string() },
    };
    set_conditions(o, &[c])
}

pub fn readiness_gates(o: &DynamicObject) -> Vec<ReadinessGate> {
    nested(o, "info", "readinessGates")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

pub fn set_readiness_gates(o: &mut DynamicObject, cts: &[&str]) -> Result<(), CoreError> {
    let mut gates = readiness_gates(o);
    for ct in cts {
        if !gates.iter().any(|g| g.condition_type == *ct) {
            gates.push(ReadinessGate { condition_type: ct.to_string() });
        }
    }
    set_nested(o, "info", "readinessGates", serde_json::to_value(gates)?)
}

/// At least one condition type starts with `prefix` and none of them is False.
pub fn is_ready(o: &DynamicObject, prefix: &str) -> bool {
    let mut found = false;
    for c in conditions(o).iter().filter(|c| c.type_.starts_with(prefix)) {
        found = true;
        if c.status == ConditionStatus::False {
            return false;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::new_object;

    fn cond(t: &str, s: ConditionStatus) -> Condition {
        Condition { type_: t.into(), status: s, reason: String::new(), message: String::new() }
    }

    #[test]
    fn set_conditions_upserts_by_type() {
        let mut kf = new_object(KPTFILE_API_VERSION, KPTFILE_KIND, "pkg");
        set_conditions(&mut kf, &[cond("a/v1.X.x", ConditionStatus::False)]).unwrap();
        set_conditions(&mut kf, &[cond("a/v1.X.x", ConditionStatus::True), cond("a/v1.X.y", ConditionStatus::False)])
            .unwrap();
        let list = conditions(&kf);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].status, ConditionStatus::True);
        assert_eq!(list[1].type_, "a/v1.X.y");
    }

    #[test]
    fn delete_condition_removes_only_matching_type() {
        let mut kf = new_object(KPTFILE_API_VERSION, KPTFILE_KIND, "pkg");
        set_conditions(&mut kf, &[cond("a", ConditionStatus::True), cond("b", ConditionStatus::True)]).unwrap();
        delete_condition(&mut kf, "a").unwrap();
        let list = conditions(&kf);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].type_, "b");
        delete_condition(&mut kf, "missing").unwrap();
        assert_eq!(conditions(&kf).len(), 1);

        let mut bare = new_object(KPTFILE_API_VERSION, KPTFILE_KIND, "pkg");
        delete_condition(&mut bare, "a").unwrap();
        assert!(bare.data.get("status").is_none());
    }

    #[test]
    fn set_failed_keeps_reason() {
        let mut kf = new_object(KPTFILE_API_VERSION, KPTFILE_KIND, "pkg");
        let x = Reference::new("a/v1", "X", "x");
        let existing = Condition {
            type_: condition_type(&x),
            status: ConditionStatus::True,
            reason: "p/v1.P.p".into(),
            message: "done".into(),
        };
        set_conditions(&mut kf, &[existing]).unwrap();
        set_failed(&mut kf, &x, "boom").unwrap();
        let list = conditions(&kf);
        assert_eq!(list[0].status, ConditionStatus::False);
        assert_eq!(list[0].reason, "p/v1.P.p");
        assert_eq!(list[0].message, "boom");
    }

    #[test]
    fn readiness_gates_are_deduplicated() {
        let mut kf = new_object(KPTFILE_API_VERSION, KPTFILE_KIND, "pkg");
        set_readiness_gates(&mut kf, &["g1"]).unwrap();
        set_readiness_gates(&mut kf, &["g1", "g2"]).unwrap();
        let gates = readiness_gates(&kf);
        assert_eq!(gates.len(), 2);
        assert_eq!(gates[1].condition_type, "g2");
    }

    #[test]
    fn is_ready_needs_a_match_and_no_false() {
        let mut kf = new_object(KPTFILE_API_VERSION, KPTFILE_KIND, "pkg");
        assert!(!is_ready(&kf, "a/v1.X"));
        set_conditions(&mut kf, &[cond("a/v1.X.x", ConditionStatus::True), cond("b/v1.Y.y", ConditionStatus::False)])
            .unwrap();
        assert!(is_ready(&kf, "a/v1.X"));
        set_conditions(&mut kf, &[cond("a/v1.X.z", ConditionStatus::False)]).unwrap();
        assert!(!is_ready(&kf, "a/v1.X"));
    }

    #[test]
    fn root_detection_uses_path_annotation() {
        let mut kf = new_object(KPTFILE_API_VERSION, KPTFILE_KIND, "pkg");
        assert!(is_root_kptfile(&kf));
        kf.set_annotation(PATH_ANNOTATION, "sub/Kptfile");
        assert!(!is_root_kptfile(&kf));
        kf.set_annotation(PATH_ANNOTATION, "Kptfile");
        assert!(is_root_kptfile(&kf));
    }
}
