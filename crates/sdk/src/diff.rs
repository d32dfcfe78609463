//! Three-way diff per for-object: existing body, desired body and condition record.

use std::collections::BTreeMap;

use kptcond_core::{DynamicObject, KubeObjectExt, Reference};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, trace};

use crate::inventory::{Inventory, InventoryNode, OwnershipKind, Role};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffObject {
    pub reference: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<DynamicObject>,
    pub ownership: OwnershipKind,
}

impl DiffObject {
    fn new(reference: &Reference, object: Option<&DynamicObject>, ownership: OwnershipKind) -> Self {
        Self { reference: reference.clone(), object: object.cloned(), ownership }
    }
}

/// Actions converging one for-object's children. Lists follow reference order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryDiff {
    pub delete_for_condition: bool,
    pub update_for_condition: bool,
    pub create_objs: Vec<DiffObject>,
    pub update_objs: Vec<DiffObject>,
    pub delete_objs: Vec<DiffObject>,
    pub create_conditions: Vec<DiffObject>,
    pub delete_conditions: Vec<DiffObject>,
    /// Children still desired but carrying a stale delete marker.
    pub update_delete_annotations: Vec<DiffObject>,
}

impl InventoryDiff {
    /// Child actions. `delete_for_condition` marks teardown and is not counted:
    /// deleting an already absent record changes nothing.
    pub fn actions(&self) -> usize {
        self.create_objs.len()
            + self.update_objs.len()
            + self.delete_objs.len()
            + self.create_conditions.len()
            + self.delete_conditions.len()
            + self.update_delete_annotations.len()
    }

    pub fn is_empty(&self) -> bool { self.actions() == 0 && !self.update_for_condition }
}

/// Structural compare of the `spec` sub-objects; metadata and status drift is ignored.
fn spec_differs(existing: &DynamicObject, new: &DynamicObject) -> bool { existing.spec() != new.spec() }

fn teardown(diff: &mut InventoryDiff, children: &BTreeMap<Reference, InventoryNode>) {
    // a for-object known only through its condition, with no children, is a
    // placeholder written upstream and waits for stage 2 to generate it
    diff.delete_for_condition = !children.is_empty();
    for (r, n) in children {
        let kind = n.ownership_kind();
        if n.existing_condition.is_some() {
            diff.delete_conditions.push(DiffObject::new(r, None, kind));
        }
        if let Some(e) = n.existing_resource.as_ref() {
            if kind.engine_deletes() && !e.is_marked_for_deletion() {
                diff.delete_objs.push(DiffObject::new(r, Some(e), kind));
            }
        }
    }
}

fn converge(diff: &mut InventoryDiff, children: &BTreeMap<Reference, InventoryNode>, ready: bool) {
    for (r, n) in children {
        let kind = n.ownership_kind();
        trace!(child = %r, ?kind, existing = n.existing_resource.is_some(), new = n.new_resource.is_some(),
            condition = n.existing_condition.is_some(), "diff child");

        match (&n.new_resource, &n.existing_condition) {
            (Some(new), None) => diff.create_conditions.push(DiffObject::new(r, Some(new), kind)),
            (None, Some(_)) => {
                // a body still in the package keeps its condition until it is gone
                if n.existing_resource.is_none() || kind == OwnershipKind::RemoteWithCondition {
                    diff.delete_conditions.push(DiffObject::new(r, None, kind));
                }
            }
            (None, None) => {
                if let Some(e) = n.existing_resource.as_ref() {
                    if kind == OwnershipKind::InitialPlaceholder && ready {
                        diff.create_conditions.push(DiffObject::new(r, Some(e), kind));
                    }
                }
            }
            (Some(_), Some(_)) => {}
        }

        if kind == OwnershipKind::RemoteWithCondition {
            continue;
        }
        match (&n.existing_resource, &n.new_resource) {
            (None, Some(new)) => diff.create_objs.push(DiffObject::new(r, Some(new), kind)),
            (Some(e), None) => {
                if kind.engine_deletes() && !e.is_marked_for_deletion() {
                    diff.delete_objs.push(DiffObject::new(r, Some(e), kind));
                }
            }
            (Some(e), Some(new)) => {
                if e.is_marked_for_deletion() {
                    diff.update_delete_annotations.push(DiffObject::new(r, Some(new), kind));
                } else if kind != OwnershipKind::InitialPlaceholder && spec_differs(e, new) {
                    diff.update_objs.push(DiffObject::new(r, Some(new), kind));
                }
            }
            (None, None) => {}
        }
    }
    diff.update_for_condition = diff.actions() > 0;
}

impl Inventory {
    /// Compare existing against desired state for every for-object in the inventory.
    pub fn diff(&self) -> BTreeMap<Reference, InventoryDiff> {
        let ready = self.is_ready();
        let st = self.read();
        let mut out = BTreeMap::new();
        for (for_ref, entry) in st.roots_of(Role::For) {
            let children: BTreeMap<Reference, InventoryNode> =
                st.children_of(for_ref, Role::Own).map(|(r, n)| (r.clone(), n.clone())).collect();
            let mut diff = InventoryDiff::default();
            if entry.node.existing_resource.is_none() {
                teardown(&mut diff, &children);
            } else {
                converge(&mut diff, &children, ready);
            }
            if !diff.is_empty() {
                debug!(for_ref = %for_ref, actions = diff.actions(), update_for_condition = diff.update_for_condition,
                    delete_for_condition = diff.delete_for_condition, "diff computed");
                counter!("kptcond_diff_actions_total", diff.actions() as u64);
            }
            out.insert(for_ref.clone(), diff);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryValue, RoleContext};
    use kptcond_core::object::new_object;
    use kptcond_core::{ConditionRecord, ConditionStatus, Gvk, DELETE_ANNOTATION};

    fn x() -> Reference { Reference::new("a.dev/v1", "X", "x") }
    fn c() -> Reference { Reference::new("b.dev/v1", "C", "c") }

    fn with_spec(r: &Reference, v: i64) -> DynamicObject {
        let mut o = new_object(&r.api_version, &r.kind, &r.name);
        o.data["spec"] = serde_json::json!({ "v": v });
        o
    }

    fn inv(kind: OwnershipKind) -> Inventory {
        let mut inv = Inventory::new();
        inv.register(Gvk::new("a.dev/v1", "X"), RoleContext::For).unwrap();
        inv.register(Gvk::new("b.dev/v1", "C"), RoleContext::Own(kind)).unwrap();
        inv
    }

    fn set_for(inv: &Inventory) {
        inv.set(RoleContext::For, &[x()], InventoryValue::Resource(with_spec(&x(), 0)), false).unwrap();
    }

    fn set_child(inv: &Inventory, kind: OwnershipKind, v: InventoryValue, is_new: bool) {
        inv.set(RoleContext::Own(kind), &[x(), c()], v, is_new).unwrap();
    }

    fn child_cond(status: ConditionStatus) -> InventoryValue {
        InventoryValue::Condition(ConditionRecord::for_refs(&[x(), c()], status, "").unwrap())
    }

    fn refs(list: &[DiffObject]) -> Vec<Reference> { list.iter().map(|o| o.reference.clone()).collect() }

    #[test]
    fn new_child_is_created_with_condition() {
        let k = OwnershipKind::RemoteWithBody;
        let inv = inv(k);
        set_for(&inv);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), true);
        let d = &inv.diff()[&x()];
        assert_eq!(refs(&d.create_objs), vec![c()]);
        assert_eq!(refs(&d.create_conditions), vec![c()]);
        assert!(d.update_for_condition);
        assert!(!d.delete_for_condition);
        assert!(d.update_objs.is_empty() && d.delete_objs.is_empty());
    }

    #[test]
    fn unchanged_child_yields_empty_diff() {
        let k = OwnershipKind::RemoteWithBody;
        let inv = inv(k);
        set_for(&inv);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), false);
        let mut churned = with_spec(&c(), 1);
        churned.data["status"] = serde_json::json!({ "observed": 7 });
        set_child(&inv, k, InventoryValue::Resource(churned), true);
        set_child(&inv, k, child_cond(ConditionStatus::False), false);
        assert!(inv.diff()[&x()].is_empty());
    }

    #[test]
    fn spec_change_is_an_update() {
        let k = OwnershipKind::RemoteWithBody;
        let inv = inv(k);
        set_for(&inv);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), false);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 2)), true);
        set_child(&inv, k, child_cond(ConditionStatus::True), false);
        let d = &inv.diff()[&x()];
        assert_eq!(refs(&d.update_objs), vec![c()]);
        assert!(d.update_for_condition);
        assert!(d.create_objs.is_empty());
    }

    #[test]
    fn absent_for_object_tears_down_children() {
        let k = OwnershipKind::RemoteWithBody;
        let inv = inv(k);
        inv.set(
            RoleContext::For,
            &[x()],
            InventoryValue::Condition(ConditionRecord::for_refs(&[x()], ConditionStatus::True, "").unwrap()),
            false,
        )
        .unwrap();
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), false);
        set_child(&inv, k, child_cond(ConditionStatus::True), false);
        let d = &inv.diff()[&x()];
        assert!(d.delete_for_condition);
        assert!(!d.update_for_condition);
        assert_eq!(refs(&d.delete_objs), vec![c()]);
        assert_eq!(refs(&d.delete_conditions), vec![c()]);
    }

    #[test]
    fn teardown_is_flagged_after_the_for_condition_is_gone() {
        let k = OwnershipKind::RemoteWithBody;
        let inv = inv(k);
        let mut marked = with_spec(&c(), 1);
        marked.set_annotation(DELETE_ANNOTATION, "true");
        set_child(&inv, k, InventoryValue::Resource(marked), false);
        let d = &inv.diff()[&x()];
        assert!(d.delete_for_condition);
        assert!(d.delete_objs.is_empty() && d.delete_conditions.is_empty());
        assert_eq!(d.actions(), 0);
    }

    #[test]
    fn absent_for_object_without_owns_keeps_its_condition() {
        let mut inv = Inventory::new();
        inv.register(Gvk::new("a.dev/v1", "X"), RoleContext::For).unwrap();
        inv.set(
            RoleContext::For,
            &[x()],
            InventoryValue::Condition(ConditionRecord::for_refs(&[x()], ConditionStatus::False, "").unwrap()),
            false,
        )
        .unwrap();
        assert!(inv.diff()[&x()].is_empty());
    }

    #[test]
    fn remote_condition_children_never_get_body_actions() {
        let k = OwnershipKind::RemoteWithCondition;
        let inv = inv(k);
        set_for(&inv);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), false);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 2)), true);
        let d = &inv.diff()[&x()];
        assert!(d.update_objs.is_empty() && d.delete_objs.is_empty() && d.create_objs.is_empty());
        assert_eq!(refs(&d.create_conditions), vec![c()]);

        // no longer desired: only the condition goes
        let inv2 = self::inv(k);
        set_for(&inv2);
        set_child(&inv2, k, InventoryValue::Resource(with_spec(&c(), 1)), false);
        set_child(&inv2, k, child_cond(ConditionStatus::True), false);
        let d = &inv2.diff()[&x()];
        assert!(d.delete_objs.is_empty());
        assert_eq!(refs(&d.delete_conditions), vec![c()]);
    }

    #[test]
    fn undesired_body_is_marked_once() {
        let k = OwnershipKind::LocalNoCondition;
        let inv = inv(k);
        set_for(&inv);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), false);
        set_child(&inv, k, child_cond(ConditionStatus::True), false);
        let d = &inv.diff()[&x()];
        assert_eq!(refs(&d.delete_objs), vec![c()]);
        // condition stays while the body is still in the package
        assert!(d.delete_conditions.is_empty());

        let mut marked = with_spec(&c(), 1);
        marked.set_annotation(DELETE_ANNOTATION, "true");
        set_child(&inv, k, InventoryValue::Resource(marked), false);
        assert!(inv.diff()[&x()].is_empty());
    }

    #[test]
    fn stale_delete_marker_is_cleared_when_still_desired() {
        let k = OwnershipKind::RemoteWithBody;
        let inv = inv(k);
        set_for(&inv);
        let mut marked = with_spec(&c(), 1);
        marked.set_annotation(DELETE_ANNOTATION, "true");
        set_child(&inv, k, InventoryValue::Resource(marked), false);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), true);
        set_child(&inv, k, child_cond(ConditionStatus::False), false);
        let d = &inv.diff()[&x()];
        assert_eq!(refs(&d.update_delete_annotations), vec![c()]);
        assert!(d.update_objs.is_empty());
        assert!(d.update_for_condition);
    }

    #[test]
    fn initial_placeholder_gets_condition_but_no_updates() {
        let k = OwnershipKind::InitialPlaceholder;
        let inv = inv(k);
        set_for(&inv);
        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 1)), false);
        let d = &inv.diff()[&x()];
        assert_eq!(refs(&d.create_conditions), vec![c()]);
        assert!(d.delete_objs.is_empty());

        set_child(&inv, k, InventoryValue::Resource(with_spec(&c(), 9)), true);
        set_child(&inv, k, child_cond(ConditionStatus::True), false);
        assert!(inv.diff()[&x()].is_empty());
    }
}
