//! Stage 1: populate desired children, diff, and apply the diff to the package.

use kptcond_core::{condition_type, ConditionStatus, KubeObjectExt, Reference, DELETE_ANNOTATION, OWNER_ANNOTATION};
use tracing::{debug, trace, warn};

use crate::diff::{DiffObject, InventoryDiff};
use crate::error::{join_errors, SdkError};
use crate::inventory::{InventoryValue, OwnershipKind, Role, RoleContext};
use crate::Run;

fn create_condition_msg(kind: OwnershipKind) -> &'static str {
    match kind {
        OwnershipKind::LocalNoCondition => "child local resource -> done",
        OwnershipKind::InitialPlaceholder => "create initial resource condition",
        _ => "create condition",
    }
}

fn status_on_write(kind: OwnershipKind) -> ConditionStatus {
    if kind.positive_on_write() { ConditionStatus::True } else { ConditionStatus::False }
}

impl Run<'_> {
    /// Ask the populate function for the desired children of every for-object
    /// and record them as new resources. Failures are scoped to their for-object.
    pub(crate) fn populate_children(&mut self) {
        let cfg = self.cfg;
        let Some(populate) = cfg.populate_fn.as_ref() else { return };
        for (for_ref, node) in self.inv.get(Role::For, None) {
            let Some(for_obj) = node.existing_resource.as_ref() else { continue };
            let children = match populate(&self.ctx(Some(&for_ref)), for_obj) {
                Ok(children) => children,
                Err(e) => {
                    let err = self.callback_failed("populate", &for_ref, &e);
                    self.fail_scope(&for_ref, &err.to_string());
                    continue;
                }
            };
            let owner = condition_type(&for_ref);
            let mut errs = Vec::new();
            for mut child in children {
                let r = child.reference();
                let ctx = match self.inv.is_gvk_registered(&r.gvk()) {
                    Some(ctx @ RoleContext::Own(_)) => ctx,
                    other => {
                        errs.push(SdkError::invalid_ref(format!(
                            "populated object {} is not registered as own (got {:?})",
                            r, other
                        )));
                        continue;
                    }
                };
                trace!(for_ref = %for_ref, child = %r, "populated child");
                child.set_annotation(OWNER_ANNOTATION, &owner);
                errs.extend(self.inv.set(ctx, &[for_ref.clone(), r], InventoryValue::Resource(child), true).err());
            }
            if !errs.is_empty() {
                // bad children are skipped; their siblings still converge
                warn!(for_ref = %for_ref, errors = errs.len(), "populated children rejected");
                self.populate_errs.insert(for_ref, errs);
            }
        }
    }

    /// Diff the inventory and apply the result per for-object. When not ready
    /// only the teardown part of every diff is applied.
    pub(crate) fn update_children(&mut self) {
        let diffs = self.inv.diff();
        let ready = self.inv.is_ready();
        for (for_ref, diff) in diffs.iter() {
            let for_node = self.inv.get_node(Role::For, std::slice::from_ref(for_ref)).unwrap_or_default();
            let for_present = for_node.existing_resource.is_some();
            let applied = if !ready {
                self.apply_teardown(for_ref, diff, for_present)
            } else if for_node.failed {
                debug!(for_ref = %for_ref, "skipping diff of failed for-object");
                continue;
            } else {
                self.apply_diff(for_ref, diff, for_present)
            };
            let mut errs = self.populate_errs.remove(for_ref).unwrap_or_default();
            errs.extend(applied);
            if let Some(msg) = join_errors(&errs) {
                warn!(for_ref = %for_ref, errors = errs.len(), "stage1 update errors");
                self.fail_scope(for_ref, &format!("stage1: {}", msg));
            }
        }
        self.report.diffs = diffs;
    }

    fn apply_teardown(&mut self, for_ref: &Reference, diff: &InventoryDiff, for_present: bool) -> Vec<SdkError> {
        let mut errs = Vec::new();
        if diff.delete_for_condition {
            errs.extend(self.delete_condition(Role::For, std::slice::from_ref(for_ref)).err());
        }
        for o in diff.delete_objs.iter() {
            errs.extend(self.delete_obj(for_ref, o, "not ready", for_present).err());
        }
        errs
    }

    fn apply_diff(&mut self, for_ref: &Reference, diff: &InventoryDiff, for_present: bool) -> Vec<SdkError> {
        let mut errs = Vec::new();
        let scope = std::slice::from_ref(for_ref);
        if diff.delete_for_condition {
            trace!(for_ref = %for_ref, "delete for condition");
            errs.extend(self.delete_condition(Role::For, scope).err());
        }
        if diff.update_for_condition {
            trace!(for_ref = %for_ref, "update for condition");
            errs.extend(self.set_condition(RoleContext::For, scope, ConditionStatus::False, "update for condition").err());
        }
        for o in diff.create_conditions.iter() {
            let refs = [for_ref.clone(), o.reference.clone()];
            let ctx = RoleContext::Own(o.ownership);
            errs.extend(self.set_condition(ctx, &refs, status_on_write(o.ownership), create_condition_msg(o.ownership)).err());
        }
        for o in diff.delete_conditions.iter() {
            errs.extend(self.delete_condition(Role::Own, &[for_ref.clone(), o.reference.clone()]).err());
        }
        for o in diff.create_objs.iter() {
            errs.extend(self.write_obj(for_ref, o, "create resource", false).err());
        }
        for o in diff.update_objs.iter() {
            errs.extend(self.write_obj(for_ref, o, "update resource", false).err());
        }
        for o in diff.delete_objs.iter() {
            errs.extend(self.delete_obj(for_ref, o, "delete resource", for_present).err());
        }
        for o in diff.update_delete_annotations.iter() {
            errs.extend(self.write_obj(for_ref, o, "update resource", true).err());
        }
        errs
    }

    fn write_obj(&mut self, for_ref: &Reference, o: &DiffObject, msg: &str, always_write: bool) -> Result<(), SdkError> {
        let mut obj = o.object.clone().ok_or_else(|| SdkError::invalid_ref(format!("no object for {}", o.reference)))?;
        obj.remove_annotation(DELETE_ANNOTATION);
        let refs = [for_ref.clone(), o.reference.clone()];
        self.upsert_child_object(o.ownership, &refs, obj, status_on_write(o.ownership), msg, always_write)
    }

    fn delete_obj(&mut self, for_ref: &Reference, o: &DiffObject, msg: &str, with_condition: bool) -> Result<(), SdkError> {
        let obj = o.object.clone().ok_or_else(|| SdkError::invalid_ref(format!("no object for {}", o.reference)))?;
        let refs = [for_ref.clone(), o.reference.clone()];
        self.delete_child_object(o.ownership, &refs, obj, msg, with_condition)
    }
}
