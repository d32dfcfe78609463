//! Mutations applied to the package and mirrored into the inventory.
//!
//! Every helper writes the Kptfile or item list first and then records the
//! committed value as existing state, so readiness sees what was written.

use kptcond_core::{
    condition_type, ConditionRecord, ConditionStatus, DynamicObject, KubeObjectExt, Reference, DELETE_ANNOTATION,
};
use metrics::counter;
use tracing::{debug, warn};

use crate::error::SdkError;
use crate::inventory::{InventoryValue, OwnershipKind, Role, RoleContext};
use crate::Run;

impl Run<'_> {
    /// Write the condition of `refs`; an existing record keeps its owner and reason.
    pub(crate) fn set_condition(
        &mut self,
        ctx: RoleContext,
        refs: &[Reference],
        status: ConditionStatus,
        msg: &str,
    ) -> Result<(), SdkError> {
        let existing = self.inv.get_node(ctx.role(), refs).and_then(|n| n.existing_condition);
        let rec = match existing {
            Some(mut ec) => {
                ec.status = status;
                ec.message = msg.to_string();
                ec
            }
            None => ConditionRecord::for_refs(refs, status, msg)?,
        };
        if self.debug {
            debug!(condition = %rec.condition_type(), %status, msg, "set condition");
        }
        self.pkg.set_conditions(&[rec.to_wire()])?;
        self.inv.set(ctx, refs, InventoryValue::Condition(rec), false)
    }

    pub(crate) fn delete_condition(&mut self, role: Role, refs: &[Reference]) -> Result<(), SdkError> {
        let target = refs.last().ok_or_else(|| SdkError::invalid_ref("cannot delete condition without refs"))?;
        if self.debug {
            debug!(condition = %condition_type(target), "delete condition");
        }
        self.pkg.delete_condition(&condition_type(target))?;
        self.inv.delete(role, refs)
    }

    /// Put `obj` into the package and record it as the existing resource at `refs`.
    pub(crate) fn set_object(&mut self, ctx: RoleContext, refs: &[Reference], obj: DynamicObject) -> Result<(), SdkError> {
        if refs.iter().any(|r| !r.is_valid()) {
            return Err(SdkError::invalid_ref(format!("cannot set resource without valid refs: {:?}", refs)));
        }
        self.pkg.upsert(obj.clone());
        self.inv.set(ctx, refs, InventoryValue::Resource(obj), false)
    }

    /// Condition first, then the body. Bodies of remote-with-condition children
    /// are only written when `always_write` is set.
    pub(crate) fn upsert_child_object(
        &mut self,
        kind: OwnershipKind,
        refs: &[Reference],
        obj: DynamicObject,
        status: ConditionStatus,
        msg: &str,
        always_write: bool,
    ) -> Result<(), SdkError> {
        let ctx = RoleContext::Own(kind);
        let cond = self.set_condition(ctx, refs, status, msg);
        if always_write || kind != OwnershipKind::RemoteWithCondition {
            self.set_object(ctx, refs, obj)?;
        }
        cond
    }

    /// Phase one of the two-phase delete: mark the child and keep it in the package.
    /// The condition is rewritten only while the for-object still exists.
    pub(crate) fn delete_child_object(
        &mut self,
        kind: OwnershipKind,
        refs: &[Reference],
        mut obj: DynamicObject,
        msg: &str,
        with_condition: bool,
    ) -> Result<(), SdkError> {
        let ctx = RoleContext::Own(kind);
        let cond = if with_condition { self.set_condition(ctx, refs, ConditionStatus::False, msg) } else { Ok(()) };
        obj.set_annotation(DELETE_ANNOTATION, "true");
        self.set_object(ctx, refs, obj)?;
        cond
    }

    /// Drop a for-object from the package; its condition record stays.
    pub(crate) fn remove_for_object(&mut self, for_ref: &Reference, obj: &DynamicObject) -> Result<(), SdkError> {
        let n = self.pkg.remove(obj);
        debug!(for_ref = %for_ref, removed = n, "for-object removed from package");
        self.inv.delete_resource(Role::For, std::slice::from_ref(for_ref))?;
        self.report.removed.push(for_ref.clone());
        Ok(())
    }

    /// Record a scope failure: False for-condition with `msg`, failed flag, results entry.
    pub(crate) fn fail_scope(&mut self, for_ref: &Reference, msg: &str) {
        warn!(for_ref = %for_ref, error = msg, "reconcile failed for scope");
        let refs = std::slice::from_ref(for_ref);
        if let Err(e) = self.set_condition(RoleContext::For, refs, ConditionStatus::False, msg) {
            self.pkg.error(format!("cannot set failed condition: {}", e), Some(for_ref.clone()));
        }
        if let Err(e) = self.inv.mark_failed(Role::For, refs) {
            self.pkg.error(e.to_string(), Some(for_ref.clone()));
        }
        self.pkg.error(msg, Some(for_ref.clone()));
    }

    pub(crate) fn callback_failed(&self, stage: &'static str, reference: &Reference, err: &anyhow::Error) -> SdkError {
        counter!("kptcond_callback_errors_total", 1u64, "stage" => stage);
        SdkError::Callback { stage, reference: reference.clone(), message: format!("{:#}", err) }
    }
}
