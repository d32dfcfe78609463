//! Readiness evaluation: global (watch callbacks, global watches) and per for-object.

use std::collections::BTreeMap;

use kptcond_core::{ConditionStatus, DynamicObject, KubeObjectExt, Reference};
use tracing::debug;

use crate::inventory::{Inventory, Role};

/// Readiness of one for-object together with the children stage 2 hands to the update function.
#[derive(Debug, Clone, Default)]
pub struct ReadyCtx {
    pub ready: bool,
    /// A failure was recorded on the for-condition this run.
    pub failed: bool,
    pub for_obj: Option<DynamicObject>,
    pub owns: BTreeMap<Reference, DynamicObject>,
    pub watches: BTreeMap<Reference, DynamicObject>,
}

impl ReadyCtx {
    /// Children in the order the update function sees them: owns, then watches.
    pub fn children(&self) -> Vec<DynamicObject> { self.owns.values().chain(self.watches.values()).cloned().collect() }
}

impl Inventory {
    /// False when a global watch callback failed, or a global watch is pending:
    /// its condition is False, or it has neither a body nor a True condition.
    pub fn is_ready(&self) -> bool {
        let st = self.read();
        if st.watch_failed {
            return false;
        }
        for (r, e) in st.roots_of(Role::Watch) {
            let n = &e.node;
            let cond = n.existing_condition.as_ref();
            if cond.is_some_and(|c| c.status == ConditionStatus::False) {
                debug!(watch = %r, "global watch condition is false");
                return false;
            }
            if n.existing_resource.is_none() && !cond.is_some_and(|c| c.is_true()) {
                debug!(watch = %r, "global watch resource missing");
                return false;
            }
        }
        true
    }

    /// Per for-object readiness: every owned child has a True condition and every
    /// scoped watch has one too, unless the watch is the for-object's own owner.
    pub fn get_ready_map(&self) -> BTreeMap<Reference, ReadyCtx> {
        let st = self.read();
        let mut out = BTreeMap::new();
        for (for_ref, entry) in st.roots_of(Role::For) {
            let for_node = &entry.node;
            let for_owner = for_node
                .existing_condition
                .as_ref()
                .and_then(|c| c.owner.clone())
                .or_else(|| for_node.existing_resource.as_ref().and_then(|o| o.owner()));
            let mut ctx = ReadyCtx {
                ready: true,
                failed: for_node.failed,
                for_obj: for_node.existing_resource.clone(),
                ..Default::default()
            };
            for (r, n) in st.children_of(for_ref, Role::Own) {
                if !n.existing_condition.as_ref().is_some_and(|c| c.is_true()) {
                    debug!(for_ref = %for_ref, own = %r, "own child not ready");
                    ctx.ready = false;
                }
                if let Some(o) = n.existing_resource.as_ref() {
                    ctx.owns.insert(r.clone(), o.clone());
                }
            }
            for (r, n) in st.children_of(for_ref, Role::Watch) {
                let exempt = for_owner.as_ref() == Some(r);
                if !exempt && !n.existing_condition.as_ref().is_some_and(|c| c.is_true()) {
                    debug!(for_ref = %for_ref, watch = %r, "scoped watch not ready");
                    ctx.ready = false;
                }
                if let Some(o) = n.existing_resource.as_ref() {
                    ctx.watches.insert(r.clone(), o.clone());
                }
            }
            out.insert(for_ref.clone(), ctx);
        }
        out
    }
}
