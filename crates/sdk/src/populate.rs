//! Inventory population from the package, global watch callbacks and debug listings.

use std::collections::BTreeMap;

use kptcond_core::{ConditionRecord, KubeObjectExt, Reference};
use tracing::{info, trace, warn};

use crate::error::{join_errors, SdkError};
use crate::inventory::{InventoryValue, Role, RoleContext, WatchScope};
use crate::Run;

/// One condition record or package item waiting to be placed in the tree.
struct Candidate {
    reference: Reference,
    owner: Option<Reference>,
    value: InventoryValue,
}

impl Run<'_> {
    /// Place every relevant condition record and item into the inventory.
    /// Conditions go first so a for-object's owner is known before watches attach.
    pub(crate) fn populate_inventory(&mut self) {
        let mut candidates: Vec<Candidate> = Vec::new();
        for c in self.pkg.conditions() {
            if let Some(rec) = ConditionRecord::from_wire(&c) {
                candidates.push(Candidate {
                    reference: rec.reference.clone(),
                    owner: rec.owner.clone(),
                    value: InventoryValue::Condition(rec),
                });
            }
        }
        for o in self.pkg.items.iter() {
            candidates.push(Candidate { reference: o.reference(), owner: o.owner(), value: InventoryValue::Resource(o.clone()) });
        }

        // for-object -> the object that owns it, if it declares one
        let mut for_owners: BTreeMap<Reference, Option<Reference>> = BTreeMap::new();
        for cand in candidates.iter() {
            if self.inv.is_gvk_registered(&cand.reference.gvk()) == Some(RoleContext::For) {
                let slot = for_owners.entry(cand.reference.clone()).or_default();
                if slot.is_none() {
                    *slot = cand.owner.clone();
                }
            }
        }
        trace!(for_objects = for_owners.len(), "for-objects discovered");

        for cand in candidates {
            if let Err(e) = self.place(&for_owners, cand) {
                warn!(error = %e, "cannot populate inventory entry");
                self.pkg.warning(format!("cannot populate inventory: {}", e), None);
            }
        }
    }

    fn place(&self, for_owners: &BTreeMap<Reference, Option<Reference>>, cand: Candidate) -> Result<(), SdkError> {
        let Some(ctx) = self.inv.is_gvk_registered(&cand.reference.gvk()) else {
            return Ok(());
        };
        match ctx {
            RoleContext::For => self.inv.set(ctx, &[cand.reference], cand.value, false),
            RoleContext::Own(_) => {
                // owned by some other kind (or nobody): not ours
                let Some(owner) = cand.owner.filter(|o| o.gvk() == self.cfg.for_gvk) else {
                    trace!(reference = %cand.reference, "own kind with foreign owner skipped");
                    return Ok(());
                };
                self.inv.set(ctx, &[owner, cand.reference], cand.value, false)
            }
            RoleContext::Watch(WatchScope::Global) => self.inv.set(ctx, &[cand.reference], cand.value, false),
            RoleContext::Watch(WatchScope::ForScoped) => {
                for (for_ref, for_owner) in for_owners.iter() {
                    let related = cand.owner.as_ref() == Some(for_ref)
                        || (for_owner.is_some() && cand.owner.as_ref() == for_owner.as_ref())
                        || for_owner.as_ref() == Some(&cand.reference);
                    if related {
                        self.inv.set(ctx, &[for_ref.clone(), cand.reference.clone()], cand.value.clone(), false)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Run the callback of every global watch that has a body. Any failure makes
    /// the inventory not ready; the joined messages are returned.
    pub(crate) fn call_global_watches(&mut self) -> Result<(), String> {
        let cfg = self.cfg;
        let mut errs = Vec::new();
        for (r, node) in self.inv.get(Role::Watch, None) {
            let Some(obj) = node.existing_resource.as_ref() else { continue };
            let Some(cb) = cfg.watch.get(&r.gvk()).and_then(|w| w.callback.as_ref()) else { continue };
            trace!(watch = %r, "run watch callback");
            if let Err(e) = cb(&self.ctx(None), obj) {
                let err = self.callback_failed("watch", &r, &e);
                warn!(watch = %r, error = %err, "watch callback failed, not ready");
                self.pkg.error(err.to_string(), Some(r.clone()));
                errs.push(err);
            }
        }
        match join_errors(&errs) {
            None => Ok(()),
            Some(msg) => {
                self.inv.set_watch_failed();
                Err(msg)
            }
        }
    }

    pub(crate) fn list_inventory(&self, stage: &str) {
        for path in self.inv.list() {
            let rendered: Vec<String> = path.iter().map(|(role, r)| format!("{}:{}", role, r)).collect();
            let node = path.last().and_then(|(role, _)| {
                let refs: Vec<Reference> = path.iter().map(|(_, r)| r.clone()).collect();
                self.inv.get_node(*role, &refs)
            });
            info!(
                stage,
                path = %rendered.join(" -> "),
                condition = node.as_ref().is_some_and(|n| n.existing_condition.is_some()),
                existing = node.as_ref().is_some_and(|n| n.existing_resource.is_some()),
                new = node.as_ref().is_some_and(|n| n.new_resource.is_some()),
                failed = node.as_ref().is_some_and(|n| n.failed),
                "inventory entry"
            );
        }
    }
}
