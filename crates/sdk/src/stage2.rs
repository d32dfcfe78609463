//! Stage 2: hand ready for-objects and their children to the update function.

use kptcond_core::{condition_type, ConditionStatus, DynamicObject, KubeObjectExt, Reference, OWNER_ANNOTATION};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::SdkError;
use crate::inventory::RoleContext;
use crate::{Run, UpdateFn};

impl Run<'_> {
    pub(crate) fn update_resources(&mut self) {
        let cfg = self.cfg;
        let ready_map = self.inv.get_ready_map();
        if !self.report.ready {
            // nothing observable can be produced without owns
            if cfg.owns.is_empty() {
                for (for_ref, rc) in ready_map.iter() {
                    if let Some(obj) = rc.for_obj.as_ref() {
                        self.remove_or_report(for_ref, obj);
                    }
                }
            }
            return;
        }
        let Some(update) = cfg.update_fn.as_ref() else { return };
        if ready_map.is_empty() {
            self.generate_for_package(update);
            return;
        }
        for (for_ref, rc) in ready_map.iter() {
            if rc.failed {
                debug!(for_ref = %for_ref, "for-object failed this run, not finalized");
                continue;
            }
            if !rc.ready {
                debug!(for_ref = %for_ref, "for-object not ready");
                if let Some(obj) = rc.for_obj.as_ref() {
                    if cfg.owns.is_empty() {
                        self.remove_or_report(for_ref, obj);
                    }
                }
                continue;
            }
            if rc.for_obj.is_none() {
                debug!(for_ref = %for_ref, "generating for-object from its condition");
            }
            let children = rc.children();
            match update(&self.ctx(Some(for_ref)), rc.for_obj.as_ref(), &children) {
                Ok(obj) => {
                    if let Err(e) = self.commit(for_ref, obj) {
                        self.fail_scope(for_ref, &format!("stage2: {}", e));
                    }
                }
                Err(e) => {
                    let err = self.callback_failed("update", for_ref, &e);
                    self.fail_scope(for_ref, &err.to_string());
                }
            }
        }
    }

    /// No for-object is known at all: ask the update function for one named
    /// after the package. A failure is reported without writing a condition.
    fn generate_for_package(&mut self, update: &UpdateFn) {
        let Some(name) = self.pkg.kptfile().map(|k| k.reference().name) else { return };
        let for_ref = self.cfg.for_gvk.with_name(name);
        info!(for_ref = %for_ref, "no for-object in the package, generating one");
        let generated = update(&self.ctx(Some(&for_ref)), None, &[]);
        let result = generated
            .map_err(|e| self.callback_failed("update", &for_ref, &e))
            .and_then(|obj| self.commit(&for_ref, obj));
        if let Err(e) = result {
            warn!(for_ref = %for_ref, error = %e, "cannot generate for-object");
            self.pkg.error(e.to_string(), Some(for_ref));
        }
    }

    /// Write the updated for-object and flip its condition to True. Without owns
    /// an object that names no owner is stamped as its own.
    fn commit(&mut self, for_ref: &Reference, mut obj: DynamicObject) -> Result<(), SdkError> {
        if obj.reference() != *for_ref {
            return Err(SdkError::invalid_ref(format!(
                "update function returned {} for {}",
                obj.reference(),
                for_ref
            )));
        }
        if self.cfg.owns.is_empty() && obj.owner().is_none() {
            obj.set_annotation(OWNER_ANNOTATION, &condition_type(for_ref));
        }
        let scope = std::slice::from_ref(for_ref);
        self.set_object(RoleContext::For, scope, obj)?;
        self.set_condition(RoleContext::For, scope, ConditionStatus::True, "update done")?;
        counter!("kptcond_finalized_total", 1u64);
        info!(for_ref = %for_ref, "for-object updated");
        self.report.finalized.push(for_ref.clone());
        Ok(())
    }

    fn remove_or_report(&mut self, for_ref: &Reference, obj: &DynamicObject) {
        if let Err(e) = self.remove_for_object(for_ref, obj) {
            self.pkg.error(e.to_string(), Some(for_ref.clone()));
        }
    }
}
