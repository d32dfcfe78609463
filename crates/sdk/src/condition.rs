//! Package-level specialization condition (root mode) and for-condition failures.

use kptcond_core::{condition_type, reason, Condition, ConditionStatus, KubeObjectExt, Reference};
use tracing::{debug, warn};

use crate::error::SdkError;
use crate::inventory::{Role, RoleContext};
use crate::Run;

/// `nephio.org.Specializer.specialize`
pub fn specialize_condition_type() -> String {
    condition_type(&Reference::new("nephio.org", "Specializer", "specialize"))
}

fn specialize(status: ConditionStatus, reason: &str, msg: &str) -> Condition {
    Condition { type_: specialize_condition_type(), status, reason: reason.to_string(), message: msg.to_string() }
}

impl Run<'_> {
    /// Readiness gate plus an initial condition, left alone once present.
    pub(crate) fn ensure_specialize_gate(&mut self) -> Result<(), SdkError> {
        let ct = specialize_condition_type();
        self.pkg.set_readiness_gates(&[ct.as_str()])?;
        if self.pkg.condition(&ct).is_none() {
            self.pkg.set_conditions(&[specialize(ConditionStatus::False, reason::SPECIALIZE, "initialized")])?;
        }
        Ok(())
    }

    pub(crate) fn set_specialize_failed(&mut self, msg: &str) {
        if let Err(e) = self.pkg.set_conditions(&[specialize(ConditionStatus::False, reason::FAILED, msg)]) {
            warn!(error = %e, "cannot set specialize condition");
            self.pkg.error(e.to_string(), None);
        }
    }

    /// Ready once every condition carrying the For kind's prefix is True.
    pub(crate) fn set_root_readiness(&mut self) {
        let prefix = format!("{}.", condition_type(&self.cfg.for_gvk.with_name("")));
        let c = if self.pkg.is_ready(&prefix) {
            specialize(ConditionStatus::True, reason::READY, "")
        } else {
            specialize(ConditionStatus::False, reason::SPECIALIZE, "not ready")
        };
        debug!(prefix = %prefix, status = %c.status, "root readiness");
        if let Err(e) = self.pkg.set_conditions(&[c]) {
            warn!(error = %e, "cannot set specialize condition");
            self.pkg.error(e.to_string(), None);
        }
    }

    /// Flip the condition of every for-object in the package to failed.
    pub(crate) fn fail_for_conditions(&mut self, msg: &str) {
        let for_gvk = &self.cfg.for_gvk;
        let refs: Vec<Reference> =
            self.pkg.items.iter().filter(|o| o.gvk() == *for_gvk).map(|o| o.reference()).collect();
        for r in refs {
            let scope = std::slice::from_ref(&r);
            if let Err(e) = self.set_condition(RoleContext::For, scope, ConditionStatus::False, msg) {
                warn!(for_ref = %r, error = %e, "cannot set for-condition failed");
                self.pkg.error(e.to_string(), Some(r.clone()));
            }
            if let Err(e) = self.inv.mark_failed(Role::For, scope) {
                self.pkg.error(e.to_string(), Some(r.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialize_type_has_no_version_separator() {
        assert_eq!(specialize_condition_type(), "nephio.org.Specializer.specialize");
    }
}
