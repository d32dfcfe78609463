//! kptcond sdk: condition-driven reconciliation of a kpt package around one For kind.
//!
//! A run builds an [`Inventory`] from the package, lets the caller populate the
//! desired children of every for-object, diffs existing against desired state
//! (bodies and condition records), applies the diff (stage 1), and once every
//! child reports a positive condition hands the for-object and its children to
//! the caller's update function (stage 2).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use kptcond_core::{DynamicObject, Gvk, KubeObjectExt, Package, Reference, DEBUG_ANNOTATION};
use metrics::{counter, histogram};
use tracing::{error, info};

mod condition;
pub mod diff;
pub mod error;
pub mod inventory;
mod populate;
pub mod ready;
mod stage1;
mod stage2;
mod updates;

pub use condition::specialize_condition_type;
pub use diff::{DiffObject, InventoryDiff};
pub use error::SdkError;
pub use inventory::{Inventory, InventoryNode, InventoryValue, OwnershipKind, Role, RoleContext, WatchScope};
pub use ready::ReadyCtx;

/// Read-only view handed to every caller-supplied callback.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    /// Package items as they are at the time of the call.
    pub items: &'a [DynamicObject],
    /// The for-object the call is scoped to; `None` for global watches.
    pub for_ref: Option<&'a Reference>,
}

/// Desired children of a for-object, computed as if nothing existed.
pub type PopulateFn = Box<dyn Fn(&ReconcileContext<'_>, &DynamicObject) -> anyhow::Result<Vec<DynamicObject>> + Send + Sync>;
/// Produce the updated for-object from its ready children (owns first, then watches).
/// The for-object is `None` when it is only known through its condition, or when
/// the package has none and one named after the Kptfile is to be generated.
pub type UpdateFn = Box<
    dyn Fn(&ReconcileContext<'_>, Option<&DynamicObject>, &[DynamicObject]) -> anyhow::Result<DynamicObject> + Send + Sync,
>;
/// Inspect a global watch object; an error makes the whole run not ready.
pub type WatchCallbackFn = Box<dyn Fn(&ReconcileContext<'_>, &DynamicObject) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct Watch {
    pub scope: WatchScope,
    pub callback: Option<WatchCallbackFn>,
}

impl Watch {
    pub fn global() -> Self { Self { scope: WatchScope::Global, callback: None } }

    pub fn scoped() -> Self { Self { scope: WatchScope::ForScoped, callback: None } }

    pub fn with_callback(
        mut self,
        f: impl Fn(&ReconcileContext<'_>, &DynamicObject) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch").field("scope", &self.scope).field("callback", &self.callback.is_some()).finish()
    }
}

/// Engine configuration; validated once by [`Engine::new`].
pub struct Config {
    /// Own the package-level specialization condition and readiness gate.
    pub root: bool,
    pub for_gvk: Gvk,
    pub owns: BTreeMap<Gvk, OwnershipKind>,
    pub watch: BTreeMap<Gvk, Watch>,
    pub populate_fn: Option<PopulateFn>,
    pub update_fn: Option<UpdateFn>,
}

impl Config {
    pub fn new(for_gvk: Gvk) -> Self {
        Self { root: false, for_gvk, owns: BTreeMap::new(), watch: BTreeMap::new(), populate_fn: None, update_fn: None }
    }

    pub fn root(mut self, root: bool) -> Self {
        self.root = root;
        self
    }

    pub fn owns(mut self, gvk: Gvk, kind: OwnershipKind) -> Self {
        self.owns.insert(gvk, kind);
        self
    }

    pub fn watch(mut self, gvk: Gvk, w: Watch) -> Self {
        self.watch.insert(gvk, w);
        self
    }

    pub fn populate(
        mut self,
        f: impl Fn(&ReconcileContext<'_>, &DynamicObject) -> anyhow::Result<Vec<DynamicObject>> + Send + Sync + 'static,
    ) -> Self {
        self.populate_fn = Some(Box::new(f));
        self
    }

    pub fn update(
        mut self,
        f: impl Fn(&ReconcileContext<'_>, Option<&DynamicObject>, &[DynamicObject]) -> anyhow::Result<DynamicObject>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.update_fn = Some(Box::new(f));
        self
    }

    fn validate(&self) -> Result<(), SdkError> {
        if self.update_fn.is_none() {
            return Err(SdkError::InvalidConfiguration("update function is required".into()));
        }
        if !self.owns.is_empty() && self.populate_fn.is_none() {
            return Err(SdkError::InvalidConfiguration("populate function is required when owns are configured".into()));
        }
        // role registry checks: duplicates and wildcards
        Inventory::from_config(self).map(|_| ())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("root", &self.root)
            .field("for_gvk", &self.for_gvk)
            .field("owns", &self.owns)
            .field("watch", &self.watch)
            .field("populate_fn", &self.populate_fn.is_some())
            .field("update_fn", &self.update_fn.is_some())
            .finish()
    }
}

/// What a run computed; the package itself carries the durable outcome.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Global readiness (no global watch failed or pending).
    pub ready: bool,
    pub diffs: BTreeMap<Reference, InventoryDiff>,
    /// For-objects committed by the update function.
    pub finalized: Vec<Reference>,
    /// For-objects removed from the package because they produced nothing yet.
    pub removed: Vec<Reference>,
}

impl RunReport {
    /// Total number of create/update/delete actions over every for-object.
    pub fn actions(&self) -> usize { self.diffs.values().map(InventoryDiff::actions).sum() }
}

#[derive(Debug)]
pub struct Engine {
    cfg: Config,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, SdkError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &Config { &self.cfg }

    /// Reconcile `pkg` in place. Per-for-object failures land in conditions and
    /// results; only a missing Kptfile aborts the run.
    pub fn run(&self, pkg: &mut Package) -> Result<RunReport, SdkError> {
        let started = Instant::now();
        counter!("kptcond_runs_total", 1u64);
        if pkg.is_empty() {
            info!(for_gvk = %self.cfg.for_gvk, "no resources present in the resource list");
            pkg.info("no resources present in the resource list");
            return Ok(RunReport { ready: true, ..Default::default() });
        }
        if !pkg.has_kptfile() {
            let err = SdkError::MissingKptfile;
            error!(for_gvk = %self.cfg.for_gvk, "{}", err);
            pkg.error(err.to_string(), None);
            return Err(err);
        }

        let inv = Inventory::from_config(&self.cfg)?;
        let mut run =
            Run { cfg: &self.cfg, inv, pkg, debug: false, populate_errs: BTreeMap::new(), report: RunReport::default() };
        run.execute()?;

        let report = run.report;
        histogram!("kptcond_run_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            for_gvk = %self.cfg.for_gvk,
            ready = report.ready,
            actions = report.actions(),
            finalized = report.finalized.len(),
            took_ms = %started.elapsed().as_millis(),
            "reconcile run complete"
        );
        Ok(report)
    }
}

/// State of one run: the configuration, a fresh inventory and the package being mutated.
pub(crate) struct Run<'a> {
    pub cfg: &'a Config,
    pub inv: Inventory,
    pub pkg: &'a mut Package,
    pub debug: bool,
    /// Rejected populated children per for-object, reported once its diff is applied.
    pub populate_errs: BTreeMap<Reference, Vec<SdkError>>,
    pub report: RunReport,
}

impl Run<'_> {
    fn execute(&mut self) -> Result<(), SdkError> {
        if self.cfg.root {
            if let Err(e) = self.ensure_specialize_gate() {
                let msg = format!("cannot ensure specialize conditions and readiness gates: {}", e);
                error!("{}", msg);
                self.pkg.error(msg, None);
                return Err(e);
            }
        }
        self.set_debug();
        self.populate_inventory();
        if self.debug {
            self.list_inventory("inventory populated");
        }
        if let Err(msg) = self.call_global_watches() {
            if self.cfg.root {
                self.set_specialize_failed(&msg);
            } else {
                self.fail_for_conditions(&msg);
            }
        }
        self.report.ready = self.inv.is_ready();
        if self.report.ready && !self.cfg.owns.is_empty() {
            self.populate_children();
        }
        if self.debug {
            self.list_inventory("children populated");
        }
        self.update_children();
        self.update_resources();
        if self.cfg.root && self.report.ready {
            self.set_root_readiness();
        }
        Ok(())
    }

    /// Any for-object carrying the debug annotation turns on inventory listings.
    fn set_debug(&mut self) {
        let for_gvk = &self.cfg.for_gvk;
        self.debug = self
            .pkg
            .items
            .iter()
            .any(|o| o.gvk() == *for_gvk && o.annotation(DEBUG_ANNOTATION).is_some_and(|v| !v.is_empty()));
    }

    pub(crate) fn ctx<'b>(&'b self, for_ref: Option<&'b Reference>) -> ReconcileContext<'b> {
        ReconcileContext { items: &self.pkg.items, for_ref }
    }
}

pub mod prelude {
    pub use super::{
        Config, Engine, InventoryDiff, OwnershipKind, ReconcileContext, RunReport, SdkError, Watch, WatchScope,
    };
    pub use kptcond_core::prelude::*;
}
