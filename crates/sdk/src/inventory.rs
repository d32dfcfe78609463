//! Inventory: role registry keyed by (apiVersion, kind) plus a two-level tree
//! `for -> own/watch` of the objects and condition records seen in one run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use kptcond_core::{ConditionRecord, DynamicObject, Gvk, Reference};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};

use crate::error::SdkError;
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    For,
    Own,
    Watch,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Role::For => "for", Role::Own => "own", Role::Watch => "watch" };
        f.write_str(s)
    }
}

/// Management policy for an owned child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipKind {
    /// Body is mutated elsewhere; only the condition record is managed here.
    RemoteWithCondition,
    /// Body and condition are both managed here.
    #[default]
    RemoteWithBody,
    /// Body is managed here and its condition is positive as soon as it is written.
    LocalNoCondition,
    /// Created once, positive immediately, never updated or deleted by the engine.
    InitialPlaceholder,
}

impl OwnershipKind {
    /// Kinds whose body the engine may mark for deletion.
    pub fn engine_deletes(self) -> bool { matches!(self, Self::RemoteWithBody | Self::LocalNoCondition) }

    /// Kinds whose condition is positive without external confirmation.
    pub fn positive_on_write(self) -> bool { matches!(self, Self::LocalNoCondition | Self::InitialPlaceholder) }
}

impl std::str::FromStr for OwnershipKind {
    type Err = SdkError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote-with-condition" | "remoteCondition" => Ok(Self::RemoteWithCondition),
            "remote-with-body" | "remote" => Ok(Self::RemoteWithBody),
            "local-no-condition" | "local" => Ok(Self::LocalNoCondition),
            "initial-placeholder" | "initial" => Ok(Self::InitialPlaceholder),
            other => Err(SdkError::InvalidConfiguration(format!("unknown ownership kind: {}", other))),
        }
    }
}

/// How a watched kind is attached to the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchScope {
    /// Depth-1 node; gates global readiness and feeds the watch callback.
    #[default]
    Global,
    /// Attached below every for-object it relates to via owner references.
    ForScoped,
}

/// Classification of a registered (apiVersion, kind), resolved at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleContext {
    For,
    Own(OwnershipKind),
    Watch(WatchScope),
}

impl RoleContext {
    pub fn role(&self) -> Role {
        match self { Self::For => Role::For, Self::Own(_) => Role::Own, Self::Watch(_) => Role::Watch }
    }

    pub fn ownership(&self) -> Option<OwnershipKind> {
        match self { Self::Own(k) => Some(*k), _ => None }
    }
}

/// Per (role, reference) state of one run.
#[derive(Debug, Clone, Default)]
pub struct InventoryNode {
    pub ownership: Option<OwnershipKind>,
    pub existing_condition: Option<ConditionRecord>,
    pub existing_resource: Option<DynamicObject>,
    pub new_resource: Option<DynamicObject>,
    /// A failure was recorded on this node's condition during the current run.
    pub failed: bool,
}

impl InventoryNode {
    pub fn is_touched(&self) -> bool {
        self.existing_condition.is_some() || self.existing_resource.is_some() || self.new_resource.is_some()
    }

    pub fn ownership_kind(&self) -> OwnershipKind { self.ownership.unwrap_or_default() }
}

#[derive(Debug, Clone)]
pub enum InventoryValue {
    Condition(ConditionRecord),
    Resource(DynamicObject),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct NodeKey {
    pub role: Role,
    pub reference: Reference,
}

#[derive(Debug, Default)]
pub(crate) struct Entry {
    pub node: InventoryNode,
    pub children: BTreeMap<NodeKey, InventoryNode>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub roots: BTreeMap<NodeKey, Entry>,
    /// Set when a global watch callback failed this run.
    pub watch_failed: bool,
}

pub(crate) type NodePath = SmallVec<[NodeKey; 2]>;

/// Map `refs` onto a tree path. Depth 1 is for for/watch, depth 2 hangs own/watch below a for.
pub(crate) fn node_path(role: Role, refs: &[Reference]) -> Result<NodePath, SdkError> {
    match refs {
        [] => Err(SdkError::invalid_ref("cannot walk resource tree with empty ref")),
        [r] => {
            if role == Role::Own {
                return Err(SdkError::invalid_ref("refs with len 1 only allowed for for/watch"));
            }
            Ok(smallvec![NodeKey { role, reference: r.clone() }])
        }
        [for_ref, r] => {
            if role == Role::For {
                return Err(SdkError::invalid_ref("refs with len 2 only allowed for own/watch"));
            }
            Ok(smallvec![
                NodeKey { role: Role::For, reference: for_ref.clone() },
                NodeKey { role, reference: r.clone() },
            ])
        }
        _ => Err(SdkError::invalid_ref(format!("refs with len > 2, got {}", refs.len()))),
    }
}

fn validate_refs(refs: &[Reference]) -> Result<(), SdkError> {
    for r in refs {
        r.validate().map_err(|e| SdkError::invalid_ref(e.to_string()))?;
    }
    Ok(())
}

impl State {
    fn node_mut(&mut self, path: &NodePath) -> &mut InventoryNode {
        let entry = self.roots.entry(path[0].clone()).or_default();
        match path.get(1) {
            None => &mut entry.node,
            Some(child) => entry.children.entry(child.clone()).or_default(),
        }
    }

    fn node_opt_mut(&mut self, path: &NodePath) -> Option<&mut InventoryNode> {
        let entry = self.roots.get_mut(&path[0])?;
        match path.get(1) {
            None => Some(&mut entry.node),
            Some(child) => entry.children.get_mut(child),
        }
    }

    pub(crate) fn node(&self, path: &NodePath) -> Option<&InventoryNode> {
        let entry = self.roots.get(&path[0])?;
        match path.get(1) {
            None => Some(&entry.node),
            Some(child) => entry.children.get(child),
        }
    }

    /// Depth-1 nodes of `role`.
    pub(crate) fn roots_of(&self, role: Role) -> impl Iterator<Item = (&Reference, &Entry)> {
        self.roots.iter().filter(move |(k, _)| k.role == role).map(|(k, e)| (&k.reference, e))
    }

    /// Children of `role` below the for-entry `for_ref`.
    pub(crate) fn children_of<'a>(
        &'a self,
        for_ref: &Reference,
        role: Role,
    ) -> Box<dyn Iterator<Item = (&'a Reference, &'a InventoryNode)> + 'a> {
        let key = NodeKey { role: Role::For, reference: for_ref.clone() };
        match self.roots.get(&key) {
            Some(entry) => Box::new(
                entry.children.iter().filter(move |(k, _)| k.role == role).map(|(k, n)| (&k.reference, n)),
            ),
            None => Box::new(std::iter::empty()),
        }
    }
}

/// Thread-safe inventory. Every operation takes the internal lock, which is
/// never held while caller-supplied callbacks run.
#[derive(Debug, Default)]
pub struct Inventory {
    gvks: FxHashMap<Gvk, RoleContext>,
    state: RwLock<State>,
}

impl Inventory {
    pub fn new() -> Self { Self::default() }

    /// Build the role registry from a configuration, rejecting duplicate or malformed registrations.
    pub fn from_config(cfg: &Config) -> Result<Self, SdkError> {
        let mut inv = Self::new();
        if cfg.for_gvk.is_wildcard() {
            return Err(SdkError::InvalidConfiguration("no wildcard refs allowed in for reference".into()));
        }
        inv.register(cfg.for_gvk.clone(), RoleContext::For)?;
        for (gvk, kind) in cfg.owns.iter() {
            if gvk.is_wildcard() && *kind != OwnershipKind::InitialPlaceholder {
                return Err(SdkError::InvalidConfiguration(
                    "only initial-placeholder wildcard refs allowed in own reference".into(),
                ));
            }
            inv.register(gvk.clone(), RoleContext::Own(*kind))?;
        }
        for (gvk, w) in cfg.watch.iter() {
            if gvk.is_wildcard() {
                return Err(SdkError::InvalidConfiguration("no wildcard refs allowed in watch reference".into()));
            }
            inv.register(gvk.clone(), RoleContext::Watch(w.scope))?;
        }
        Ok(inv)
    }

    pub fn register(&mut self, gvk: Gvk, ctx: RoleContext) -> Result<(), SdkError> {
        gvk.validate().map_err(|e| SdkError::InvalidConfiguration(e.to_string()))?;
        if let Some(existing) = self.gvks.get(&gvk) {
            return Err(SdkError::InvalidConfiguration(format!(
                "{} is already registered with role {}",
                gvk,
                existing.role()
            )));
        }
        self.gvks.insert(gvk, ctx);
        Ok(())
    }

    /// Classify a kind; unregistered kinds fall back to a wildcard registration if any.
    pub fn is_gvk_registered(&self, gvk: &Gvk) -> Option<RoleContext> {
        self.gvks.get(gvk).or_else(|| self.gvks.get(&Gvk::wildcard())).copied()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `value` at `refs` (`[forRef]` or `[forRef, childRef]`), creating nodes as needed.
    /// Resources go to `new_resource` when `is_new`, else to `existing_resource`.
    pub fn set(&self, ctx: RoleContext, refs: &[Reference], value: InventoryValue, is_new: bool) -> Result<(), SdkError> {
        let path = node_path(ctx.role(), refs)?;
        validate_refs(refs)?;
        let mut st = self.write();
        let node = st.node_mut(&path);
        if let Some(kind) = ctx.ownership() {
            node.ownership = Some(kind);
        }
        match value {
            InventoryValue::Condition(c) => {
                trace!(refs = ?refs, "set existing condition");
                node.existing_condition = Some(c);
            }
            InventoryValue::Resource(o) if is_new => {
                trace!(refs = ?refs, "set new resource");
                node.new_resource = Some(o);
            }
            InventoryValue::Resource(o) => {
                trace!(refs = ?refs, "set existing resource");
                node.existing_resource = Some(o);
            }
        }
        Ok(())
    }

    /// Clear the condition at `refs`; absent nodes are a no-op.
    pub fn delete(&self, role: Role, refs: &[Reference]) -> Result<(), SdkError> {
        let path = node_path(role, refs)?;
        if let Some(node) = self.write().node_opt_mut(&path) {
            node.existing_condition = None;
        }
        Ok(())
    }

    /// Clear the existing resource at `refs`; absent nodes are a no-op.
    pub fn delete_resource(&self, role: Role, refs: &[Reference]) -> Result<(), SdkError> {
        let path = node_path(role, refs)?;
        if let Some(node) = self.write().node_opt_mut(&path) {
            node.existing_resource = None;
        }
        Ok(())
    }

    pub fn mark_failed(&self, role: Role, refs: &[Reference]) -> Result<(), SdkError> {
        let path = node_path(role, refs)?;
        self.write().node_mut(&path).failed = true;
        Ok(())
    }

    /// Snapshot of the nodes of `role`: depth-1 nodes, or the children of `scope` when given.
    pub fn get(&self, role: Role, scope: Option<&Reference>) -> BTreeMap<Reference, InventoryNode> {
        let st = self.read();
        match scope {
            None => st.roots_of(role).map(|(r, e)| (r.clone(), e.node.clone())).collect(),
            Some(for_ref) => st.children_of(for_ref, role).map(|(r, n)| (r.clone(), n.clone())).collect(),
        }
    }

    pub fn get_node(&self, role: Role, refs: &[Reference]) -> Option<InventoryNode> {
        let path = node_path(role, refs).ok()?;
        self.read().node(&path).cloned()
    }

    pub(crate) fn set_watch_failed(&self) { self.write().watch_failed = true; }

    /// Flat listing of every path in the tree, parents first.
    pub fn list(&self) -> Vec<Vec<(Role, Reference)>> {
        let st = self.read();
        let mut out = Vec::new();
        for (k, e) in st.roots.iter() {
            out.push(vec![(k.role, k.reference.clone())]);
            for ck in e.children.keys() {
                out.push(vec![(k.role, k.reference.clone()), (ck.role, ck.reference.clone())]);
            }
        }
        debug!(entries = out.len(), "inventory listed");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kptcond_core::object::new_object;
    use kptcond_core::ConditionStatus;

    fn r(av: &str, k: &str, n: &str) -> Reference { Reference::new(av, k, n) }

    #[test]
    fn duplicate_registration_is_a_configuration_error() {
        let mut inv = Inventory::new();
        inv.register(Gvk::new("a", "a"), RoleContext::For).unwrap();
        let err = inv.register(Gvk::new("a", "a"), RoleContext::Own(OwnershipKind::RemoteWithBody)).unwrap_err();
        assert!(matches!(err, SdkError::InvalidConfiguration(_)));
        assert!(inv.register(Gvk::new("", "a"), RoleContext::For).is_err());
    }

    #[test]
    fn wildcard_registration_is_a_fallback() {
        let mut inv = Inventory::new();
        inv.register(Gvk::new("a", "a"), RoleContext::For).unwrap();
        assert_eq!(inv.is_gvk_registered(&Gvk::new("b", "b")), None);
        inv.register(Gvk::wildcard(), RoleContext::Own(OwnershipKind::InitialPlaceholder)).unwrap();
        assert_eq!(inv.is_gvk_registered(&Gvk::new("a", "a")), Some(RoleContext::For));
        assert_eq!(
            inv.is_gvk_registered(&Gvk::new("b", "b")),
            Some(RoleContext::Own(OwnershipKind::InitialPlaceholder))
        );
    }

    #[test]
    fn set_rejects_malformed_refs() {
        let inv = Inventory::new();
        let obj = InventoryValue::Resource(new_object("a", "a", "a"));
        let cases: Vec<(RoleContext, Vec<Reference>)> = vec![
            (RoleContext::For, vec![]),
            (RoleContext::For, vec![r("a", "a", "")]),
            (RoleContext::For, vec![r("a", "a", "a"), r("b", "b", "b")]),
            (RoleContext::Own(OwnershipKind::RemoteWithBody), vec![r("a", "a", "a")]),
            (RoleContext::Watch(WatchScope::Global), vec![r("a", "a", "a"), r("b", "b", "b"), r("c", "c", "c")]),
            (RoleContext::Own(OwnershipKind::RemoteWithBody), vec![r("a", "a", "a"), r("", "b", "b")]),
        ];
        for (ctx, refs) in cases {
            let err = inv.set(ctx, &refs, obj.clone(), false).unwrap_err();
            assert!(matches!(err, SdkError::InvalidReference(_)), "refs={:?}", refs);
        }
        assert!(inv.list().is_empty());
    }

    #[test]
    fn set_and_get_two_level_tree() {
        let inv = Inventory::new();
        let x = r("a", "a", "x");
        let c = r("b", "b", "c");
        inv.set(RoleContext::For, &[x.clone()], InventoryValue::Resource(new_object("a", "a", "x")), false).unwrap();
        inv.set(
            RoleContext::Own(OwnershipKind::LocalNoCondition),
            &[x.clone(), c.clone()],
            InventoryValue::Resource(new_object("b", "b", "c")),
            true,
        )
        .unwrap();
        let cond = ConditionRecord::for_refs(&[x.clone(), c.clone()], ConditionStatus::True, "ok").unwrap();
        inv.set(RoleContext::Own(OwnershipKind::LocalNoCondition), &[x.clone(), c.clone()], InventoryValue::Condition(cond), false)
            .unwrap();

        let fors = inv.get(Role::For, None);
        assert_eq!(fors.len(), 1);
        assert!(fors[&x].existing_resource.is_some());

        let owns = inv.get(Role::Own, Some(&x));
        let node = &owns[&c];
        assert!(node.existing_resource.is_none());
        assert!(node.new_resource.is_some());
        assert!(node.existing_condition.as_ref().map(|c| c.is_true()).unwrap_or(false));
        assert_eq!(node.ownership, Some(OwnershipKind::LocalNoCondition));
        assert!(inv.get(Role::Watch, Some(&x)).is_empty());
        assert!(inv.get(Role::Own, Some(&c)).is_empty());
        assert_eq!(inv.list().len(), 2);
    }

    #[test]
    fn delete_clears_condition_and_is_noop_when_absent() {
        let inv = Inventory::new();
        let x = r("a", "a", "x");
        let cond = ConditionRecord::for_refs(&[x.clone()], ConditionStatus::False, "").unwrap();
        inv.set(RoleContext::For, &[x.clone()], InventoryValue::Condition(cond), false).unwrap();
        inv.delete(Role::For, &[x.clone()]).unwrap();
        let node = inv.get_node(Role::For, &[x.clone()]).unwrap();
        assert!(node.existing_condition.is_none());
        assert!(!node.is_touched());
        inv.delete(Role::Own, &[x.clone(), r("b", "b", "missing")]).unwrap();
        assert!(inv.delete(Role::Own, &[]).is_err());
    }

    #[test]
    fn get_returns_snapshots() {
        let inv = Inventory::new();
        let x = r("a", "a", "x");
        inv.set(RoleContext::For, &[x.clone()], InventoryValue::Resource(new_object("a", "a", "x")), false).unwrap();
        let mut snap = inv.get(Role::For, None);
        snap.get_mut(&x).unwrap().existing_resource = None;
        assert!(inv.get(Role::For, None)[&x].existing_resource.is_some());
    }

    #[test]
    fn ownership_kind_parses_both_spellings() {
        assert_eq!("remote".parse::<OwnershipKind>().unwrap(), OwnershipKind::RemoteWithBody);
        assert_eq!("initial-placeholder".parse::<OwnershipKind>().unwrap(), OwnershipKind::InitialPlaceholder);
        assert!("bogus".parse::<OwnershipKind>().is_err());
    }
}
