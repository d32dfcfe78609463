//! In-memory package: the ordered item list of a kpt `ResourceList` plus its results.

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kptfile::{self, ReadinessGate};
use crate::{Condition, CoreError, KubeObjectExt, Reference};

pub const RESOURCE_LIST_API_VERSION: &str = "config.kubernetes.io/v1";
pub const RESOURCE_LIST_KIND: &str = "ResourceList";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One entry of the caller-visible results list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<Reference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub items: Vec<DynamicObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ResultItem>,
}

fn default_api_version() -> String { RESOURCE_LIST_API_VERSION.to_string() }
fn default_kind() -> String { RESOURCE_LIST_KIND.to_string() }

impl Default for Package {
    fn default() -> Self { Self::new(Vec::new()) }
}

impl Package {
    pub fn new(items: Vec<DynamicObject>) -> Self {
        Self { api_version: default_api_version(), kind: default_kind(), items, results: Vec::new() }
    }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    fn kptfile_index(&self) -> Option<usize> { self.items.iter().position(kptfile::is_root_kptfile) }

    pub fn has_kptfile(&self) -> bool { self.kptfile_index().is_some() }

    pub fn kptfile(&self) -> Option<&DynamicObject> { self.kptfile_index().map(|i| &self.items[i]) }

    fn kptfile_mut(&mut self) -> Result<&mut DynamicObject, CoreError> {
        let idx = self.kptfile_index().ok_or_else(|| CoreError::MissingField("Kptfile".into()))?;
        Ok(&mut self.items[idx])
    }

    pub fn find(&self, r: &Reference) -> Option<&DynamicObject> {
        self.items.iter().find(|o| o.reference() == *r)
    }

    /// Replace the item with the same identity or append it.
    pub fn upsert(&mut self, obj: DynamicObject) {
        match self.items.iter_mut().find(|o| o.same_identity(&obj)) {
            Some(existing) => *existing = obj,
            None => {
                debug!(obj = %obj.reference(), "appending new item");
                self.items.push(obj);
            }
        }
    }

    /// Remove every item with the identity of `obj`; returns how many were dropped.
    pub fn remove(&mut self, obj: &DynamicObject) -> usize {
        let before = self.items.len();
        self.items.retain(|o| !o.same_identity(obj));
        before - self.items.len()
    }

    pub fn conditions(&self) -> Vec<Condition> { self.kptfile().map(kptfile::conditions).unwrap_or_default() }

    pub fn condition(&self, ct: &str) -> Option<Condition> {
        self.conditions().into_iter().find(|c| c.type_ == ct)
    }

    pub fn set_conditions(&mut self, cs: &[Condition]) -> Result<(), CoreError> {
        kptfile::set_conditions(self.kptfile_mut()?, cs)
    }

    pub fn delete_condition(&mut self, ct: &str) -> Result<(), CoreError> {
        kptfile::delete_condition(self.kptfile_mut()?, ct)
    }

    pub fn set_condition_failed(&mut self, r: &Reference, msg: &str) -> Result<(), CoreError> {
        kptfile::set_failed(self.kptfile_mut()?, r, msg)
    }

    pub fn readiness_gates(&self) -> Vec<ReadinessGate> {
        self.kptfile().map(kptfile::readiness_gates).unwrap_or_default()
    }

    pub fn set_readiness_gates(&mut self, cts: &[&str]) -> Result<(), CoreError> {
        kptfile::set_readiness_gates(self.kptfile_mut()?, cts)
    }

    pub fn is_ready(&self, prefix: &str) -> bool {
        self.kptfile().map(|k| kptfile::is_ready(k, prefix)).unwrap_or(false)
    }

    pub fn info(&mut self, msg: impl Into<String>) { self.push_result(Severity::Info, msg.into(), None); }

    pub fn warning(&mut self, msg: impl Into<String>, r: Option<Reference>) {
        self.push_result(Severity::Warning, msg.into(), r);
    }

    pub fn error(&mut self, msg: impl Into<String>, r: Option<Reference>) {
        self.push_result(Severity::Error, msg.into(), r);
    }

    fn push_result(&mut self, severity: Severity, message: String, resource_ref: Option<Reference>) {
        self.results.push(ResultItem { message, severity, resource_ref });
    }

    pub fn has_errors(&self) -> bool { self.results.iter().any(|r| r.severity == Severity::Error) }
}
