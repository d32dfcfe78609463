//! Helpers over `DynamicObject` for the handful of fields the engine reads.

use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use serde_json::Value as Json;

use crate::{parse_condition_type, CoreError, Gvk, Reference, DELETE_ANNOTATION, OWNER_ANNOTATION};

/// Build an empty object with the given identity.
pub fn new_object(api_version: &str, kind: &str, name: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() }),
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        data: Json::Object(serde_json::Map::new()),
    }
}

/// Parse a raw JSON document into an object, requiring apiVersion and kind.
pub fn from_value(v: Json) -> Result<DynamicObject, CoreError> {
    let obj: DynamicObject = serde_json::from_value(v)?;
    if obj.types.is_none() {
        return Err(CoreError::MissingField("apiVersion/kind".into()));
    }
    Ok(obj)
}

pub trait KubeObjectExt {
    fn api_version(&self) -> &str;
    fn kind(&self) -> &str;
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn reference(&self) -> Reference;
    fn gvk(&self) -> Gvk;
    fn annotation(&self, key: &str) -> Option<&str>;
    fn set_annotation(&mut self, key: &str, value: &str);
    fn remove_annotation(&mut self, key: &str);
    /// For-Reference decoded from the owner annotation.
    fn owner(&self) -> Option<Reference>;
    fn is_marked_for_deletion(&self) -> bool;
    fn spec(&self) -> Option<&Json>;
    /// Same apiVersion, kind, name and namespace.
    fn same_identity(&self, other: &DynamicObject) -> bool;
}

impl KubeObjectExt for DynamicObject {
    fn api_version(&self) -> &str {
        self.types.as_ref().map(|t| t.api_version.as_str()).unwrap_or("")
    }

    fn kind(&self) -> &str {
        self.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
    }

    fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }

    fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("") }

    fn reference(&self) -> Reference { Reference::new(self.api_version(), self.kind(), self.name()) }

    fn gvk(&self) -> Gvk { Gvk::new(self.api_version(), self.kind()) }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(|s| s.as_str())
    }

    fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata.annotations.get_or_insert_with(Default::default).insert(key.to_string(), value.to_string());
    }

    fn remove_annotation(&mut self, key: &str) {
        if let Some(a) = self.metadata.annotations.as_mut() {
            a.remove(key);
            if a.is_empty() { self.metadata.annotations = None; }
        }
    }

    fn owner(&self) -> Option<Reference> { self.annotation(OWNER_ANNOTATION).and_then(parse_condition_type) }

    fn is_marked_for_deletion(&self) -> bool { self.annotation(DELETE_ANNOTATION).is_some() }

    fn spec(&self) -> Option<&Json> { self.data.get("spec") }

    fn same_identity(&self, other: &DynamicObject) -> bool {
        self.api_version() == other.api_version()
            && self.kind() == other.kind()
            && self.name() == other.name()
            && self.namespace() == other.namespace()
    }
}
