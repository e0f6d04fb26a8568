//! NR-030: Resource registry mapping kind tags to constructors.
//!
//! Built explicitly from an enumerated list; nothing registers itself.

use crate::error::ConstructionError;
use crate::resources::{
    Deb, File, KubeadmInit, KubeadmJoin, Resource, ResourceKind, Rpm, RunCommand, Service,
};
use indexmap::IndexMap;

/// Deserializes a manifest field map into one resource variant.
pub type Constructor = fn(serde_yaml_ng::Value) -> Result<Resource, ConstructionError>;

/// Table of known resource kinds.
#[derive(Debug, Clone)]
pub struct Registry {
    constructors: IndexMap<&'static str, Constructor>,
}

impl Registry {
    /// Empty registry. Use [`Registry::builtin`] unless testing.
    pub fn new() -> Self {
        Self {
            constructors: IndexMap::new(),
        }
    }

    /// Registry holding every built-in kind.
    pub fn builtin() -> Self {
        let entries: [(ResourceKind, Constructor); 7] = [
            (ResourceKind::Rpm, |f| Rpm::from_fields(f).map(Resource::Rpm)),
            (ResourceKind::Deb, |f| Deb::from_fields(f).map(Resource::Deb)),
            (ResourceKind::File, |f| {
                File::from_fields(f).map(Resource::File)
            }),
            (ResourceKind::Command, |f| {
                RunCommand::from_fields(f).map(Resource::Command)
            }),
            (ResourceKind::Service, |f| {
                Service::from_fields(f).map(Resource::Service)
            }),
            (ResourceKind::KubeadmInit, |f| {
                KubeadmInit::from_fields(f).map(Resource::KubeadmInit)
            }),
            (ResourceKind::KubeadmJoin, |f| {
                KubeadmJoin::from_fields(f).map(Resource::KubeadmJoin)
            }),
        ];
        let mut registry = Self::new();
        for (kind, ctor) in entries {
            registry.register(kind.tag(), ctor);
        }
        registry
    }

    /// Add or replace a kind.
    pub fn register(&mut self, kind: &'static str, ctor: Constructor) {
        self.constructors.insert(kind, ctor);
    }

    /// Known kind tags in registration order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Build a resource from its kind tag and manifest fields.
    pub fn construct(
        &self,
        kind: &str,
        fields: serde_yaml_ng::Value,
    ) -> Result<Resource, ConstructionError> {
        let ctor = self
            .constructors
            .get(kind)
            .ok_or_else(|| ConstructionError::UnknownKind(kind.to_string()))?;
        ctor(fields)
    }

    /// Build from an already-split field map (as parsed from a manifest entry).
    pub fn construct_map(
        &self,
        kind: &str,
        fields: &IndexMap<String, serde_yaml_ng::Value>,
    ) -> Result<Resource, ConstructionError> {
        let mut mapping = serde_yaml_ng::Mapping::new();
        for (k, v) in fields {
            mapping.insert(serde_yaml_ng::Value::String(k.clone()), v.clone());
        }
        self.construct(kind, serde_yaml_ng::Value::Mapping(mapping))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}
