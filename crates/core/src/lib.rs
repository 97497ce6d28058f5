//! Rekon core types: object keys, resource versions, change events and the
//! remote store boundary every other crate builds on.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use kube::Resource;
use serde::{Deserialize, Serialize};

mod error;
pub mod fake;
mod remote;

pub use error::{ErrorClass, RemoteError};
pub use remote::{DeltaStream, ObjectList, RemoteStore};

pub mod prelude {
    pub use super::{
        ChangeEvent, DeltaEvent, ErrorClass, Object, ObjectKey, ObjectList, RemoteError, RemoteStore,
        ResourceVersion, Selector,
    };
}

/// Identity of an object in the remote store: `(namespace, name)`.
///
/// The namespace is empty for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self::new(String::new(), name) }

    /// Key of a resource; `None` when the object carries no name.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
        Some(Self::new(meta.namespace.clone().unwrap_or_default(), name))
    }

    pub fn is_cluster_scoped(&self) -> bool { self.namespace.is_empty() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key: {0:?} (expect name or namespace/name)")]
pub struct ParseKeyError(String);

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// Opaque per-object version marker handed out by the remote store.
///
/// Only versions that both parse as integers are ordered; anything else is
/// treated as incomparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    fn numeric(&self) -> Option<u64> { self.0.parse().ok() }

    /// True only when both versions are numeric and `self` is strictly older.
    pub fn is_older_than(&self, other: &ResourceVersion) -> bool {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self { Self(v) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self { Self(v.to_string()) }
}

/// Anything the engine can mirror: a typed Kubernetes resource.
pub trait Object: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    fn key(&self) -> Option<ObjectKey> { ObjectKey::of(self) }

    fn resource_version(&self) -> Option<ResourceVersion> {
        self.meta().resource_version.as_deref().filter(|v| !v.is_empty()).map(ResourceVersion::from)
    }

    fn set_resource_version(&mut self, rv: &ResourceVersion) {
        self.meta_mut().resource_version = Some(rv.as_str().to_string());
    }
}

impl<K> Object for K where K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {}

/// Raw change as delivered by a remote watch stream.
#[derive(Debug, Clone)]
pub enum DeltaEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: nothing changed, but the stream is current up to this version.
    Bookmark(ResourceVersion),
}

impl<K: Object> DeltaEvent<K> {
    pub fn object(&self) -> Option<&K> {
        match self {
            DeltaEvent::Added(o) | DeltaEvent::Modified(o) | DeltaEvent::Deleted(o) => Some(o),
            DeltaEvent::Bookmark(_) => None,
        }
    }

    pub fn resource_version(&self) -> Option<ResourceVersion> {
        match self {
            DeltaEvent::Bookmark(rv) => Some(rv.clone()),
            other => other.object().and_then(Object::resource_version),
        }
    }
}

/// Normalized change emitted once the local cache has absorbed a delta.
#[derive(Debug, Clone)]
pub enum ChangeEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    /// Carries the last known state (tombstone).
    Deleted(Arc<K>),
}

impl<K: Object> ChangeEvent<K> {
    /// Dedup key for the work queue, taken from the newest object state.
    pub fn key(&self) -> Option<ObjectKey> {
        match self {
            ChangeEvent::Added(o) | ChangeEvent::Deleted(o) => o.key(),
            ChangeEvent::Updated { new, .. } => new.key(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "added",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Deleted(_) => "deleted",
        }
    }
}

/// Scope of a list/watch: optional namespace plus label/field selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl Selector {
    pub fn namespaced(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), ..Default::default() }
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    /// Namespace filter only; label/field selectors are evaluated by the remote.
    pub fn matches_namespace(&self, key: &ObjectKey) -> bool {
        match self.namespace.as_deref() {
            None | Some("") => true,
            Some(ns) => key.namespace == ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(ns: Option<&str>, name: Option<&str>, rv: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: ns.map(str::to_string),
                name: name.map(str::to_string),
                resource_version: rv.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn key_display_and_parse() {
        let k = ObjectKey::new("default", "foo");
        assert_eq!(k.to_string(), "default/foo");
        assert_eq!("default/foo".parse::<ObjectKey>().unwrap(), k);

        let c = ObjectKey::cluster("node-1");
        assert_eq!(c.to_string(), "node-1");
        assert_eq!("node-1".parse::<ObjectKey>().unwrap(), c);
        assert!(c.is_cluster_scoped());

        assert!("".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("/b".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn key_of_object() {
        assert_eq!(cm(Some("ns"), Some("x"), None).key(), Some(ObjectKey::new("ns", "x")));
        assert_eq!(cm(None, Some("x"), None).key(), Some(ObjectKey::cluster("x")));
        assert_eq!(cm(Some("ns"), None, None).key(), None);
        assert_eq!(cm(Some("ns"), Some(""), None).key(), None);
    }

    #[test]
    fn resource_version_ordering() {
        let v9 = ResourceVersion::from(9u64);
        let v10 = ResourceVersion::from("10");
        assert!(v9.is_older_than(&v10));
        assert!(!v10.is_older_than(&v9));
        assert!(!v10.is_older_than(&v10));
        // opaque versions never count as stale
        let opaque = ResourceVersion::from("abc");
        assert!(!opaque.is_older_than(&v10));
        assert!(!v9.is_older_than(&opaque));
    }

    #[test]
    fn object_resource_version_roundtrip() {
        let mut o = cm(Some("ns"), Some("x"), Some(""));
        assert_eq!(o.resource_version(), None);
        o.set_resource_version(&ResourceVersion::from(42u64));
        assert_eq!(o.resource_version(), Some(ResourceVersion::from("42")));
    }

    #[test]
    fn selector_namespace_filter() {
        let all = Selector::default();
        let ns = Selector::namespaced("default").labels("app=web");
        assert!(all.matches_namespace(&ObjectKey::new("kube-system", "a")));
        assert!(ns.matches_namespace(&ObjectKey::new("default", "a")));
        assert!(!ns.matches_namespace(&ObjectKey::new("kube-system", "a")));
        assert_eq!(ns.label_selector.as_deref(), Some("app=web"));
    }
}
