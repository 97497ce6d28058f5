use futures::stream::BoxStream;

use crate::{DeltaEvent, Object, ObjectKey, RemoteError, ResourceVersion, Selector};

/// Stream of deltas from a single watch call; ends when the remote closes it.
pub type DeltaStream<K> = BoxStream<'static, Result<DeltaEvent<K>, RemoteError>>;

/// Complete snapshot returned by `list`.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: ResourceVersion,
}

/// The remote source of truth: typed CRUD plus list and watch.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    type Object: Object;

    async fn list(&self, selector: &Selector) -> Result<ObjectList<Self::Object>, RemoteError>;

    /// Watch changes strictly after `from`. An empty version means "from now".
    async fn watch(&self, selector: &Selector, from: &ResourceVersion) -> Result<DeltaStream<Self::Object>, RemoteError>;

    async fn get(&self, key: &ObjectKey) -> Result<Self::Object, RemoteError>;

    async fn create(&self, obj: &Self::Object) -> Result<Self::Object, RemoteError>;

    /// Fails with `Conflict` when `obj` carries a stale resource version.
    async fn update(&self, obj: &Self::Object) -> Result<Self::Object, RemoteError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), RemoteError>;

    /// Apply a JSON merge patch.
    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<Self::Object, RemoteError>;
}
