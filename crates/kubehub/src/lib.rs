//! Rekon kubehub: [`RemoteStore`] backed by the Kubernetes API server.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
    core::ErrorResponse,
    Client, Resource,
};
use metrics::counter;
use rekon_core::{
    DeltaEvent, DeltaStream, Object, ObjectKey, ObjectList, RemoteError, RemoteStore, ResourceVersion, Selector,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

/// Server-side watch timeout; the reflector relists or resumes when it lapses.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Build a client from kubeconfig or the in-cluster environment.
pub async fn connect() -> Result<Client> {
    let client = Client::try_default().await.context("building kube client")?;
    info!(default_ns = %client.default_namespace(), "kube client ready");
    Ok(client)
}

/// Map a kube client error onto the engine's error classes.
pub fn remote_error(err: kube::Error) -> RemoteError {
    match err {
        kube::Error::Api(resp) => status_error(&resp),
        kube::Error::SerdeError(e) => RemoteError::Decode(e.to_string()),
        kube::Error::Auth(e) => RemoteError::Unauthorized(e.to_string()),
        other => RemoteError::Transport(other.to_string()),
    }
}

fn status_error(resp: &ErrorResponse) -> RemoteError {
    let msg = resp.message.clone();
    match resp.code {
        401 | 403 => RemoteError::Unauthorized(msg),
        404 => RemoteError::NotFound(msg),
        409 if resp.reason == "AlreadyExists" => RemoteError::AlreadyExists(msg),
        409 => RemoteError::Conflict(msg),
        410 => RemoteError::ResourceVersionTooOld(msg),
        code => RemoteError::Transport(format!("{code} {}: {msg}", resp.reason)),
    }
}

fn observe<T>(verb: &'static str, res: Result<T, kube::Error>) -> Result<T, RemoteError> {
    counter!("kube_requests_total", 1u64, "verb" => verb);
    res.map_err(|e| {
        let err = remote_error(e);
        counter!("kube_request_errors_total", 1u64, "verb" => verb, "class" => format!("{:?}", err.class()));
        debug!(verb, error = %err, "kube request failed");
        err
    })
}

fn delta_from<K>(ev: WatchEvent<K>) -> Result<DeltaEvent<K>, RemoteError> {
    match ev {
        WatchEvent::Added(o) => Ok(DeltaEvent::Added(o)),
        WatchEvent::Modified(o) => Ok(DeltaEvent::Modified(o)),
        WatchEvent::Deleted(o) => Ok(DeltaEvent::Deleted(o)),
        WatchEvent::Bookmark(b) => Ok(DeltaEvent::Bookmark(ResourceVersion::from(b.metadata.resource_version))),
        WatchEvent::Error(resp) => Err(status_error(&resp)),
    }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = selector.label_selector.as_deref() {
        lp = lp.labels(l);
    }
    if let Some(f) = selector.field_selector.as_deref() {
        lp = lp.fields(f);
    }
    lp
}

fn watch_params(selector: &Selector) -> WatchParams {
    let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(l) = selector.label_selector.as_deref() {
        wp = wp.labels(l);
    }
    if let Some(f) = selector.field_selector.as_deref() {
        wp = wp.fields(f);
    }
    wp
}

type ScopedApi<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// Typed kube API access for one resource kind.
///
/// Requests are scoped per call: list/watch by the selector's namespace,
/// CRUD by the key's namespace.
#[derive(Clone)]
pub struct KubeRemote<K> {
    scoped: ScopedApi<K>,
}

impl<K> KubeRemote<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + 'static,
{
    /// Kind living inside namespaces (Pods, Deployments, ConfigMaps...).
    pub fn namespaced(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        let scoped: ScopedApi<K> = Arc::new(move |ns: Option<&str>| match ns {
            Some(ns) if !ns.is_empty() => Api::namespaced(client.clone(), ns),
            _ => Api::all(client.clone()),
        });
        Self { scoped }
    }

    /// Cluster-scoped kind (Nodes, Namespaces...); namespaces are ignored.
    pub fn cluster(client: Client) -> Self
    where
        K: Resource<Scope = ClusterResourceScope>,
    {
        let scoped: ScopedApi<K> = Arc::new(move |_: Option<&str>| Api::all(client.clone()));
        Self { scoped }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> { (self.scoped)(namespace) }

    fn for_key(&self, key: &ObjectKey) -> Api<K> {
        self.api(Some(key.namespace.as_str()).filter(|ns| !ns.is_empty()))
    }
}

#[async_trait::async_trait]
impl<K> RemoteStore for KubeRemote<K>
where
    K: Object + Serialize + DeserializeOwned + Debug,
{
    type Object = K;

    async fn list(&self, selector: &Selector) -> Result<ObjectList<K>, RemoteError> {
        let api = self.api(selector.namespace.as_deref());
        let list = observe("list", api.list(&list_params(selector)).await)?;
        let resource_version = ResourceVersion::from(list.metadata.resource_version.unwrap_or_default());
        debug!(count = list.items.len(), rv = %resource_version, "listed");
        Ok(ObjectList { items: list.items, resource_version })
    }

    async fn watch(&self, selector: &Selector, from: &ResourceVersion) -> Result<DeltaStream<K>, RemoteError> {
        let api = self.api(selector.namespace.as_deref());
        let stream = observe("watch", api.watch(&watch_params(selector), from.as_str()).await)?;
        debug!(from = %from, ns = ?selector.namespace, "watch opened");
        Ok(stream
            .map(|item| match item {
                Ok(ev) => delta_from(ev),
                Err(e) => {
                    let err = remote_error(e);
                    warn!(error = %err, "watch stream item failed");
                    Err(err)
                }
            })
            .boxed())
    }

    async fn get(&self, key: &ObjectKey) -> Result<K, RemoteError> {
        observe("get", self.for_key(key).get(&key.name).await)
    }

    async fn create(&self, obj: &K) -> Result<K, RemoteError> {
        let key = obj.key().ok_or_else(|| RemoteError::Decode("object has no name".into()))?;
        observe("create", self.for_key(&key).create(&PostParams::default(), obj).await)
    }

    async fn update(&self, obj: &K) -> Result<K, RemoteError> {
        let key = obj.key().ok_or_else(|| RemoteError::Decode("object has no name".into()))?;
        observe("update", self.for_key(&key).replace(&key.name, &PostParams::default(), obj).await)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), RemoteError> {
        observe("delete", self.for_key(key).delete(&key.name, &DeleteParams::background()).await).map(|_| ())
    }

    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K, RemoteError> {
        observe("patch", self.for_key(key).patch(&key.name, &PatchParams::default(), &Patch::Merge(patch)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::ErrorClass;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn status_codes_map_to_classes() {
        let cases = [
            (401, "Unauthorized", ErrorClass::PermanentLogic),
            (403, "Forbidden", ErrorClass::PermanentLogic),
            (404, "NotFound", ErrorClass::NotFound),
            (409, "Conflict", ErrorClass::Conflict),
            (409, "AlreadyExists", ErrorClass::PermanentLogic),
            (410, "Expired", ErrorClass::TransientInfra),
            (500, "InternalError", ErrorClass::TransientInfra),
            (429, "TooManyRequests", ErrorClass::TransientInfra),
        ];
        for (code, reason, class) in cases {
            assert_eq!(remote_error(api_err(code, reason)).class(), class, "{code} {reason}");
        }
        assert!(remote_error(api_err(410, "Expired")).is_too_old());
        assert!(matches!(remote_error(api_err(409, "AlreadyExists")), RemoteError::AlreadyExists(_)));
    }

    #[test]
    fn serde_failures_are_decode_errors() {
        let Err(e) = serde_json::from_str::<serde_json::Value>("{") else { panic!("parsed") };
        assert!(matches!(remote_error(kube::Error::SerdeError(e)), RemoteError::Decode(_)));
    }

    #[test]
    fn watch_events_become_deltas() {
        use k8s_openapi::api::core::v1::ConfigMap;
        let cm = ConfigMap::default();
        assert!(matches!(delta_from(WatchEvent::Added(cm.clone())), Ok(DeltaEvent::Added(_))));
        assert!(matches!(delta_from(WatchEvent::Deleted(cm)), Ok(DeltaEvent::Deleted(_))));
        let gone: WatchEvent<ConfigMap> = WatchEvent::Error(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version: 1 (20)".into(),
            reason: "Expired".into(),
            code: 410,
        });
        assert!(matches!(delta_from(gone), Err(RemoteError::ResourceVersionTooOld(_))));
    }

    #[test]
    fn selectors_reach_request_params() {
        let sel = Selector::namespaced("default").labels("app=web").fields("status.phase=Running");
        let lp = list_params(&sel);
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(lp.field_selector.as_deref(), Some("status.phase=Running"));
        let wp = watch_params(&sel);
        assert_eq!(wp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(wp.timeout, Some(WATCH_TIMEOUT_SECS));
    }
}
