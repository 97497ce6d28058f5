//! In-memory [`RemoteStore`] with integer resource versions and a replayable
//! event history. Used by tests and offline demos in place of a cluster.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{DeltaEvent, DeltaStream, Object, ObjectKey, ObjectList, RemoteError, RemoteStore, ResourceVersion, Selector};

type Item<K> = Result<DeltaEvent<K>, RemoteError>;

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    rv: u64,
    history: VecDeque<(u64, DeltaEvent<K>)>,
    /// Versions at or below this are no longer replayable.
    compacted: u64,
    list_failures: u32,
    watch_expiries: u32,
    list_calls: u32,
    watch_from: Vec<ResourceVersion>,
    watches: Vec<CancellationToken>,
}

pub struct FakeRemote<K: Object> {
    state: Mutex<State<K>>,
    tx: broadcast::Sender<Item<K>>,
}

impl<K: Object> Default for FakeRemote<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> FakeRemote<K> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        let state = State {
            objects: BTreeMap::new(),
            rv: 0,
            history: VecDeque::new(),
            compacted: 0,
            list_failures: 0,
            watch_expiries: 0,
            list_calls: 0,
            watch_from: Vec::new(),
            watches: Vec::new(),
        };
        Self { state: Mutex::new(state), tx }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn record(&self, st: &mut State<K>, rv: u64, event: DeltaEvent<K>) {
        st.history.push_back((rv, event.clone()));
        // No receivers is fine: nobody is watching yet.
        let _ = self.tx.send(Ok(event));
    }

    /// Create or overwrite regardless of the version the caller holds.
    pub fn upsert(&self, mut obj: K) -> Result<K, RemoteError> {
        let key = obj.key().ok_or_else(|| RemoteError::Decode("object has no name".into()))?;
        let mut st = self.state();
        st.rv += 1;
        let rv = st.rv;
        obj.set_resource_version(&ResourceVersion::from(rv));
        let existed = st.objects.insert(key, obj.clone()).is_some();
        let event = if existed { DeltaEvent::Modified(obj.clone()) } else { DeltaEvent::Added(obj.clone()) };
        self.record(&mut st, rv, event);
        Ok(obj)
    }

    /// Make the next `n` list calls fail with a transport error.
    pub fn fail_next_lists(&self, n: u32) { self.state().list_failures = n; }

    /// Make the next `n` watch calls refuse with `ResourceVersionTooOld`,
    /// whatever version they resume from.
    pub fn expire_next_watches(&self, n: u32) { self.state().watch_expiries = n; }

    /// Drop the event history; watches resuming from before now get `ResourceVersionTooOld`.
    pub fn compact(&self) {
        let mut st = self.state();
        st.compacted = st.rv;
        st.history.clear();
    }

    /// End every open watch stream, as an apiserver timeout would.
    pub fn close_watches(&self) {
        let mut st = self.state();
        for token in st.watches.drain(..) {
            token.cancel();
        }
    }

    /// Compact, then fail every open watch with `ResourceVersionTooOld`.
    pub fn expire_watches(&self) {
        self.compact();
        let _ = self.tx.send(Err(RemoteError::ResourceVersionTooOld("watch expired".into())));
    }

    /// Push an undecodable delta to every open watch.
    pub fn emit_malformed(&self, detail: &str) {
        let _ = self.tx.send(Err(RemoteError::Decode(detail.to_string())));
    }

    /// Push a bare delta to open watches without touching stored state.
    pub fn emit_raw(&self, event: DeltaEvent<K>) {
        let _ = self.tx.send(Ok(event));
    }

    pub fn list_calls(&self) -> u32 { self.state().list_calls }
    pub fn watch_versions(&self) -> Vec<ResourceVersion> { self.state().watch_from.clone() }
    pub fn current_version(&self) -> ResourceVersion { ResourceVersion::from(self.state().rv) }
    pub fn len(&self) -> usize { self.state().objects.len() }
    pub fn is_empty(&self) -> bool { self.state().objects.is_empty() }
}

fn in_scope<K: Object>(selector: &Selector, item: &Item<K>) -> bool {
    match item {
        Ok(delta) => delta
            .object()
            .and_then(Object::key)
            .map(|k| selector.matches_namespace(&k))
            .unwrap_or(true),
        Err(_) => true,
    }
}

#[async_trait::async_trait]
impl<K> RemoteStore for FakeRemote<K>
where
    K: Object + Serialize + DeserializeOwned,
{
    type Object = K;

    async fn list(&self, selector: &Selector) -> Result<ObjectList<K>, RemoteError> {
        let mut st = self.state();
        st.list_calls += 1;
        if st.list_failures > 0 {
            st.list_failures -= 1;
            return Err(RemoteError::Transport("injected list failure".into()));
        }
        let items = st
            .objects
            .iter()
            .filter(|(k, _)| selector.matches_namespace(k))
            .map(|(_, o)| o.clone())
            .collect();
        Ok(ObjectList { items, resource_version: ResourceVersion::from(st.rv) })
    }

    async fn watch(&self, selector: &Selector, from: &ResourceVersion) -> Result<DeltaStream<K>, RemoteError> {
        let mut st = self.state();
        st.watch_from.push(from.clone());
        if st.watch_expiries > 0 {
            st.watch_expiries -= 1;
            return Err(RemoteError::ResourceVersionTooOld(from.to_string()));
        }
        let from_rv = if from.is_empty() {
            st.rv
        } else {
            from.as_str().parse::<u64>().map_err(|_| RemoteError::ResourceVersionTooOld(from.to_string()))?
        };
        if from_rv < st.compacted {
            debug!(from = %from, compacted = st.compacted, "watch resume point compacted");
            let gone: Item<K> = Err(RemoteError::ResourceVersionTooOld(from.to_string()));
            return Ok(futures::stream::iter(vec![gone]).boxed());
        }
        let replay: Vec<Item<K>> = st
            .history
            .iter()
            .filter(|(rv, _)| *rv > from_rv)
            .map(|(_, e)| Ok(e.clone()))
            .filter(|item| in_scope(selector, item))
            .collect();
        // Subscribe under the lock so nothing slips between replay and live.
        let rx = self.tx.subscribe();
        let token = CancellationToken::new();
        st.watches.push(token.clone());
        let selector = selector.clone();

        let live = futures::stream::unfold((rx, token, selector), |(mut rx, token, selector)| async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return None,
                    msg = rx.recv() => match msg {
                        Ok(item) if in_scope(&selector, &item) => return Some((item, (rx, token, selector))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let gone: Item<K> = Err(RemoteError::ResourceVersionTooOld(format!("watch lagged by {n}")));
                            return Some((gone, (rx, token, selector)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        });
        Ok(futures::stream::iter(replay).chain(live).boxed())
    }

    async fn get(&self, key: &ObjectKey) -> Result<K, RemoteError> {
        self.state().objects.get(key).cloned().ok_or_else(|| RemoteError::NotFound(key.to_string()))
    }

    async fn create(&self, obj: &K) -> Result<K, RemoteError> {
        let key = obj.key().ok_or_else(|| RemoteError::Decode("object has no name".into()))?;
        let mut st = self.state();
        if st.objects.contains_key(&key) {
            return Err(RemoteError::AlreadyExists(key.to_string()));
        }
        st.rv += 1;
        let rv = st.rv;
        let mut created = obj.clone();
        created.set_resource_version(&ResourceVersion::from(rv));
        st.objects.insert(key, created.clone());
        self.record(&mut st, rv, DeltaEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, RemoteError> {
        let key = obj.key().ok_or_else(|| RemoteError::Decode("object has no name".into()))?;
        let mut st = self.state();
        let current = st.objects.get(&key).ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        if let Some(theirs) = obj.resource_version() {
            if Some(&theirs) != current.resource_version().as_ref() {
                return Err(RemoteError::Conflict(format!("{key}: resource version {theirs} is stale")));
            }
        }
        st.rv += 1;
        let rv = st.rv;
        let mut updated = obj.clone();
        updated.set_resource_version(&ResourceVersion::from(rv));
        st.objects.insert(key, updated.clone());
        self.record(&mut st, rv, DeltaEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), RemoteError> {
        let mut st = self.state();
        let mut gone = st.objects.remove(key).ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        st.rv += 1;
        let rv = st.rv;
        gone.set_resource_version(&ResourceVersion::from(rv));
        self.record(&mut st, rv, DeltaEvent::Deleted(gone));
        Ok(())
    }

    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K, RemoteError> {
        let mut st = self.state();
        let current = st.objects.get(key).ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        let mut doc = serde_json::to_value(current).map_err(|e| RemoteError::Decode(e.to_string()))?;
        json_patch::merge(&mut doc, patch);
        let mut patched: K = serde_json::from_value(doc).map_err(|e| RemoteError::Decode(e.to_string()))?;
        if patched.key().as_ref() != Some(key) {
            return Err(RemoteError::Decode(format!("patch may not rename {key}")));
        }
        st.rv += 1;
        let rv = st.rv;
        patched.set_resource_version(&ResourceVersion::from(rv));
        st.objects.insert(key.clone(), patched.clone());
        self.record(&mut st, rv, DeltaEvent::Modified(patched.clone()));
        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(ns: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { namespace: Some(ns.into()), name: Some(name.into()), ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn crud_bumps_versions_and_detects_conflicts() {
        let remote = FakeRemote::<ConfigMap>::new();
        let a = remote.create(&cm("default", "a")).await.unwrap();
        assert_eq!(a.resource_version(), Some(ResourceVersion::from(1u64)));
        assert!(matches!(remote.create(&cm("default", "a")).await, Err(RemoteError::AlreadyExists(_))));

        let mut stale = a.clone();
        let fresh = remote.update(&a).await.unwrap();
        assert_eq!(fresh.resource_version(), Some(ResourceVersion::from(2u64)));
        stale.data = Some([("k".to_string(), "v".to_string())].into_iter().collect());
        assert!(remote.update(&stale).await.unwrap_err().is_conflict());

        let key = ObjectKey::new("default", "a");
        let patched = remote.patch(&key, &serde_json::json!({"data": {"x": "1"}})).await.unwrap();
        assert_eq!(patched.data.unwrap().get("x").map(String::as_str), Some("1"));

        remote.delete(&key).await.unwrap();
        assert!(remote.get(&key).await.unwrap_err().is_not_found());
        assert!(remote.delete(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_honours_namespace_and_injected_failures() {
        let remote = FakeRemote::<ConfigMap>::new();
        remote.upsert(cm("default", "a")).unwrap();
        remote.upsert(cm("other", "b")).unwrap();
        remote.fail_next_lists(1);
        assert!(remote.list(&Selector::default()).await.is_err());
        let list = remote.list(&Selector::namespaced("default")).await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.resource_version, ResourceVersion::from(2u64));
        assert_eq!(remote.list_calls(), 2);
    }

    #[tokio::test]
    async fn watch_replays_history_then_goes_live() {
        let remote = FakeRemote::<ConfigMap>::new();
        remote.upsert(cm("default", "a")).unwrap();
        remote.upsert(cm("default", "b")).unwrap();
        let mut stream = remote.watch(&Selector::default(), &ResourceVersion::from(1u64)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.object().and_then(Object::key), Some(ObjectKey::new("default", "b")));

        remote.delete(&ObjectKey::new("default", "a")).await.unwrap();
        assert!(matches!(stream.next().await, Some(Ok(DeltaEvent::Deleted(_)))));

        remote.close_watches();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn watch_from_compacted_version_is_too_old() {
        let remote = FakeRemote::<ConfigMap>::new();
        remote.upsert(cm("default", "a")).unwrap();
        remote.upsert(cm("default", "a")).unwrap();
        remote.compact();
        let mut stream = remote.watch(&Selector::default(), &ResourceVersion::from(1u64)).await.unwrap();
        assert!(stream.next().await.unwrap().unwrap_err().is_too_old());
        assert!(stream.next().await.is_none());
        assert_eq!(remote.watch_versions(), vec![ResourceVersion::from(1u64)]);
    }

    #[tokio::test]
    async fn expired_watch_calls_are_refused_until_exhausted() {
        let remote = FakeRemote::<ConfigMap>::new();
        remote.upsert(cm("default", "a")).unwrap();
        remote.expire_next_watches(2);
        let from = remote.current_version();
        for _ in 0..2 {
            let refused = remote.watch(&Selector::default(), &from).await.err();
            assert!(refused.is_some_and(|e| e.is_too_old()));
        }
        assert!(remote.watch(&Selector::default(), &from).await.is_ok());
        assert_eq!(remote.watch_versions().len(), 3);
    }
}
