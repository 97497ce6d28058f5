//! Rekon store: the local cache (indexer) mirroring remote state by key.
//!
//! One [`Writer`] (owned by the reflector) applies deltas and full resyncs;
//! any number of cloned [`Reader`]s serve point lookups and listings to the
//! workers. Each delta is applied under a single write lock, so readers never
//! observe a half-applied change.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::{counter, gauge};
use rekon_core::{ChangeEvent, DeltaEvent, Object, ObjectKey, ResourceVersion};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object has no name (kind {kind})")]
    MissingName { kind: String },
}

struct Shared<K> {
    items: RwLock<FxHashMap<ObjectKey, Arc<K>>>,
    last_sync_rv: RwLock<Option<ResourceVersion>>,
    synced: watch::Sender<bool>,
}

impl<K> Shared<K> {
    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ObjectKey, Arc<K>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build an empty cache, returning its single writer and a reader handle.
pub fn store<K: Object>() -> (Writer<K>, Reader<K>) {
    let (synced, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        items: RwLock::new(FxHashMap::default()),
        last_sync_rv: RwLock::new(None),
        synced,
    });
    (Writer { shared: Arc::clone(&shared), tombstones: Mutex::default() }, Reader { shared })
}

/// True when `new` is provably older than what we already hold.
fn is_stale<K: Object>(new: &K, held: &K) -> bool {
    match (new.resource_version(), held.resource_version()) {
        (Some(n), Some(h)) => n.is_older_than(&h),
        _ => false,
    }
}

fn same_version<K: Object>(a: &K, b: &K) -> bool {
    matches!((a.resource_version(), b.resource_version()), (Some(x), Some(y)) if x == y)
}

fn key_of<K: Object>(obj: &K) -> Result<ObjectKey, StoreError> {
    obj.key().ok_or_else(|| StoreError::MissingName { kind: K::kind(&()).to_string() })
}

pub struct Writer<K> {
    shared: Arc<Shared<K>>,
    /// Version each key was deleted at, until the next full list. Keeps a late
    /// replay of an older add from resurrecting the object.
    tombstones: Mutex<FxHashMap<ObjectKey, ResourceVersion>>,
}

impl<K: Object> Writer<K> {
    pub fn reader(&self) -> Reader<K> { Reader { shared: Arc::clone(&self.shared) } }

    fn tombstones(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, ResourceVersion>> {
        self.tombstones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when `obj` is no newer than the delete already seen for `key`.
    fn buried(&self, key: &ObjectKey, obj: &K) -> bool {
        let mut tombstones = self.tombstones();
        let Some(gone) = tombstones.get(key) else { return false };
        match obj.resource_version() {
            Some(rv) if rv.is_older_than(gone) || rv == *gone => true,
            _ => {
                tombstones.remove(key);
                false
            }
        }
    }

    /// Apply one watch delta. Returns the normalized change, or `None` when the
    /// delta was stale or duplicate, a bookmark, or a delete of something we never held.
    pub fn apply(&self, delta: DeltaEvent<K>) -> Result<Option<ChangeEvent<K>>, StoreError> {
        match delta {
            DeltaEvent::Bookmark(_) => Ok(None),
            DeltaEvent::Added(obj) | DeltaEvent::Modified(obj) => {
                let key = key_of(&obj)?;
                let mut items = self.shared.write();
                let event = match items.get(&key) {
                    Some(held) if is_stale(&obj, held) || same_version(&obj, held) => {
                        debug!(key = %key, "ignoring stale or duplicate delta");
                        counter!("store_stale_deltas_total", 1u64);
                        return Ok(None);
                    }
                    Some(held) => {
                        let old = Arc::clone(held);
                        let new = Arc::new(obj);
                        items.insert(key, Arc::clone(&new));
                        ChangeEvent::Updated { old, new }
                    }
                    None if self.buried(&key, &obj) => {
                        debug!(key = %key, "ignoring delta older than the delete");
                        counter!("store_stale_deltas_total", 1u64);
                        return Ok(None);
                    }
                    None => {
                        let new = Arc::new(obj);
                        items.insert(key, Arc::clone(&new));
                        ChangeEvent::Added(new)
                    }
                };
                gauge!("store_objects", items.len() as f64);
                Ok(Some(event))
            }
            DeltaEvent::Deleted(tombstone) => {
                let key = key_of(&tombstone)?;
                let mut items = self.shared.write();
                match items.get(&key) {
                    None => Ok(None),
                    Some(held) if is_stale(&tombstone, held) => {
                        debug!(key = %key, "ignoring stale delete");
                        counter!("store_stale_deltas_total", 1u64);
                        Ok(None)
                    }
                    Some(held) => {
                        if let Some(rv) = tombstone.resource_version().or_else(|| held.resource_version()) {
                            self.tombstones().insert(key.clone(), rv);
                        }
                        items.remove(&key);
                        gauge!("store_objects", items.len() as f64);
                        Ok(Some(ChangeEvent::Deleted(Arc::new(tombstone))))
                    }
                }
            }
        }
    }

    /// Swap in a full snapshot and return the difference against the previous
    /// contents. Unchanged objects (same version) produce no event, so replaying
    /// the same snapshot twice is a no-op the second time.
    pub fn replace(&self, objects: Vec<K>, resource_version: ResourceVersion) -> Vec<ChangeEvent<K>> {
        let mut events = Vec::new();
        let mut items = self.shared.write();
        self.tombstones().clear();
        let mut old = std::mem::take(&mut *items);
        let mut next: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
        next.reserve(objects.len());

        for obj in objects {
            let key = match key_of(&obj) {
                Ok(k) => k,
                Err(e) => {
                    warn!(error = %e, "skipping listed object without a key");
                    continue;
                }
            };
            match old.remove(&key) {
                Some(held) if is_stale(&obj, &held) || same_version(&obj, &held) => {
                    next.insert(key, held);
                }
                Some(held) => {
                    let new = Arc::new(obj);
                    next.insert(key, Arc::clone(&new));
                    events.push(ChangeEvent::Updated { old: held, new });
                }
                None => {
                    let new = Arc::new(obj);
                    next.insert(key, Arc::clone(&new));
                    events.push(ChangeEvent::Added(new));
                }
            }
        }
        events.extend(old.into_values().map(ChangeEvent::Deleted));
        *items = next;
        gauge!("store_objects", items.len() as f64);
        drop(items);

        *self.shared.last_sync_rv.write().unwrap_or_else(PoisonError::into_inner) = Some(resource_version.clone());
        debug!(rv = %resource_version, changes = events.len(), "cache replaced");
        events
    }

    /// Flag the cache as holding a complete view; idempotent.
    pub fn mark_synced(&self) {
        let was = self.shared.synced.send_replace(true);
        if !was {
            info!(objects = self.shared.read().len(), "cache synced");
        }
    }
}

/// Cheap, cloneable read handle.
pub struct Reader<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Reader<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K: Object> Reader<K> {
    /// `None` means deleted or never observed; not an error.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.shared.read().get(key).cloned() }

    pub fn list(&self) -> Vec<Arc<K>> { self.shared.read().values().cloned().collect() }

    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.shared
            .read()
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, o)| Arc::clone(o))
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> { self.shared.read().keys().cloned().collect() }
    pub fn len(&self) -> usize { self.shared.read().len() }
    pub fn is_empty(&self) -> bool { self.shared.read().is_empty() }
    pub fn is_synced(&self) -> bool { *self.shared.synced.borrow() }

    pub fn last_sync_resource_version(&self) -> Option<ResourceVersion> {
        self.shared.last_sync_rv.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Resolve once the first full list has landed and a watch is open.
    pub async fn wait_synced(&self) {
        let mut rx = self.shared.synced.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(ns: &str, name: &str, rv: u64) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(ns.into()),
                name: Some(name.into()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn apply_normalizes_events() {
        let (w, r) = store::<ConfigMap>();
        let ev = w.apply(DeltaEvent::Modified(cm("ns", "a", 1))).unwrap().unwrap();
        assert!(matches!(ev, ChangeEvent::Added(_)));
        let ev = w.apply(DeltaEvent::Added(cm("ns", "a", 2))).unwrap().unwrap();
        assert!(matches!(ev, ChangeEvent::Updated { .. }));
        assert_eq!(r.len(), 1);
        assert!(w.apply(DeltaEvent::Bookmark(ResourceVersion::from(3u64))).unwrap().is_none());
    }

    #[test]
    fn stale_deltas_never_regress() {
        let (w, r) = store::<ConfigMap>();
        w.apply(DeltaEvent::Added(cm("ns", "a", 5))).unwrap();
        assert!(w.apply(DeltaEvent::Modified(cm("ns", "a", 4))).unwrap().is_none());
        assert!(w.apply(DeltaEvent::Deleted(cm("ns", "a", 3))).unwrap().is_none());
        let held = r.get(&ObjectKey::new("ns", "a")).unwrap();
        assert_eq!(held.resource_version(), Some(ResourceVersion::from(5u64)));
    }

    #[test]
    fn late_add_cannot_resurrect_a_deleted_object() {
        let (w, r) = store::<ConfigMap>();
        w.apply(DeltaEvent::Added(cm("ns", "a", 3))).unwrap();
        assert!(w.apply(DeltaEvent::Deleted(cm("ns", "a", 5))).unwrap().is_some());

        assert!(w.apply(DeltaEvent::Added(cm("ns", "a", 3))).unwrap().is_none());
        assert!(w.apply(DeltaEvent::Modified(cm("ns", "a", 5))).unwrap().is_none());
        assert!(r.get(&ObjectKey::new("ns", "a")).is_none());

        // recreated after the delete
        let ev = w.apply(DeltaEvent::Added(cm("ns", "a", 6))).unwrap();
        assert!(matches!(ev, Some(ChangeEvent::Added(_))));
        w.apply(DeltaEvent::Deleted(cm("ns", "a", 7))).unwrap();

        // a full list is authoritative and clears what the watch remembered
        w.replace(vec![cm("ns", "a", 4)], ResourceVersion::from(8u64));
        assert!(r.get(&ObjectKey::new("ns", "a")).is_some());
    }

    #[test]
    fn delete_of_unknown_key_is_silent() {
        let (w, _r) = store::<ConfigMap>();
        assert!(w.apply(DeltaEvent::Deleted(cm("ns", "ghost", 1))).unwrap().is_none());
    }

    #[test]
    fn nameless_object_is_rejected() {
        let (w, r) = store::<ConfigMap>();
        let mut o = cm("ns", "a", 1);
        o.metadata.name = None;
        assert!(matches!(w.apply(DeltaEvent::Added(o)), Err(StoreError::MissingName { .. })));
        assert!(r.is_empty());
    }

    #[test]
    fn replace_twice_is_idempotent() {
        let (w, r) = store::<ConfigMap>();
        w.apply(DeltaEvent::Added(cm("ns", "gone", 1))).unwrap();
        w.apply(DeltaEvent::Added(cm("ns", "kept", 2))).unwrap();
        let snapshot = vec![cm("ns", "kept", 2), cm("ns", "new", 3)];

        let first = w.replace(snapshot.clone(), ResourceVersion::from(3u64));
        let mut kinds: Vec<_> = first.iter().map(|e| (e.kind(), e.key().unwrap().name)).collect();
        kinds.sort();
        assert_eq!(kinds, vec![("added", "new".to_string()), ("deleted", "gone".to_string())]);

        let second = w.replace(snapshot, ResourceVersion::from(3u64));
        assert!(second.is_empty());
        let mut names: Vec<_> = r.keys().into_iter().map(|k| k.name).collect();
        names.sort();
        assert_eq!(names, vec!["kept", "new"]);
        assert_eq!(r.last_sync_resource_version(), Some(ResourceVersion::from(3u64)));
    }

    #[test]
    fn list_namespace_filters() {
        let (w, r) = store::<ConfigMap>();
        w.apply(DeltaEvent::Added(cm("default", "a", 1))).unwrap();
        w.apply(DeltaEvent::Added(cm("kube-system", "b", 2))).unwrap();
        let names: Vec<_> = r.list_namespace("default").iter().filter_map(|o| o.metadata.name.clone()).collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(r.list().len(), 2);
    }

    #[tokio::test]
    async fn wait_synced_resolves_after_mark() {
        let (w, r) = store::<ConfigMap>();
        assert!(!r.is_synced());
        let waiter = tokio::spawn({
            let r = r.clone();
            async move { r.wait_synced().await }
        });
        w.mark_synced();
        waiter.await.unwrap();
        assert!(r.is_synced());
    }
}
