#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use rekon_core::{ChangeEvent, DeltaEvent, Object, ObjectKey, ResourceVersion};
use rekon_store::store;

fn obj(name: &str, ns: &str, rv: u64, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        data: Some([("v".to_string(), value.to_string())].into_iter().collect()),
        ..Default::default()
    }
}

fn value(o: &ConfigMap) -> &str {
    o.data.as_ref().and_then(|d| d.get("v")).map(String::as_str).unwrap_or("")
}

#[test]
fn replay_out_of_order_and_duplicate_deltas() {
    let (w, r) = store::<ConfigMap>();

    let deltas = vec![
        DeltaEvent::Added(obj("a", "ns", 1, "a1")),
        // duplicate delivery
        DeltaEvent::Added(obj("a", "ns", 1, "a1")),
        DeltaEvent::Added(obj("b", "ns", 2, "b1")),
        DeltaEvent::Modified(obj("a", "ns", 4, "a2")),
        // arrives late, must not win
        DeltaEvent::Modified(obj("a", "ns", 3, "stale")),
        DeltaEvent::Deleted(obj("b", "ns", 5, "b1")),
    ];
    let events: Vec<_> = deltas.into_iter().filter_map(|d| w.apply(d).unwrap()).collect();
    let kinds: Vec<_> = events.iter().map(ChangeEvent::kind).collect();
    assert_eq!(kinds, vec!["added", "added", "updated", "deleted"]);

    assert_eq!(r.len(), 1);
    let a = r.get(&ObjectKey::new("ns", "a")).unwrap();
    assert_eq!(value(&a), "a2");
    assert_eq!(a.resource_version(), Some(ResourceVersion::from(4u64)));
    assert!(r.get(&ObjectKey::new("ns", "b")).is_none());
}

#[test]
fn resync_reports_missed_deletes_and_changes() {
    let (w, r) = store::<ConfigMap>();
    w.replace(vec![obj("a", "ns", 1, "a1"), obj("b", "ns", 2, "b1")], ResourceVersion::from(2u64));

    // while disconnected: b deleted, a changed, c created
    let events = w.replace(vec![obj("a", "ns", 7, "a2"), obj("c", "ns", 8, "c1")], ResourceVersion::from(8u64));
    let mut seen: Vec<_> = events.iter().map(|e| (e.kind(), e.key().unwrap().to_string())).collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![("added", "ns/c".to_string()), ("deleted", "ns/b".to_string()), ("updated", "ns/a".to_string())]
    );
    if let Some(ChangeEvent::Deleted(tomb)) = events.iter().find(|e| e.kind() == "deleted") {
        assert_eq!(value(tomb), "b1");
    }
    assert_eq!(r.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_whole_objects_during_writes() {
    let (w, r) = store::<ConfigMap>();
    let key = ObjectKey::new("ns", "hot");
    w.apply(DeltaEvent::Added(obj("hot", "ns", 1, "1"))).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let r = r.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let mut last = 0u64;
                for _ in 0..2_000 {
                    let o: Arc<ConfigMap> = r.get(&key).expect("object stays present");
                    let rv: u64 = o.resource_version().unwrap().as_str().parse().unwrap();
                    // payload always matches the version it was written with
                    assert_eq!(value(&o), rv.to_string());
                    assert!(rv >= last, "cache regressed from {last} to {rv}");
                    last = rv;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for rv in 2..=500u64 {
        w.apply(DeltaEvent::Modified(obj("hot", "ns", rv, &rv.to_string()))).unwrap();
        if rv % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }
    for h in readers {
        h.await.unwrap();
    }
}
