use std::sync::Arc;

use rekon_core::{ChangeEvent, Object, ObjectKey};
use rekon_queue::WorkQueue;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Turn every change event into its key and enqueue it, until the sending
/// reflector goes away. Deletions enqueue the tombstone's key so the
/// reconciler can observe the absence.
pub async fn enqueue_changes<K: Object>(mut events: mpsc::Receiver<ChangeEvent<K>>, queue: Arc<WorkQueue<ObjectKey>>) {
    while let Some(ev) = events.recv().await {
        match ev.key() {
            Some(key) => {
                trace!(key = %key, change = ev.kind(), "enqueue");
                queue.add(key);
            }
            None => warn!(change = ev.kind(), "change event without a key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str) -> Arc<ConfigMap> {
        Arc::new(ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), ..Default::default() },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn every_change_kind_enqueues_its_key_once() {
        let queue = Arc::new(WorkQueue::with_default_limiter("translate"));
        let (tx, rx) = mpsc::channel(8);
        tx.send(ChangeEvent::Added(cm("a"))).await.unwrap();
        tx.send(ChangeEvent::Updated { old: cm("a"), new: cm("a") }).await.unwrap();
        tx.send(ChangeEvent::Deleted(cm("b"))).await.unwrap();
        drop(tx);
        enqueue_changes(rx, queue.clone()).await;

        assert_eq!(queue.len(), 2);
        let mut got = vec![queue.get().await.unwrap(), queue.get().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![ObjectKey::new("ns", "a"), ObjectKey::new("ns", "b")]);
    }
}
