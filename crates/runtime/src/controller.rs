//! Controller lifecycle: reflector, translator and worker pool wired around
//! one cache and one work queue.
//!
//! Startup is strictly ordered: workers only start once the cache has synced.
//! Shutdown is cooperative: cancellation stops the reflector and shuts the
//! queue down; workers finish their current key and exit on the next `get`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::{counter, histogram};
use rekon_core::{Object, ObjectKey, RemoteStore, Selector};
use rekon_queue::WorkQueue;
use rekon_store::{store, Reader, Writer};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, GiveUpPolicy};
use crate::error::{ControllerError, ErrorSink, LogSink, ReconcileError};
use crate::reflector::Reflector;
use crate::translate::enqueue_changes;

/// Domain logic run for one key at a time.
///
/// `obj` is the cached state at the time the key was picked up, or `None`
/// when the object is gone (deleted, or never observed): treat that as
/// cleanup, not as an error.
#[async_trait::async_trait]
pub trait Reconciler<K: Object>: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey, obj: Option<Arc<K>>) -> Result<(), ReconcileError>;

    /// Called after a key is dropped under [`GiveUpPolicy::ReportAndNotify`].
    async fn on_give_up(&self, _key: &ObjectKey, _error: &ReconcileError) {}
}

pub struct Controller<R: RemoteStore, C> {
    config: ControllerConfig,
    remote: Arc<R>,
    selector: Selector,
    reconciler: Arc<C>,
    sink: Arc<dyn ErrorSink>,
    writer: Writer<R::Object>,
    reader: Reader<R::Object>,
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl<R, C> Controller<R, C>
where
    R: RemoteStore,
    C: Reconciler<R::Object>,
{
    pub fn new(config: ControllerConfig, remote: Arc<R>, reconciler: C) -> Self {
        let (writer, reader) = store();
        let queue = Arc::new(WorkQueue::new(config.name.clone(), Box::new(config.rate_limiter::<ObjectKey>())));
        Self {
            config,
            remote,
            selector: Selector::default(),
            reconciler: Arc::new(reconciler),
            sink: Arc::new(LogSink),
            writer,
            reader,
            queue,
        }
    }

    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Read access to the controller's cache.
    pub fn reader(&self) -> Reader<R::Object> { self.reader.clone() }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> { Arc::clone(&self.queue) }

    /// Run until `cancel` fires. Returns `SyncAborted` if cancelled before the
    /// cache ever synced (no worker has run in that case).
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let Controller { config, remote, selector, reconciler, sink, writer, reader, queue } = self;
        let name = config.name.clone();
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));

        let reflector = Reflector::new(name.clone(), remote, selector, writer, tx)
            .backoff(config.watch_backoff())
            .resync_every(config.resync_period());
        let reflector_task = tokio::spawn(reflector.run(cancel.child_token()));
        let translator_task = tokio::spawn(enqueue_changes(rx, Arc::clone(&queue)));
        info!(controller = %name, workers = config.workers, "starting controller");

        tokio::select! {
            _ = reader.wait_synced() => {}
            _ = cancel.cancelled() => {
                warn!(controller = %name, "cancelled before cache sync");
                queue.shut_down();
                join_quietly(&name, "reflector", reflector_task).await;
                join_quietly(&name, "translator", translator_task).await;
                return Err(ControllerError::SyncAborted(name));
            }
        }
        info!(controller = %name, objects = reader.len(), "cache synced, starting workers");

        let workers: Vec<_> = (0..config.workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    controller: name.clone(),
                    queue: Arc::clone(&queue),
                    reader: reader.clone(),
                    reconciler: Arc::clone(&reconciler),
                    sink: Arc::clone(&sink),
                    max_retries: config.max_retries,
                    give_up: config.give_up,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        cancel.cancelled().await;
        info!(controller = %name, in_flight = queue.in_flight(), "shutting down");
        queue.shut_down();
        for w in workers {
            join_quietly(&name, "worker", w).await;
        }
        join_quietly(&name, "reflector", reflector_task).await;
        join_quietly(&name, "translator", translator_task).await;
        info!(controller = %name, "controller stopped");
        Ok(())
    }
}

async fn join_quietly(controller: &str, task: &str, handle: tokio::task::JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(controller, task, error = %e, "task ended abnormally");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Worker<K: Object, C> {
    id: usize,
    controller: String,
    queue: Arc<WorkQueue<ObjectKey>>,
    reader: Reader<K>,
    reconciler: Arc<C>,
    sink: Arc<dyn ErrorSink>,
    max_retries: u32,
    give_up: GiveUpPolicy,
}

impl<K: Object, C: Reconciler<K>> Worker<K, C> {
    async fn run(self) {
        debug!(controller = %self.controller, worker = self.id, "worker started");
        while self.process_next_item().await {}
        debug!(controller = %self.controller, worker = self.id, "worker exiting");
    }

    /// One get/reconcile/ack round; false once the queue is shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let obj = self.reader.get(&key);
        let absent = obj.is_none();

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&key, obj))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ReconcileError::Panicked(panic_message(&*payload))));
        histogram!("reconcile_duration_seconds", started.elapsed().as_secs_f64(), "controller" => self.controller.clone());

        self.handle_outcome(&key, absent, outcome).await;
        self.queue.done(&key);
        true
    }

    async fn handle_outcome(&self, key: &ObjectKey, absent: bool, outcome: Result<(), ReconcileError>) {
        let err = match outcome {
            Ok(()) => {
                counter!("reconcile_total", 1u64, "controller" => self.controller.clone(), "result" => "ok");
                self.queue.forget(key);
                return;
            }
            Err(e) if absent && e.is_not_found() => {
                debug!(controller = %self.controller, key = %key, "already gone");
                counter!("reconcile_total", 1u64, "controller" => self.controller.clone(), "result" => "ok");
                self.queue.forget(key);
                return;
            }
            Err(e) => e,
        };
        counter!("reconcile_total", 1u64, "controller" => self.controller.clone(), "result" => "error");

        let retries = self.queue.num_requeues(key);
        if retries < self.max_retries {
            warn!(controller = %self.controller, key = %key, retries, class = ?err.class(), error = %err, "reconcile failed, requeueing");
            self.queue.add_rate_limited(key.clone());
            return;
        }

        self.queue.forget(key);
        self.sink.report(&self.controller, key, &err);
        if self.give_up == GiveUpPolicy::ReportAndNotify {
            let notified = AssertUnwindSafe(self.reconciler.on_give_up(key, &err)).catch_unwind().await;
            if let Err(payload) = notified {
                error!(controller = %self.controller, key = %key, panic = %panic_message(&*payload), "give-up hook panicked");
            }
        }
    }
}
