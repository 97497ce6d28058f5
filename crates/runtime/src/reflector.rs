//! List+watch loop keeping a [`Writer`] in step with a [`RemoteStore`].
//!
//! Each cycle lists a full snapshot, replaces the cache with it (emitting the
//! diff), then watches from the listed version, applying deltas one by one.
//! Any end of the watch leads back to a fresh list; transport failures wait
//! out an exponential backoff first, and so do immediate relists once several
//! in a row produced no delta.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use rekon_core::{ChangeEvent, RemoteError, RemoteStore, Selector};
use rekon_queue::ExponentialBackoff;
use rekon_store::Writer;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Obj<R> = <R as RemoteStore>::Object;

/// Back-to-back relists allowed without a delta before backing off.
const MAX_IMMEDIATE_RELISTS: u32 = 3;

enum Flow {
    /// List again right away.
    Relist,
    /// List again after the backoff delay.
    Retry(RemoteError),
    Stop,
}

pub struct Reflector<R: RemoteStore> {
    name: String,
    remote: Arc<R>,
    selector: Selector,
    writer: Writer<Obj<R>>,
    events: mpsc::Sender<ChangeEvent<Obj<R>>>,
    backoff: ExponentialBackoff,
    resync: Option<Duration>,
    /// Relists since the last watch that delivered anything.
    relist_streak: u32,
}

impl<R: RemoteStore> Reflector<R> {
    pub fn new(
        name: impl Into<String>,
        remote: Arc<R>,
        selector: Selector,
        writer: Writer<Obj<R>>,
        events: mpsc::Sender<ChangeEvent<Obj<R>>>,
    ) -> Self {
        Self {
            name: name.into(),
            remote,
            selector,
            writer,
            events,
            backoff: ExponentialBackoff::new(Duration::from_millis(800), Duration::from_secs(30)),
            resync: None,
            relist_streak: 0,
        }
    }

    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Re-emit every cached object as an update each `period`.
    pub fn resync_every(mut self, period: Option<Duration>) -> Self {
        self.resync = period.filter(|p| !p.is_zero());
        self
    }

    /// Run until `cancel` fires or the event receiver is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(reflector = %self.name, ns = ?self.selector.namespace, "reflector started");
        loop {
            match self.list_and_watch(&cancel).await {
                Flow::Stop => break,
                Flow::Relist => {
                    counter!("reflector_relists_total", 1u64, "reflector" => self.name.clone());
                    self.relist_streak = self.relist_streak.saturating_add(1);
                    if self.relist_streak > MAX_IMMEDIATE_RELISTS {
                        let delay = self.backoff.next_delay();
                        warn!(reflector = %self.name, streak = self.relist_streak, ?delay, "watch keeps ending without deltas, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Flow::Retry(err) => {
                    let delay = self.backoff.next_delay();
                    counter!("reflector_errors_total", 1u64, "reflector" => self.name.clone());
                    warn!(reflector = %self.name, error = %err, ?delay, attempt = self.backoff.attempts(), "list/watch failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(reflector = %self.name, "reflector stopped");
    }

    async fn list_and_watch(&mut self, cancel: &CancellationToken) -> Flow {
        let listed = tokio::select! {
            _ = cancel.cancelled() => return Flow::Stop,
            r = self.remote.list(&self.selector) => r,
        };
        let list = match listed {
            Ok(list) => list,
            Err(e) => return Flow::Retry(e),
        };
        let mut rv = list.resource_version.clone();
        debug!(reflector = %self.name, rv = %rv, count = list.items.len(), "listed");
        for ev in self.writer.replace(list.items, list.resource_version) {
            if !self.emit(ev, cancel).await {
                return Flow::Stop;
            }
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Flow::Stop,
            r = self.remote.watch(&self.selector, &rv) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_too_old() => return Flow::Relist,
            Err(e) => return Flow::Retry(e),
        };
        self.writer.mark_synced();
        if self.relist_streak == 0 {
            self.backoff.reset();
        }

        let mut resync = self.resync.map(|p| {
            let mut i = interval_at(Instant::now() + p, p);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Flow::Stop,
                _ = tick(&mut resync) => {
                    if !self.resync_all(cancel).await {
                        return Flow::Stop;
                    }
                    continue;
                }
                item = stream.next() => item,
            };
            match item {
                None => {
                    debug!(reflector = %self.name, rv = %rv, "watch closed, relisting");
                    return Flow::Relist;
                }
                Some(Ok(delta)) => {
                    if self.relist_streak > 0 {
                        self.relist_streak = 0;
                        self.backoff.reset();
                    }
                    if let Some(v) = delta.resource_version() {
                        rv = v;
                    }
                    match self.writer.apply(delta) {
                        Ok(Some(ev)) => {
                            if !self.emit(ev, cancel).await {
                                return Flow::Stop;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            counter!("reflector_malformed_deltas_total", 1u64, "reflector" => self.name.clone());
                            warn!(reflector = %self.name, error = %e, "skipping malformed delta");
                        }
                    }
                }
                Some(Err(e)) if e.is_too_old() => {
                    info!(reflector = %self.name, rv = %rv, error = %e, "resource version expired, relisting");
                    return Flow::Relist;
                }
                Some(Err(RemoteError::Decode(msg))) => {
                    counter!("reflector_malformed_deltas_total", 1u64, "reflector" => self.name.clone());
                    warn!(reflector = %self.name, error = %msg, "skipping undecodable delta");
                }
                Some(Err(e)) => return Flow::Retry(e),
            }
        }
    }

    async fn resync_all(&self, cancel: &CancellationToken) -> bool {
        let objects = self.writer.reader().list();
        debug!(reflector = %self.name, count = objects.len(), "periodic resync");
        for obj in objects {
            let ev = ChangeEvent::Updated { old: Arc::clone(&obj), new: obj };
            if !self.emit(ev, cancel).await {
                return false;
            }
        }
        true
    }

    /// False once the reflector should stop.
    async fn emit(&self, ev: ChangeEvent<Obj<R>>, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.events.send(ev) => {
                if sent.is_err() {
                    info!(reflector = %self.name, "event receiver gone");
                }
                sent.is_ok()
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

