//! Cancellable live subscriptions.
//!
//! A [`Subscription`] is fed by a spawned pump task that owns the store feed,
//! projects every snapshot into a typed value and forwards it over a bounded
//! channel. When the feed fails with `Unavailable` the pump resubscribes with
//! exponential backoff and tells the consumer it is reconnecting.
//!
//! Cancellation is checked on the consumer side after every receive, so a
//! value that was already queued when `cancel` ran is dropped, not returned.

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::StoreError;
use crate::store::{Document, Query, Store};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent<T> {
    Snapshot(T),
    /// The feed dropped; the pump will retry after `retry_in`
    Reconnecting { attempt: u32, retry_in: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveOptions {
    pub capacity: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for LiveOptions {
    fn default() -> Self {
        LiveOptions {
            capacity: 100,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Turns the raw result set of a live query into what the consumer sees.
pub trait Projection: Send + 'static {
    type Output: Send + 'static;

    /// `Ok(None)` means nothing changed for the consumer and skips the emission.
    fn project(&mut self, docs: &[Document]) -> Result<Option<Self::Output>, StoreError>;

    /// Re-run `project` on the last result set this often, even without new
    /// store writes. Used for time-dependent views.
    fn refresh_interval(&self) -> Option<Duration> {
        None
    }
}

/// Projection from a plain decoding function; emits on every snapshot.
pub struct Mapped<F, T> {
    decode: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> Mapped<F, T>
where
    F: FnMut(&[Document]) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    pub fn new(decode: F) -> Self {
        Mapped {
            decode,
            _output: PhantomData,
        }
    }
}

impl<F, T> Projection for Mapped<F, T>
where
    F: FnMut(&[Document]) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn project(&mut self, docs: &[Document]) -> Result<Option<T>, StoreError> {
        (self.decode)(docs).map(Some)
    }
}

/// Shared cancellation state of one subscription
#[derive(Debug, Clone)]
pub struct CancelHandle {
    active: Arc<AtomicBool>,
    task: Arc<Mutex<Option<AbortHandle>>>,
    label: Arc<str>,
}

impl CancelHandle {
    fn new(label: &str) -> Self {
        CancelHandle {
            active: Arc::new(AtomicBool::new(true)),
            task: Arc::new(Mutex::new(None)),
            label: Arc::from(label),
        }
    }

    fn attach(&self, task: AbortHandle) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_active() {
            *slot = Some(task);
        } else {
            task.abort();
        }
    }

    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!("Cancelled subscription {}", self.label);
        }
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A standing query that pushes values until cancelled.
pub struct Subscription<T> {
    rx: mpsc::Receiver<SyncEvent<T>>,
    handle: CancelHandle,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the subscription is cancelled or its pump
    /// has stopped.
    pub async fn next(&mut self) -> Option<SyncEvent<T>> {
        if !self.handle.is_active() {
            return None;
        }
        let event = self.rx.recv().await?;
        if !self.handle.is_active() {
            debug!("Discarding late notification for {}", self.handle.label());
            return None;
        }
        Some(event)
    }

    /// Next snapshot, skipping reconnect notices.
    pub async fn next_snapshot(&mut self) -> Option<T> {
        loop {
            match self.next().await? {
                SyncEvent::Snapshot(value) => return Some(value),
                SyncEvent::Reconnecting { attempt, .. } => {
                    debug!("{} reconnecting (attempt {})", self.handle.label(), attempt);
                }
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<SyncEvent<T>> {
        if !self.handle.is_active() {
            return None;
        }
        match self.rx.try_recv() {
            Ok(event) if self.handle.is_active() => Some(event),
            _ => None,
        }
    }

    /// Stop the pump and drop anything already queued.
    pub fn cancel(&mut self) {
        self.handle.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn label(&self) -> &str {
        self.handle.label()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Cancel handles of every subscription opened under one session
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    handles: Mutex<Vec<CancelHandle>>,
}

impl SubscriptionRegistry {
    pub fn register(&self, handle: CancelHandle) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(CancelHandle::is_active);
        handles.push(handle);
    }

    /// Cancel everything; returns how many were still live.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<CancelHandle> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut cancelled = 0;
        for handle in handles {
            if handle.is_active() {
                handle.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.is_active())
            .count()
    }
}

/// Exponential backoff with jitter: `base * 2^(attempt-1)` plus up to half
/// a base, capped at `backoff_max`.
pub fn backoff_delay(options: &LiveOptions, attempt: u32) -> Duration {
    let base = options.backoff_base.as_millis() as u64;
    let exponent = attempt.saturating_sub(1).min(16);
    let jitter = if base >= 2 {
        rand::random::<u64>() % (base / 2)
    } else {
        0
    };
    let delay = base.saturating_mul(1u64 << exponent).saturating_add(jitter);
    Duration::from_millis(delay).min(options.backoff_max)
}

/// Start a pump for `query` and return the consumer end.
pub fn spawn_live<P: Projection>(
    store: Arc<dyn Store>,
    query: Query,
    projection: P,
    options: LiveOptions,
    label: &str,
) -> Subscription<P::Output> {
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    let handle = CancelHandle::new(label);
    let task = tokio::spawn(pump(store, query, projection, options, tx, handle.clone()));
    handle.attach(task.abort_handle());
    Subscription { rx, handle }
}

async fn pump<P: Projection>(
    store: Arc<dyn Store>,
    query: Query,
    mut projection: P,
    options: LiveOptions,
    tx: mpsc::Sender<SyncEvent<P::Output>>,
    handle: CancelHandle,
) {
    let mut attempt: u32 = 0;
    let mut last_docs: Option<Vec<Document>> = None;

    loop {
        if !handle.is_active() {
            return;
        }

        match store.subscribe(query.clone()).await {
            Ok(mut feed) => {
                if attempt > 0 {
                    info!("Subscription {} re-established after {} attempts", handle.label(), attempt);
                }
                attempt = 0;
                let mut ticker = projection.refresh_interval().map(|every| {
                    let mut interval = tokio::time::interval(every);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    interval
                });

                loop {
                    tokio::select! {
                        item = feed.next() => match item {
                            Some(Ok(docs)) => {
                                let keep_going = emit(&mut projection, &docs, &tx, &handle).await;
                                last_docs = Some(docs);
                                if !keep_going {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!("Subscription {} lost its feed: {}", handle.label(), e);
                                break;
                            }
                            None => {
                                warn!("Subscription {} feed closed by the store", handle.label());
                                break;
                            }
                        },
                        _ = tick(&mut ticker) => {
                            if let Some(docs) = &last_docs {
                                if !emit(&mut projection, docs, &tx, &handle).await {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            Err(StoreError::Unavailable(reason)) => {
                warn!("Could not open subscription {}: {}", handle.label(), reason);
            }
            Err(e) => {
                error!("Subscription {} failed permanently: {}", handle.label(), e);
                return;
            }
        }

        attempt += 1;
        let delay = backoff_delay(&options, attempt);
        info!("Resubscribing {} in {:?} (attempt {})", handle.label(), delay, attempt);
        if tx
            .send(SyncEvent::Reconnecting {
                attempt,
                retry_in: delay,
            })
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// Returns false when the consumer is gone and the pump should stop.
async fn emit<P: Projection>(
    projection: &mut P,
    docs: &[Document],
    tx: &mpsc::Sender<SyncEvent<P::Output>>,
    handle: &CancelHandle,
) -> bool {
    match projection.project(docs) {
        Ok(Some(value)) => {
            if !handle.is_active() {
                return false;
            }
            tx.send(SyncEvent::Snapshot(value)).await.is_ok()
        }
        Ok(None) => true,
        Err(e) => {
            error!("Dropping malformed snapshot for {}: {}", handle.label(), e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocPath, Fields, MemoryStore};

    fn count_docs() -> Mapped<impl FnMut(&[Document]) -> Result<usize, StoreError> + Send + 'static, usize> {
        Mapped::new(|docs: &[Document]| Ok(docs.len()))
    }

    #[tokio::test]
    async fn test_cancel_discards_queued_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let mut sub = spawn_live(
            store.clone(),
            Query::collection("things"),
            count_docs(),
            LiveOptions::default(),
            "things",
        );
        assert_eq!(sub.next_snapshot().await, Some(0));

        store.put(&DocPath::new("things", "a"), Fields::new()).await.unwrap();
        // Give the pump time to queue the new snapshot
        tokio::time::sleep(Duration::from_millis(50)).await;

        sub.cancel();
        assert!(!sub.is_active());
        assert!(sub.next().await.is_none());
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_registry_cancels_everything() {
        let store = Arc::new(MemoryStore::new());
        let registry = SubscriptionRegistry::default();
        let mut first = spawn_live(store.clone(), Query::collection("a"), count_docs(), LiveOptions::default(), "a");
        let second = spawn_live(store.clone(), Query::collection("b"), count_docs(), LiveOptions::default(), "b");
        registry.register(first.cancel_handle());
        registry.register(second.cancel_handle());
        assert_eq!(registry.active(), 2);

        assert_eq!(registry.cancel_all(), 2);
        assert!(!second.is_active());
        assert!(first.next().await.is_none());
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let options = LiveOptions {
            capacity: 1,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1000),
        };
        let first = backoff_delay(&options, 1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150));
        let third = backoff_delay(&options, 3);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(450));
        assert_eq!(backoff_delay(&options, 12), Duration::from_millis(1000));
    }
}
