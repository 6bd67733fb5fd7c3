//! In-process store, for embedding and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use super::{ChangeEvent, ChangeFeed, ChangeStream, FlagLoader};
use crate::error::{FeedError, LoadError};
use crate::flags::FlagDefinition;

type FeedSender = mpsc::UnboundedSender<Result<ChangeEvent, FeedError>>;

/// Keeps flags in memory and fans change events out to every open subscription.
///
/// Failure injection (`fail_next_loads`, `fail_subscriptions`, `disconnect_all`) lets
/// callers exercise the recovery paths without a real database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    flags: Mutex<Vec<FlagDefinition>>,
    subscribers: Mutex<Vec<FeedSender>>,
    load_delay: Mutex<Option<Duration>>,
    failing_loads: AtomicUsize,
    reject_subscriptions: AtomicBool,
    loads: AtomicU64,
    subscriptions: AtomicU64,
}

impl MemoryStore {
    pub fn new(flags: Vec<FlagDefinition>) -> Self {
        Self {
            flags: Mutex::new(flags),
            ..Default::default()
        }
    }

    /// Replaces the stored flags and notifies subscribers.
    pub fn set_flags(&self, flags: Vec<FlagDefinition>) {
        *lock(&self.flags) = flags;
        self.notify();
    }

    /// Replaces the stored flags without telling anyone, like a lost notification.
    pub fn set_flags_quietly(&self, flags: Vec<FlagDefinition>) {
        *lock(&self.flags) = flags;
    }

    /// Inserts or replaces a flag by name and notifies subscribers.
    pub fn upsert(&self, flag: FlagDefinition) {
        {
            let mut flags = lock(&self.flags);
            flags.retain(|existing| existing.name != flag.name);
            flags.push(flag);
        }
        self.notify();
    }

    /// Sends one change event to every live subscription.
    pub fn notify(&self) {
        lock(&self.subscribers).retain(|tx| {
            tx.unbounded_send(Ok(ChangeEvent::default())).is_ok()
        });
    }

    /// Fails every subscription with a connection error and forgets them.
    pub fn disconnect_all(&self, reason: &str) {
        for tx in lock(&self.subscribers).drain(..) {
            let _ = tx.unbounded_send(Err(FeedError::ConnectionLost(reason.to_string())));
        }
    }

    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        self.reject_subscriptions.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *lock(&self.load_delay) = delay;
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Subscriptions whose receiving end is still alive.
    pub fn live_subscribers(&self) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

#[async_trait]
impl FlagLoader for MemoryStore {
    async fn load_active_flags(&self) -> Result<Vec<FlagDefinition>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.load_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(LoadError::Unavailable("injected load failure".to_string()));
        }

        Ok(lock(&self.flags)
            .iter()
            .filter(|flag| flag.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self) -> Result<ChangeStream, FeedError> {
        if self.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(FeedError::Subscribe("injected subscribe failure".to_string()));
        }

        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded();
        lock(&self.subscribers).push(tx);
        Ok(rx.boxed())
    }
}

// A poisoned lock only means a panicking test thread; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_filters_inactive_flags() {
        let store = MemoryStore::new(vec![
            FlagDefinition::new("live"),
            FlagDefinition::new("gone").active(false),
        ]);

        let flags = store.load_active_flags().await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].name, "live");
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new(vec![]);
        store.fail_next_loads(2);

        assert!(store.load_active_flags().await.is_err());
        assert!(store.load_active_flags().await.is_err());
        assert!(store.load_active_flags().await.is_ok());
    }

    #[tokio::test]
    async fn test_feed_delivers_and_disconnects() {
        let store = MemoryStore::new(vec![]);
        let mut stream = store.subscribe().await.unwrap();

        store.upsert(FlagDefinition::new("a"));
        assert!(matches!(stream.next().await, Some(Ok(_))));

        store.disconnect_all("network down");
        assert!(matches!(
            stream.next().await,
            Some(Err(FeedError::ConnectionLost(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let store = MemoryStore::new(vec![]);
        let stream = store.subscribe().await.unwrap();
        assert_eq!(store.live_subscribers(), 1);

        drop(stream);
        assert_eq!(store.live_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_rejected_subscription() {
        let store = MemoryStore::new(vec![]);
        store.fail_subscriptions(true);
        assert!(store.subscribe().await.is_err());
        assert_eq!(store.subscription_count(), 0);
    }
}
