//! Background task that keeps the [`CacheManager`] in step with the store.
//!
//! On start it subscribes to the change feed, then does a full load. Every change
//! event triggers another full load; events that pile up while a load is running
//! are folded into one. Any failure drops the subscription and retries after a
//! backoff, forever, until shutdown.

mod state;

pub use state::{BackoffPolicy, SubscriberState, Transition};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheManager;
use crate::error::RefreshError;
use crate::store::{ChangeFeed, ChangeStream, FlagLoader};

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriberConfig {
    pub backoff: BackoffPolicy,
}

/// Counters for logging and health reporting.
#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    events_coalesced: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    restarts: AtomicU64,
}

/// Point-in-time copy of the subscriber counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub events_received: u64,
    pub events_coalesced: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub restarts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Startup,
    ChangeFeed,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Startup => "startup",
            Trigger::ChangeFeed => "change_feed",
            Trigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

enum ListenExit {
    Shutdown,
    Failed,
}

/// Subscribes to a [`ChangeFeed`] and refreshes a [`CacheManager`] from a [`FlagLoader`].
pub struct ChangeFeedSubscriber {
    cache: Arc<CacheManager>,
    loader: Arc<dyn FlagLoader>,
    feed: Arc<dyn ChangeFeed>,
    config: SubscriberConfig,
}

impl ChangeFeedSubscriber {
    pub fn new(
        cache: Arc<CacheManager>,
        loader: Arc<dyn FlagLoader>,
        feed: Arc<dyn ChangeFeed>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            cache,
            loader,
            feed,
            config,
        }
    }

    /// Starts the background task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> SubscriberHandle {
        // Published before the task runs, so waiters never see the pre-start `Stopped`.
        let (state_tx, state_rx) = watch::channel(SubscriberState::Stopped.on(Transition::Start));
        let force_refresh = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let runner = Runner {
            cache: self.cache,
            loader: self.loader,
            feed: self.feed,
            backoff: self.config.backoff,
            state_tx,
            force_refresh: Arc::clone(&force_refresh),
            shutdown: shutdown.clone(),
            counters: Arc::clone(&counters),
        };

        let task = tokio::spawn(runner.run());

        SubscriberHandle {
            control: SubscriberControl {
                state_rx,
                force_refresh,
                counters,
            },
            shutdown,
            task: Some(task),
        }
    }
}

/// Cloneable view of a running subscriber: state, stats and the manual refresh trigger.
#[derive(Debug, Clone)]
pub struct SubscriberControl {
    state_rx: watch::Receiver<SubscriberState>,
    force_refresh: Arc<Notify>,
    counters: Arc<Counters>,
}

impl SubscriberControl {
    pub fn state(&self) -> SubscriberState {
        *self.state_rx.borrow()
    }

    /// Asks for a full reload outside the change feed.
    ///
    /// Requests made while a reload is already running collapse into one more reload.
    /// During backoff this cuts the wait short.
    pub fn force_refresh(&self) {
        self.force_refresh.notify_one();
    }

    /// Waits until the subscriber is listening, i.e. a load has succeeded.
    /// Returns `false` if the subscriber stopped first.
    pub async fn wait_until_listening(&self) -> bool {
        let mut rx = self.state_rx.clone();
        let listening = match rx
            .wait_for(|state| matches!(state, SubscriberState::Listening | SubscriberState::Stopped))
            .await
        {
            Ok(state) => *state == SubscriberState::Listening,
            Err(_) => false,
        };
        listening
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            events_received: self.counters.events_received.load(Ordering::SeqCst),
            events_coalesced: self.counters.events_coalesced.load(Ordering::SeqCst),
            refreshes: self.counters.refreshes.load(Ordering::SeqCst),
            refresh_failures: self.counters.refresh_failures.load(Ordering::SeqCst),
            restarts: self.counters.restarts.load(Ordering::SeqCst),
        }
    }
}

/// Owns the background task. Dropping it cancels the task; [`shutdown`](Self::shutdown) also waits for it.
#[derive(Debug)]
pub struct SubscriberHandle {
    control: SubscriberControl,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriberHandle {
    pub fn control(&self) -> SubscriberControl {
        self.control.clone()
    }

    pub fn state(&self) -> SubscriberState {
        self.control.state()
    }

    pub fn force_refresh(&self) {
        self.control.force_refresh();
    }

    pub async fn wait_until_listening(&self) -> bool {
        self.control.wait_until_listening().await
    }

    pub fn stats(&self) -> SubscriberStats {
        self.control.stats()
    }

    /// Stops the task and drops its feed subscription.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Subscriber task ended abnormally");
            }
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Runner {
    cache: Arc<CacheManager>,
    loader: Arc<dyn FlagLoader>,
    feed: Arc<dyn ChangeFeed>,
    backoff: BackoffPolicy,
    state_tx: watch::Sender<SubscriberState>,
    force_refresh: Arc<Notify>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl Runner {
    async fn run(self) {
        let mut state = *self.state_tx.borrow();
        let mut attempt: u32 = 0;

        loop {
            state = match state {
                SubscriberState::Starting => {
                    let session = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        session = self.start_session() => session,
                    };

                    let Some(stream) = session else {
                        attempt += 1;
                        state = self.advance(state, Transition::Failed);
                        continue;
                    };

                    attempt = 0;
                    let listening = self.advance(state, Transition::Ready);
                    match self.listen(stream).await {
                        ListenExit::Shutdown => {
                            state = listening;
                            break;
                        }
                        ListenExit::Failed => {
                            attempt += 1;
                            self.advance(listening, Transition::Failed)
                        }
                    }
                }
                SubscriberState::Backoff => {
                    let delay = self.backoff.delay(attempt);
                    self.counters.restarts.fetch_add(1, Ordering::SeqCst);
                    warn!(delay_ms = delay.as_millis() as u64, attempt, "Restarting change feed subscription");

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.force_refresh.notified() => {
                            info!("Manual refresh requested, retrying immediately");
                        }
                    }
                    self.advance(state, Transition::Retry)
                }
                SubscriberState::Listening | SubscriberState::Stopped => break,
            };
        }

        self.advance(state, Transition::Stop);
        info!("Change feed subscriber stopped");
    }

    /// Subscribes, then loads. Subscribing first means a change committed during the
    /// load still produces an event afterwards.
    async fn start_session(&self) -> Option<ChangeStream> {
        let stream = match self.feed.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Change feed subscription failed");
                return None;
            }
        };

        if self.refresh(Trigger::Startup).await.is_err() {
            return None;
        }

        info!("Change feed subscriber listening");
        Some(stream)
    }

    async fn listen(&self, mut stream: ChangeStream) -> ListenExit {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return ListenExit::Shutdown,

                _ = self.force_refresh.notified() => {
                    info!("Manual refresh requested");
                    if let Some(exit) = self.refresh_until_shutdown(Trigger::Manual).await {
                        return exit;
                    }
                }

                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => {
                            self.counters.events_received.fetch_add(1, Ordering::SeqCst);
                            debug!(payload = ?event.payload, "Flag change notification");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Change feed failed");
                            return ListenExit::Failed;
                        }
                        None => {
                            warn!("Change feed ended");
                            return ListenExit::Failed;
                        }
                    }

                    let feed_broken = self.drain_ready(&mut stream);

                    if let Some(exit) = self.refresh_until_shutdown(Trigger::ChangeFeed).await {
                        return exit;
                    }
                    if feed_broken {
                        return ListenExit::Failed;
                    }
                }
            }
        }
    }

    /// Consumes every event already waiting on the stream so one reload covers the burst.
    /// Returns `true` if the stream failed or ended while draining.
    fn drain_ready(&self, stream: &mut ChangeStream) -> bool {
        let mut coalesced = 0u64;
        let broken = loop {
            match stream.next().now_or_never() {
                Some(Some(Ok(_))) => coalesced += 1,
                Some(Some(Err(e))) => {
                    warn!(error = %e, "Change feed failed");
                    break true;
                }
                Some(None) => {
                    warn!("Change feed ended");
                    break true;
                }
                None => break false,
            }
        };

        if coalesced > 0 {
            self.counters.events_received.fetch_add(coalesced, Ordering::SeqCst);
            self.counters.events_coalesced.fetch_add(coalesced, Ordering::SeqCst);
            debug!(coalesced, "Coalesced flag change notifications");
        }

        broken
    }

    /// Refreshes unless shutdown comes first. `None` means keep listening.
    async fn refresh_until_shutdown(&self, trigger: Trigger) -> Option<ListenExit> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Some(ListenExit::Shutdown),
            result = self.refresh(trigger) => result.err().map(|_| ListenExit::Failed),
        }
    }

    async fn refresh(&self, trigger: Trigger) -> Result<(), RefreshError> {
        match self.cache.refresh_from_store(self.loader.as_ref()).await {
            Ok(outcome) => {
                self.counters.refreshes.fetch_add(1, Ordering::SeqCst);
                debug!(%trigger, generation = outcome.generation, installed = outcome.installed, "Refresh complete");
                Ok(())
            }
            Err(e) => {
                self.counters.refresh_failures.fetch_add(1, Ordering::SeqCst);
                error!(%trigger, error = %e, "Refresh failed");
                Err(e)
            }
        }
    }

    fn advance(&self, from: SubscriberState, transition: Transition) -> SubscriberState {
        let to = from.on(transition);
        if to != from {
            debug!(from = %from, to = %to, "Subscriber state change");
        }
        self.state_tx.send_replace(to);
        to
    }
}
