//! Cross-process wake-ups for the dispatch loop.
//!
//! A lock released by another process never passes through this process's coordinator, so
//! its queue would not learn that the head may now proceed. The [`ChangeNotifier`] keeps a
//! subscription to an [`UnlockFeed`] and turns each event into a [`Wake::wake`] call. It
//! ignores which address was freed; the coordinator simply retries its current head.
//!
//! The transport is whatever implements [`UnlockFeed`]: the store's own change stream
//! ([`MemoryNonceStore`](crate::store::MemoryNonceStore), Redis pub/sub) or a
//! [`PollingFeed`] that ticks at a fixed interval.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::store::{StoreError, UnlockEvent, UnlockFeed, UnlockStream};

/// Something that wants to hear about freed locks.
#[async_trait]
pub trait Wake: Send + Sync + 'static {
    async fn wake(&self);
}

/// Background task relaying unlock events to a [`Wake`] target.
///
/// If the subscription fails or the feed ends, the failure is logged and the task
/// subscribes again after `resubscribe_delay`. In-process triggers keep working meanwhile;
/// only wake-ups from other processes are lost until the subscription is back.
pub struct ChangeNotifier {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl ChangeNotifier {
    /// Starts relaying. The task runs until `cancellation_token` fires or [`ChangeNotifier::shutdown`].
    pub fn spawn<F, W>(
        feed: F,
        target: W,
        resubscribe_delay: Duration,
        cancellation_token: CancellationToken,
    ) -> Self
    where
        F: UnlockFeed,
        W: Wake,
    {
        let task_tracker = TaskTracker::new();
        let token = cancellation_token.clone();
        task_tracker.spawn(relay(feed, target, resubscribe_delay, token));
        task_tracker.close();
        Self {
            task_tracker,
            cancellation_token,
        }
    }

    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        self.task_tracker.wait().await;
    }

    /// Waits for the relay task to finish after its cancellation token fired.
    pub async fn stopped(&self) {
        self.task_tracker.wait().await;
    }
}

async fn relay<F: UnlockFeed, W: Wake>(
    feed: F,
    target: W,
    resubscribe_delay: Duration,
    token: CancellationToken,
) {
    loop {
        let subscription = tokio::select! {
            _ = token.cancelled() => return,
            subscription = feed.subscribe() => subscription,
        };
        match subscription {
            Ok(events) => {
                tracing::info!("subscribed to nonce unlock feed");
                // Unlocks that happened while we were not subscribed are gone; retry once.
                target.wake().await;
                if let Err(e) = forward(events, &target, &token).await {
                    tracing::warn!(error = %e, "nonce unlock feed failed");
                } else if token.is_cancelled() {
                    return;
                } else {
                    tracing::warn!("nonce unlock feed ended");
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to subscribe to nonce unlock feed; cross-process wake-ups are paused"
                );
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(resubscribe_delay) => {}
        }
    }
}

/// Relays events until the stream ends, fails, or the token fires.
async fn forward<W: Wake>(
    mut events: UnlockStream,
    target: &W,
    token: &CancellationToken,
) -> Result<(), StoreError> {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                tracing::trace!(address = ?event.address, "nonce lock released");
                target.wake().await;
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

/// Feed that emits an anonymous [`UnlockEvent`] every `interval`.
///
/// Works with any store, and keeps a queue moving after a transient store error even when no
/// other trigger arrives, at the cost of a store round trip per tick.
#[derive(Debug, Clone, Copy)]
pub struct PollingFeed {
    interval: Duration,
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl PollingFeed {
    /// Intervals below one millisecond are raised to one millisecond.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }
}

#[async_trait]
impl UnlockFeed for PollingFeed {
    async fn subscribe(&self) -> Result<UnlockStream, StoreError> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        interval.reset();
        let ticks = stream::unfold(interval, |mut interval| async move {
            interval.tick().await;
            Some((Ok(UnlockEvent { address: None }), interval))
        });
        Ok(ticks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::WalletAddress;
    use crate::store::{MemoryNonceStore, NonceStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const LONG: Duration = Duration::from_secs(5);

    struct ChannelWake(mpsc::UnboundedSender<()>);

    #[async_trait]
    impl Wake for ChannelWake {
        async fn wake(&self) {
            let _ = self.0.send(());
        }
    }

    async fn next_wake(receiver: &mut mpsc::UnboundedReceiver<()>) {
        tokio::time::timeout(LONG, receiver.recv())
            .await
            .expect("no wake-up received")
            .expect("wake channel closed");
    }

    #[tokio::test]
    async fn store_unlock_wakes_target() {
        let store = MemoryNonceStore::new();
        let address: WalletAddress = "0x1111111111111111111111111111111111111111".parse().unwrap();
        store.ensure_exists(&address, 0).await.unwrap();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let notifier = ChangeNotifier::spawn(
            store.clone(),
            ChannelWake(sender),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        // Initial wake after subscribing.
        next_wake(&mut receiver).await;

        store.try_acquire(&address).await.unwrap().unwrap();
        store.release(&address, 1).await.unwrap();
        next_wake(&mut receiver).await;

        notifier.shutdown().await;
    }

    /// Fails the first `failures` subscriptions, then delegates to a memory store.
    struct FlakyFeed {
        store: MemoryNonceStore,
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl UnlockFeed for FlakyFeed {
        async fn subscribe(&self) -> Result<UnlockStream, StoreError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Backend("change stream unavailable".to_string()));
            }
            self.store.subscribe().await
        }
    }

    #[tokio::test]
    async fn resubscribes_after_failure() {
        let store = MemoryNonceStore::new();
        let address: WalletAddress = "0x1111111111111111111111111111111111111111".parse().unwrap();
        store.ensure_exists(&address, 0).await.unwrap();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let notifier = ChangeNotifier::spawn(
            FlakyFeed {
                store: store.clone(),
                failures: 2,
                attempts: AtomicUsize::new(0),
            },
            ChannelWake(sender),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        // The subscribe wake only comes once the third attempt succeeds.
        next_wake(&mut receiver).await;

        store.try_acquire(&address).await.unwrap().unwrap();
        store.release(&address, 1).await.unwrap();
        next_wake(&mut receiver).await;

        notifier.shutdown().await;
    }

    #[tokio::test]
    async fn polling_feed_ticks() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let notifier = ChangeNotifier::spawn(
            PollingFeed::new(Duration::from_millis(20)),
            ChannelWake(sender),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        for _ in 0..3 {
            next_wake(&mut receiver).await;
        }
        notifier.shutdown().await;
    }

    #[tokio::test]
    async fn zero_polling_interval_still_ticks() {
        let mut ticks = PollingFeed::new(Duration::ZERO).subscribe().await.unwrap();
        let tick = tokio::time::timeout(LONG, ticks.next())
            .await
            .expect("no tick received")
            .expect("tick stream ended")
            .unwrap();
        assert_eq!(tick.address, None);
    }

    #[tokio::test]
    async fn cancellation_stops_the_relay() {
        let store = MemoryNonceStore::new();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let notifier = ChangeNotifier::spawn(
            store.clone(),
            ChannelWake(sender),
            Duration::from_millis(10),
            token.clone(),
        );
        next_wake(&mut receiver).await;
        token.cancel();
        tokio::time::timeout(LONG, notifier.stopped())
            .await
            .expect("relay did not stop");
        // The relay owned the only sender.
        assert!(receiver.recv().await.is_none());
    }
}
