//! Per-process admission queue and dispatch loop for nonce locks.
//!
//! Callers line up in one FIFO queue shared by all addresses. Each dispatch attempt looks at
//! the head entry only and races the store's compare-and-set for the head's address. A win
//! pops the head and hands it a [`NonceLease`]; a loss (lock held by anyone, anywhere, or a
//! store error) leaves the queue as it is until the next trigger.
//!
//! Dispatch is triggered after every enqueue, after every commit or abort made through a
//! lease, and by the [`ChangeNotifier`](crate::notifier::ChangeNotifier) whenever the store
//! reports that some lock was freed, possibly by another process.
//!
//! # Head-of-line blocking
//!
//! The queue is not partitioned by address. While the head waits for a lock held elsewhere,
//! entries behind it wait too, even when their own addresses are free.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};

use crate::address::WalletAddress;
use crate::chain::{BaselineError, BaselineNonce};
use crate::notifier::Wake;
use crate::store::{NonceStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Baseline(#[from] BaselineError),
    /// The queue was shut down while the request was still waiting for its turn.
    #[error("Nonce request for {0} was abandoned before it got a lock")]
    Abandoned(WalletAddress),
    #[error("Nonce coordinator is shut down")]
    Closed,
    /// The held nonce is `u64::MAX`, so there is no next nonce to commit to.
    #[error("Nonce of {0} can not advance past u64::MAX")]
    NonceExhausted(WalletAddress),
}

struct QueueEntry {
    address: WalletAddress,
    resolve: oneshot::Sender<NonceLease>,
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<QueueEntry>,
    closed: bool,
}

struct Inner {
    store: Arc<dyn NonceStore>,
    queue: Mutex<Queue>,
}

/// Hands out nonces for shared wallet addresses, one holder per address at a time.
///
/// One instance per process. Clones share the same queue.
#[derive(Clone)]
pub struct LockCoordinator {
    inner: Arc<Inner>,
}

impl Debug for LockCoordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator").finish_non_exhaustive()
    }
}

impl LockCoordinator {
    pub fn new<S: NonceStore>(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<dyn NonceStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                queue: Mutex::new(Queue::default()),
            }),
        }
    }

    /// Waits for exclusive use of `address`'s nonce.
    ///
    /// Seeds the record with `baseline_nonce` if the address has never been seen; an existing
    /// record keeps its own nonce. Resolves once this request reaches the head of the queue
    /// and wins the lock. There is no timeout: bound the call externally if needed.
    pub async fn acquire(
        &self,
        address: &WalletAddress,
        baseline_nonce: u64,
    ) -> Result<NonceLease, CoordinatorError> {
        if let Err(e) = self.inner.store.ensure_exists(address, baseline_nonce).await {
            tracing::warn!(
                %address,
                baseline_nonce,
                error = %e,
                "nonce store failed to seed record; request not queued"
            );
            return Err(e.into());
        }
        let receiver = {
            let mut queue = self.inner.queue.lock().await;
            if queue.closed {
                return Err(CoordinatorError::Closed);
            }
            let (resolve, receiver) = oneshot::channel();
            queue.entries.push_back(QueueEntry {
                address: address.clone(),
                resolve,
            });
            tracing::trace!(%address, queued = queue.entries.len(), "queued nonce request");
            receiver
        };
        self.dispatch().await;
        receiver
            .await
            .map_err(|_| CoordinatorError::Abandoned(address.clone()))
    }

    /// Like [`LockCoordinator::acquire`], asking `baseline` for a seed only when the address
    /// has no record yet.
    pub async fn acquire_seeded<B>(
        &self,
        address: &WalletAddress,
        baseline: &B,
    ) -> Result<NonceLease, CoordinatorError>
    where
        B: BaselineNonce + ?Sized,
    {
        let baseline_nonce = match self.inner.store.get(address).await? {
            Some(record) => record.nonce,
            None => baseline.baseline_nonce(address).await?,
        };
        self.acquire(address, baseline_nonce).await
    }

    /// Runs one dispatch attempt on the queue head.
    ///
    /// The attempt runs on its own task, so dropping this future does not interrupt a
    /// compare-and-set that is already in flight.
    pub async fn dispatch(&self) {
        spawn_dispatch(&self.inner).await
    }

    /// Number of requests still waiting for their turn.
    pub async fn queued(&self) -> usize {
        self.inner.queue.lock().await.entries.len()
    }

    /// Stops accepting requests and abandons the ones still queued.
    ///
    /// Their `acquire` calls return [`CoordinatorError::Abandoned`]. Leases already handed
    /// out stay valid and must still be committed or aborted.
    pub async fn shutdown(&self) {
        let mut queue = self.inner.queue.lock().await;
        queue.closed = true;
        let abandoned = queue.entries.len();
        queue.entries.clear();
        if abandoned > 0 {
            tracing::warn!(abandoned, "nonce coordinator shut down with queued requests");
        }
    }
}

#[async_trait]
impl Wake for LockCoordinator {
    async fn wake(&self) {
        self.dispatch().await
    }
}

async fn spawn_dispatch(inner: &Arc<Inner>) {
    let inner = Arc::clone(inner);
    if let Err(e) = tokio::spawn(inner.dispatch_head()).await {
        tracing::error!(error = %e, "nonce dispatch task failed");
    }
}

impl Inner {
    /// The queue lock is held for the whole attempt, store call included, so attempts
    /// never overlap and two of them can not pop the same head.
    async fn dispatch_head(self: Arc<Self>) {
        let mut queue = self.queue.lock().await;
        loop {
            let Some(head) = queue.entries.front() else {
                return;
            };
            let address = head.address.clone();
            let record = match self.store.try_acquire(&address).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::debug!(
                        monotonic_counter.nonce_head_of_line_stalls = 1u64,
                        %address,
                        queued = queue.entries.len(),
                        "head-of-line stall: nonce lock held elsewhere"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        %address,
                        error = %e,
                        queued = queue.entries.len(),
                        "nonce store failed during dispatch; waiting for the next trigger"
                    );
                    return;
                }
            };
            let Some(entry) = queue.entries.pop_front() else {
                return;
            };
            tracing::debug!(
                monotonic_counter.nonce_leases = 1u64,
                %address,
                nonce = record.nonce,
                "nonce lock acquired"
            );
            let lease = NonceLease {
                inner: Arc::clone(&self),
                address,
                nonce: record.nonce,
                settled: false,
            };
            match entry.resolve.send(lease) {
                Ok(()) => return,
                Err(mut lease) => {
                    // The caller stopped waiting before it ever saw the nonce. Hand the lock
                    // back untouched and give the next entry its chance.
                    lease.settled = true;
                    tracing::debug!(address = %lease.address, nonce = lease.nonce, "nonce request dropped by caller, releasing");
                    if let Err(e) = self.store.release(&lease.address, lease.nonce).await {
                        tracing::warn!(address = %lease.address, error = %e, "failed to release unclaimed nonce lock");
                        return;
                    }
                }
            }
        }
    }
}

/// Exclusive right to use one nonce of one address.
///
/// Finish it with exactly one of [`NonceLease::commit`] (the transaction was sent, advance
/// the nonce) or [`NonceLease::abort`] (nothing was sent, hand the same nonce to the next
/// holder). Both consume the lease. A lease dropped without either keeps the address locked
/// for every process until someone releases it by hand.
pub struct NonceLease {
    inner: Arc<Inner>,
    address: WalletAddress,
    nonce: u64,
    settled: bool,
}

impl Debug for NonceLease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLease")
            .field("address", &self.address)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn address(&self) -> &WalletAddress {
        &self.address
    }

    /// Releases the lock and advances the stored nonce by one.
    ///
    /// A lease holding `u64::MAX` has nothing to advance to: the lock is released with the
    /// nonce unchanged and [`CoordinatorError::NonceExhausted`] is returned.
    pub async fn commit(mut self) -> Result<(), CoordinatorError> {
        self.settled = true;
        let Some(next_nonce) = self.nonce.checked_add(1) else {
            tracing::error!(
                address = %self.address,
                nonce = self.nonce,
                "nonce exhausted; releasing without advancing"
            );
            self.release(self.nonce).await?;
            return Err(CoordinatorError::NonceExhausted(self.address.clone()));
        };
        tracing::debug!(
            monotonic_counter.nonce_commits = 1u64,
            address = %self.address,
            nonce = self.nonce,
            "nonce committed"
        );
        Ok(self.release(next_nonce).await?)
    }

    /// Releases the lock leaving the stored nonce unchanged.
    pub async fn abort(mut self) -> Result<(), CoordinatorError> {
        self.settled = true;
        tracing::debug!(
            monotonic_counter.nonce_aborts = 1u64,
            address = %self.address,
            nonce = self.nonce,
            "nonce aborted"
        );
        Ok(self.release(self.nonce).await?)
    }

    async fn release(&self, next_nonce: u64) -> Result<(), StoreError> {
        let result = self.inner.store.release(&self.address, next_nonce).await;
        if let Err(e) = &result {
            tracing::warn!(address = %self.address, next_nonce, error = %e, "failed to release nonce lock");
        }
        spawn_dispatch(&self.inner).await;
        result
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                address = %self.address,
                nonce = self.nonce,
                "nonce lease dropped without commit or abort; the address stays locked"
            );
        }
    }
}
