use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::address::WalletAddress;
use crate::store::{NonceRecord, NonceStore, StoreError, UnlockEvent, UnlockFeed, UnlockStream};
use crate::timestamp::UnixTimestamp;

const UNLOCK_FEED_CAPACITY: usize = 256;

/// Nonce store kept in process memory.
///
/// Cloning yields another handle to the same records and the same unlock feed.
/// Nothing survives a restart, so this backend suits tests and single-host deployments.
#[derive(Debug, Clone)]
pub struct MemoryNonceStore {
    records: Arc<DashMap<WalletAddress, NonceRecord>>,
    unlocked: broadcast::Sender<WalletAddress>,
}

impl Default for MemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        let (unlocked, _) = broadcast::channel(UNLOCK_FEED_CAPACITY);
        Self {
            records: Arc::new(DashMap::new()),
            unlocked,
        }
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn ensure_exists(
        &self,
        address: &WalletAddress,
        baseline_nonce: u64,
    ) -> Result<(), StoreError> {
        self.records
            .entry(address.clone())
            .or_insert_with(|| NonceRecord::new(address.clone(), baseline_nonce));
        Ok(())
    }

    async fn try_acquire(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<NonceRecord>, StoreError> {
        // The shard lock held by `get_mut` makes check-and-set one step.
        match self.records.get_mut(address) {
            Some(mut record) if !record.locked => {
                record.locked = true;
                record.locked_at = Some(UnixTimestamp::now());
                Ok(Some(record.value().clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, address: &WalletAddress, next_nonce: u64) -> Result<(), StoreError> {
        let was_locked = {
            let mut record = self
                .records
                .entry(address.clone())
                .or_insert_with(|| NonceRecord::new(address.clone(), next_nonce));
            let was_locked = record.locked;
            record.locked = false;
            record.nonce = next_nonce;
            was_locked
        };
        if was_locked {
            // No subscribers is fine: nobody is waiting.
            let _ = self.unlocked.send(address.clone());
        }
        Ok(())
    }

    async fn get(&self, address: &WalletAddress) -> Result<Option<NonceRecord>, StoreError> {
        Ok(self.records.get(address).map(|record| record.value().clone()))
    }
}

#[async_trait]
impl UnlockFeed for MemoryNonceStore {
    async fn subscribe(&self) -> Result<UnlockStream, StoreError> {
        let receiver = self.unlocked.subscribe();
        let events = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(address) => Some((
                    Ok(UnlockEvent {
                        address: Some(address),
                    }),
                    receiver,
                )),
                // Missed some events: a single anonymous wake covers all of them.
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "unlock feed lagged");
                    Some((Ok(UnlockEvent { address: None }), receiver))
                }
                Err(RecvError::Closed) => None,
            }
        });
        Ok(events.boxed())
    }
}
