//! Durable per-address nonce and lock state.
//!
//! A [`NonceStore`] keeps one [`NonceRecord`] per wallet address. The record is the only
//! state shared between processes: its `locked` flag is taken with an atomic compare-and-set
//! ([`NonceStore::try_acquire`]) and cleared with an unconditional write ([`NonceStore::release`]).
//!
//! Backends:
//! - [`MemoryNonceStore`] — shared in-process state. Clones share one map, so coordinators
//!   built on clones behave like separate processes sharing one database.
//! - [`RedisNonceStore`] — one Redis hash per record, every operation a single Lua script
//!   (requires the `redis` feature).
//!
//! Every backend also implements [`UnlockFeed`], the change stream the
//! [`ChangeNotifier`](crate::notifier::ChangeNotifier) subscribes to.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::*;
#[cfg(feature = "redis")]
pub use redis_store::*;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::address::WalletAddress;
use crate::timestamp::UnixTimestamp;

/// Persisted nonce state of one wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    pub address: WalletAddress,
    /// Next nonce to hand out.
    pub nonce: u64,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<UnixTimestamp>,
}

impl NonceRecord {
    pub fn new(address: WalletAddress, nonce: u64) -> Self {
        Self {
            address,
            nonce,
            locked: false,
            locked_at: None,
        }
    }
}

/// Failure of the persistence layer. Treated as transient everywhere: nothing retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Nonce store backend error: {0}")]
    Backend(String),
    #[error("Nonce record for {address} is corrupt: {reason}")]
    Corrupt {
        address: WalletAddress,
        reason: String,
    },
}

/// Atomically guarded nonce/lock state, shared by every process of a deployment.
#[async_trait]
pub trait NonceStore: Send + Sync + 'static {
    /// Creates an unlocked record seeded with `baseline_nonce` unless one already exists.
    async fn ensure_exists(
        &self,
        address: &WalletAddress,
        baseline_nonce: u64,
    ) -> Result<(), StoreError>;

    /// Takes the lock if the record exists and is unlocked, in one atomic step.
    ///
    /// Returns the record as it is after locking, carrying the nonce the holder may use.
    /// `None` means the lock is held by someone (in any process) or the record is missing.
    async fn try_acquire(&self, address: &WalletAddress)
    -> Result<Option<NonceRecord>, StoreError>;

    /// Clears the lock and stores `next_nonce`.
    ///
    /// Unconditional: it does not check that the caller is the current holder.
    /// Emits an unlock event when the record was locked before the call.
    async fn release(&self, address: &WalletAddress, next_nonce: u64) -> Result<(), StoreError>;

    async fn get(&self, address: &WalletAddress) -> Result<Option<NonceRecord>, StoreError>;
}

/// A lock on some address went from held to free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockEvent {
    /// The released address, when the transport knows it.
    pub address: Option<WalletAddress>,
}

pub type UnlockStream = BoxStream<'static, Result<UnlockEvent, StoreError>>;

/// Source of [`UnlockEvent`]s: a native change stream, pub/sub channel or a polling ticker.
#[async_trait]
pub trait UnlockFeed: Send + Sync + 'static {
    async fn subscribe(&self) -> Result<UnlockStream, StoreError>;
}

#[async_trait]
impl<T: UnlockFeed + ?Sized> UnlockFeed for Arc<T> {
    async fn subscribe(&self) -> Result<UnlockStream, StoreError> {
        (**self).subscribe().await
    }
}
