//! Baseline nonces read from chain state.
//!
//! A nonce record is created the first time an address is requested, seeded with a
//! baseline. For EVM chains the natural baseline is the account's transaction count
//! including the mempool, so a fresh deployment does not reuse nonces of transactions
//! that are still pending.

use alloy_primitives::Address;
use alloy_provider::Provider;
use alloy_transport::TransportError;
use async_trait::async_trait;

use crate::address::WalletAddress;

#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    #[error("Address {0} is not a valid EVM address")]
    InvalidAddress(WalletAddress),
    #[error("Failed to fetch transaction count: {0}")]
    Transport(#[from] TransportError),
}

/// Provides the nonce a brand-new record starts from.
#[async_trait]
pub trait BaselineNonce: Send + Sync {
    async fn baseline_nonce(&self, address: &WalletAddress) -> Result<u64, BaselineError>;
}

/// Baseline from `eth_getTransactionCount(address, "pending")`.
///
/// Using `.pending()` rather than `latest` includes transactions sitting in the mempool,
/// which avoids "nonce too low" errors when a record is seeded while earlier
/// transactions from the same account are still in flight.
#[derive(Debug, Clone)]
pub struct PendingTransactionCount<P> {
    provider: P,
}

impl<P> PendingTransactionCount<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P> BaselineNonce for PendingTransactionCount<P>
where
    P: Provider + Send + Sync,
{
    async fn baseline_nonce(&self, address: &WalletAddress) -> Result<u64, BaselineError> {
        let evm_address = Address::try_from(address)
            .map_err(|_| BaselineError::InvalidAddress(address.clone()))?;
        tracing::trace!(%address, "fetching pending transaction count");
        let count = self
            .provider
            .get_transaction_count(evm_address)
            .pending()
            .await?;
        Ok(count)
    }
}
