//! Safe nonce allocation for shared admin wallets.
//!
//! Several requests, in one process or in many, may want to send a transaction from the same
//! wallet at the same time. Each needs a nonce that nobody else uses and that follows the
//! previous one without gaps. This crate serializes them: a caller asks a
//! [`LockCoordinator`] for an address, waits its turn, gets a [`NonceLease`] carrying the
//! nonce, sends its transaction, and then commits (the nonce is consumed) or aborts (the next
//! holder reuses it).
//!
//! # Modules
//!
//! - [`store`] — Durable per-address records with an atomic lock, shared across processes.
//! - [`coordinator`] — The per-process FIFO queue and dispatch loop handing out leases.
//! - [`notifier`] — Wakes the dispatch loop when another process frees a lock.
//! - [`chain`] — Seeds new records from the chain's pending transaction count.
//! - [`address`] — Normalized wallet address used as the record key.
//! - [`config`] — JSON configuration with environment variable indirection.
//! - [`util`] — Telemetry and shutdown signal handling for the binary.
//!
//! # Example
//!
//! ```no_run
//! # async fn send(nonce: u64) -> Result<(), Box<dyn std::error::Error>> { Ok(()) }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use admin_nonce::{LockCoordinator, WalletAddress};
//! use admin_nonce::store::MemoryNonceStore;
//!
//! let coordinator = LockCoordinator::new(MemoryNonceStore::new());
//! let address: WalletAddress = "0x52908400098527886E0F7030069857D2E4169EE7".parse()?;
//! let lease = coordinator.acquire(&address, 0).await?;
//! match send(lease.nonce()).await {
//!     Ok(()) => lease.commit().await?,
//!     Err(_) => lease.abort().await?,
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod notifier;
pub mod store;
pub mod timestamp;
pub mod util;

pub use address::WalletAddress;
pub use coordinator::{CoordinatorError, LockCoordinator, NonceLease};
pub use notifier::{ChangeNotifier, PollingFeed, Wake};
