use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

use crate::address::WalletAddress;
use crate::store::{NonceRecord, NonceStore, StoreError, UnlockEvent, UnlockFeed, UnlockStream};
use crate::timestamp::UnixTimestamp;

const KEY_PREFIX: &str = "admin-nonce";

// KEYS[1] record; ARGV[1] baseline nonce
const ENSURE_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('HSET', KEYS[1], 'nonce', ARGV[1], 'locked', '0')
  return 1
end
return 0
"#;

// KEYS[1] record; ARGV[1] now. Returns the nonce, or nil when locked or missing.
const TRY_ACQUIRE: &str = r#"
if redis.call('HGET', KEYS[1], 'locked') == '0' then
  redis.call('HSET', KEYS[1], 'locked', '1', 'locked_at', ARGV[1])
  return redis.call('HGET', KEYS[1], 'nonce')
end
return false
"#;

// KEYS[1] record; ARGV[1] next nonce, ARGV[2] address, ARGV[3] unlock channel
const RELEASE: &str = r#"
local was_locked = redis.call('HGET', KEYS[1], 'locked') == '1'
redis.call('HSET', KEYS[1], 'nonce', ARGV[1], 'locked', '0')
if was_locked then
  redis.call('PUBLISH', ARGV[3], ARGV[2])
end
return 1
"#;

/// Nonce store backed by Redis, shared by every process pointed at the same server.
///
/// Records live in hashes keyed `admin-nonce:{network}:{address}` with the fields
/// `nonce`, `locked` (`"0"`/`"1"`) and `locked_at`. Each operation runs as a single Lua
/// script, so the lock compare-and-set is atomic on the server. `release` publishes the
/// address on `admin-nonce:{network}:unlocked` when it frees a held lock.
#[derive(Clone)]
pub struct RedisNonceStore {
    client: Client,
    connection: MultiplexedConnection,
    network: String,
    ensure_exists: Script,
    try_acquire: Script,
    release: Script,
}

impl Debug for RedisNonceStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNonceStore")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl From<RedisError> for StoreError {
    fn from(value: RedisError) -> Self {
        StoreError::Backend(value.to_string())
    }
}

impl RedisNonceStore {
    pub async fn connect(url: &str, network: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        let network = network.into();
        tracing::info!(%network, "connected to redis nonce store");
        Ok(Self {
            client,
            connection,
            network,
            ensure_exists: Script::new(ENSURE_EXISTS),
            try_acquire: Script::new(TRY_ACQUIRE),
            release: Script::new(RELEASE),
        })
    }

    fn record_key(&self, address: &WalletAddress) -> String {
        format!("{KEY_PREFIX}:{}:{}", self.network, address)
    }

    fn unlock_channel(&self) -> String {
        format!("{KEY_PREFIX}:{}:unlocked", self.network)
    }

    fn parse_record(
        address: &WalletAddress,
        fields: HashMap<String, String>,
    ) -> Result<NonceRecord, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            address: address.clone(),
            reason,
        };
        let nonce = fields
            .get("nonce")
            .ok_or_else(|| corrupt("missing nonce".to_string()))?
            .parse::<u64>()
            .map_err(|e| corrupt(format!("nonce: {e}")))?;
        let locked = match fields.get("locked").map(String::as_str) {
            Some("1") => true,
            Some("0") | None => false,
            Some(other) => return Err(corrupt(format!("locked flag {other:?}"))),
        };
        let locked_at = fields
            .get("locked_at")
            .map(|s| s.parse::<u64>().map(UnixTimestamp::from_secs))
            .transpose()
            .map_err(|e| corrupt(format!("locked_at: {e}")))?;
        Ok(NonceRecord {
            address: address.clone(),
            nonce,
            locked,
            locked_at,
        })
    }
}

#[async_trait]
impl NonceStore for RedisNonceStore {
    async fn ensure_exists(
        &self,
        address: &WalletAddress,
        baseline_nonce: u64,
    ) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let created: i64 = self
            .ensure_exists
            .key(self.record_key(address))
            .arg(baseline_nonce)
            .invoke_async(&mut connection)
            .await?;
        if created == 1 {
            tracing::debug!(%address, baseline_nonce, "created nonce record");
        }
        Ok(())
    }

    async fn try_acquire(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<NonceRecord>, StoreError> {
        let mut connection = self.connection.clone();
        let locked_at = UnixTimestamp::now();
        let nonce: Option<u64> = self
            .try_acquire
            .key(self.record_key(address))
            .arg(locked_at.as_secs())
            .invoke_async(&mut connection)
            .await?;
        Ok(nonce.map(|nonce| NonceRecord {
            address: address.clone(),
            nonce,
            locked: true,
            locked_at: Some(locked_at),
        }))
    }

    async fn release(&self, address: &WalletAddress, next_nonce: u64) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = self
            .release
            .key(self.record_key(address))
            .arg(next_nonce)
            .arg(address.as_str())
            .arg(self.unlock_channel())
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn get(&self, address: &WalletAddress) -> Result<Option<NonceRecord>, StoreError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = connection.hgetall(self.record_key(address)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::parse_record(address, fields).map(Some)
    }
}

#[async_trait]
impl UnlockFeed for RedisNonceStore {
    async fn subscribe(&self) -> Result<UnlockStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.unlock_channel()).await?;
        let events = pubsub.into_on_message().map(|message| {
            let address = message
                .get_payload::<String>()
                .ok()
                .and_then(|payload| payload.parse::<WalletAddress>().ok());
            Ok(UnlockEvent { address })
        });
        Ok(events.boxed())
    }
}
