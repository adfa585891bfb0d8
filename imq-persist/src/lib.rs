#![deny(unsafe_code)]

//! In-flight message persistence.
//!
//! Packets that still wait for an acknowledgment are kept in a [`Persist`] store under a
//! delivery key (`"{client_id}:{packet_id}"`). Three backends are provided:
//!
//! - [`NonePersist`] keeps nothing
//! - [`MemPersist`] keeps records in a concurrent map
//! - [`FilePersist`] keeps one file per record, written synchronously or flushed in batches
//!
//! Every backend honours the same [`PersistStrategy`]: an optional capacity with a
//! drop-on-exceed switch, and a duplicate-replace switch for colliding keys.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use imq_persist::{MemPersist, Persist, PersistStrategy};
//!
//! let store: Arc<dyn Persist> = Arc::new(MemPersist::new(PersistStrategy::default()));
//! assert_eq!(store.name(), "memory");
//! ```

use std::fmt;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmqtt_codec::types::Publish;
use serde::{Deserialize, Serialize};

pub use self::file::FilePersist;
pub use self::memory::MemPersist;
pub use self::none::NonePersist;

mod file;
mod memory;
mod none;

pub type Result<T> = std::result::Result<T, PersistError>;

/// Shared, backend-agnostic store handle.
pub type PersistHandle = Arc<dyn Persist>;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persist io error, {0}")]
    Io(#[from] std::io::Error),
    #[error("persist codec error, {0}")]
    Codec(#[from] bincode::Error),
    #[error("persist config error, {0}")]
    Config(String),
}

/// Result of admitting a packet into a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// The store is full and drops new writes; the packet was not persisted.
    Dropped,
}

impl StoreOutcome {
    #[inline]
    pub fn is_stored(&self) -> bool {
        matches!(self, StoreOutcome::Stored)
    }
}

/// A packet waiting for the peer to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingPacket {
    /// Publish waiting for PUBACK / PUBREC (outbound) or PUBREL (inbound).
    Publish(Box<Publish>),
    /// Outbound PUBREL waiting for PUBCOMP.
    Release(NonZeroU16),
}

impl PendingPacket {
    #[inline]
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        match self {
            PendingPacket::Publish(p) => p.packet_id,
            PendingPacket::Release(packet_id) => Some(*packet_id),
        }
    }
}

/// Admission policy shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistStrategy {
    ///Maximum number of pending records, 0 means unlimited.
    pub max_count: usize,
    ///Drop new writes once `max_count` is reached.
    pub drop_on_exceed: bool,
    ///Overwrite an existing record that has the same key.
    pub duplicate_replace: bool,
    ///Flush interval of buffered backends, zero persists on every write.
    pub interval: Duration,
}

impl Default for PersistStrategy {
    fn default() -> Self {
        Self { max_count: 0, drop_on_exceed: false, duplicate_replace: true, interval: Duration::from_secs(1) }
    }
}

impl PersistStrategy {
    /// Whether a store that currently holds `count` records must refuse another write.
    #[inline]
    pub(crate) fn exceeded(&self, count: usize) -> bool {
        self.max_count > 0 && count >= self.max_count
    }
}

/// Visitor used by [`Persist::for_each`]; return `false` to stop iterating.
pub type Visitor<'a> = dyn FnMut(&str, &PendingPacket) -> bool + Send + 'a;

#[async_trait]
pub trait Persist: Send + Sync + fmt::Debug {
    ///Backend name, used in logs.
    fn name(&self) -> &'static str;

    ///Admits `packet` under `key`.
    async fn store(&self, key: &str, packet: PendingPacket) -> Result<StoreOutcome>;

    ///Loads the record stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<PendingPacket>>;

    ///Visits every stored record in no particular order.
    async fn for_each(&self, f: &mut Visitor<'_>) -> Result<()>;

    ///Removes the record stored under `key`, absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    ///Irreversibly removes every record.
    async fn destroy(&self) -> Result<()>;

    ///Persists writes that are still buffered.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Delivery key of a packet identifier within a client's session.
#[inline]
pub fn delivery_key(client_id: &str, packet_id: NonZeroU16) -> String {
    format!("{client_id}:{packet_id}")
}

/// Splits a delivery key produced by [`delivery_key`] for `client_id`.
#[inline]
pub fn packet_id_of(key: &str, client_id: &str) -> Option<NonZeroU16> {
    key.strip_prefix(client_id)?.strip_prefix(':')?.parse().ok()
}

/// Collects the keys of every record that belongs to `client_id`.
pub async fn client_keys(store: &dyn Persist, client_id: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    store
        .for_each(&mut |key: &str, _: &PendingPacket| {
            if packet_id_of(key, client_id).is_some() {
                keys.push(key.to_owned());
            }
            true
        })
        .await?;
    Ok(keys)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_key() {
        let pid = NonZeroU16::new(42).unwrap();
        let key = delivery_key("c1", pid);
        assert_eq!(key, "c1:42");
        assert_eq!(packet_id_of(&key, "c1"), Some(pid));
        assert_eq!(packet_id_of(&key, "c"), None);
        assert_eq!(packet_id_of("c1:0", "c1"), None);
        assert_eq!(packet_id_of("c1:x", "c1"), None);
        assert_eq!(packet_id_of("a:b:7", "a:b"), NonZeroU16::new(7));
    }

    #[test]
    fn test_strategy() {
        let s = PersistStrategy::default();
        assert!(!s.exceeded(usize::MAX));
        let s = PersistStrategy { max_count: 2, ..Default::default() };
        assert!(!s.exceeded(1));
        assert!(s.exceeded(2));
    }
}
