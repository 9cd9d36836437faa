//! Durable store trait and the in-memory reference backend.
//!
//! Object records are keyed by opaque byte strings (the backend uses
//! persistent handle tokens). Keys sort bytewise, so prefix scans return
//! records in stable order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{key_hex, StoreError, StoreResult};

/// Key type for store records.
pub type Key = Vec<u8>;
/// Value type for store records.
pub type Value = Vec<u8>;

/// Durable key-value context backing one mounted namespace.
///
/// Implementations must support concurrent reads; writes to a single key are
/// serialized by the implementation. The backend relies on that contract
/// rather than adding its own per-record locking.
pub trait DurableStore: Send + Sync {
    /// Reads the record under `key`, or `None` if absent.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Value>>;

    /// Writes a record, overwriting any existing value.
    fn put(&self, key: Key, value: Value) -> StoreResult<()>;

    /// Removes a record. Fails with `KeyNotFound` if absent.
    fn remove(&self, key: &[u8]) -> StoreResult<()>;

    /// Returns true if a record exists under `key`.
    fn contains(&self, key: &[u8]) -> StoreResult<bool>;

    /// Returns all records whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Key, Value)>>;

    /// Drains buffered state to stable media.
    fn flush(&self) -> StoreResult<()>;

    /// Closes the context. Later operations fail with `Closed`.
    fn close(&self) -> StoreResult<()>;
}

/// In-memory store backed by a `BTreeMap`.
///
/// Nothing survives process exit; flush only bumps a counter so callers can
/// observe that the shutdown protocol reached this context.
pub struct MemoryStore {
    data: RwLock<BTreeMap<Key, Value>>,
    flushes: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            flushes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of flushes performed on this context.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Value>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> StoreResult<()> {
        self.check_open()?;
        self.data.write().insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        match self.data.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::KeyNotFound {
                key_hex: key_hex(key),
            }),
        }
    }

    fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        self.check_open()?;
        Ok(self.data.read().contains_key(key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Key, Value)>> {
        self.check_open()?;
        let data = self.data.read();
        let mut out = Vec::new();
        for (k, v) in data.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.clone(), v.clone()));
        }
        Ok(out)
    }

    fn flush(&self) -> StoreResult<()> {
        self.check_open()?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(records = self.data.read().len(), "memory store flushed");
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
