//! Shared key-value store behind per-user admission.
//!
//! Correctness of admission rests entirely on the atomicity of
//! [`LockStore::acquire_if_absent`]; every other operation is a plain
//! key or list primitive.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically create `key` with an expiry. Returns false when it already exists.
    async fn acquire_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append to the list at `key`, returning the new length.
    async fn push_back(&self, key: &str, value: Vec<u8>) -> Result<usize>;

    /// Append to the list at `key` only while it holds fewer than `max_len`
    /// items. Check and append are one atomic step.
    async fn push_back_bounded(&self, key: &str, value: Vec<u8>, max_len: usize) -> Result<Push>;

    async fn pop_front(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn length(&self, key: &str) -> Result<usize>;

    /// (Re)arm the expiry of an existing key. No-op for missing keys.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Appended; the list now holds this many items.
    Appended(usize),
    /// Rejected; the list already holds this many items.
    Full(usize),
}

#[derive(Debug)]
enum Value {
    Marker,
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process store for single-process deployments and tests.
///
/// Expired keys are dropped lazily on access. Time comes from the tokio
/// clock, so paused-time tests see expiry deterministically.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    slots: DashMap<String, Slot>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.slots.remove_if(key, |_, slot| !slot.is_live(now));
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(Slot {
                    value: Value::Marker,
                    expires_at: Some(now + ttl),
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Marker,
                    expires_at: Some(now + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.purge_expired(key);
        Ok(self.slots.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn push_back(&self, key: &str, value: Vec<u8>) -> Result<usize> {
        self.purge_expired(key);
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::List(items) => {
                items.push_back(value);
                Ok(items.len())
            }
            Value::Marker => Err(anyhow::anyhow!("key {key} holds a marker, not a list")),
        }
    }

    async fn push_back_bounded(&self, key: &str, value: Vec<u8>, max_len: usize) -> Result<Push> {
        self.purge_expired(key);
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::List(items) if items.len() >= max_len => Ok(Push::Full(items.len())),
            Value::List(items) => {
                items.push_back(value);
                Ok(Push::Appended(items.len()))
            }
            Value::Marker => Err(anyhow::anyhow!("key {key} holds a marker, not a list")),
        }
    }

    async fn pop_front(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.purge_expired(key);
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(None);
        };
        let popped = match &mut slot.value {
            Value::List(items) => items.pop_front(),
            Value::Marker => return Err(anyhow::anyhow!("key {key} holds a marker, not a list")),
        };
        drop(slot);
        // Empty lists disappear, as they do in Redis.
        self.slots
            .remove_if(key, |_, slot| matches!(&slot.value, Value::List(items) if items.is_empty()));
        Ok(popped)
    }

    async fn length(&self, key: &str) -> Result<usize> {
        self.purge_expired(key);
        Ok(match self.slots.get(key).as_deref() {
            Some(Slot {
                value: Value::List(items),
                ..
            }) => items.len(),
            _ => 0,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.purge_expired(key);
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}
