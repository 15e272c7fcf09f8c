//! Per-user admission: one processing lock and one pending queue per user.
//!
//! Existence of the lock key is the only admission signal. Items that arrive
//! while the lock is held go to the back of the user's queue and are drained
//! in arrival order by whoever holds the lock.

use crate::lock_store::{LockStore, Push};
use rb_channels::{InboundMessage, MessageId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const LOCK_KEY_PREFIX: &str = "relaybot:lock:";
const QUEUE_KEY_PREFIX: &str = "relaybot:queue:";

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("lock store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("pending item codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

/// A turn that arrived while its user was busy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub inbound: InboundMessage,
    /// The "you are queued" notice shown to the user, removed once the item runs.
    #[serde(default)]
    pub notification_id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No lock was held: the caller acquires it and processes the item itself.
    Admitted,
    /// Appended to the user's queue, which now holds `depth` items.
    Queued { depth: usize },
    /// The queue already holds `depth` items and accepts no more.
    Full { depth: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired,
    /// Someone else owns this user's current turn.
    AlreadyLocked,
}

#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn LockStore>,
    lock_ttl: Duration,
    queue_ttl: Duration,
    max_queue_depth: usize,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn LockStore>,
        lock_ttl: Duration,
        queue_ttl: Duration,
        max_queue_depth: usize,
    ) -> Self {
        Self {
            store,
            lock_ttl,
            queue_ttl,
            max_queue_depth: max_queue_depth.max(1),
        }
    }

    fn lock_key(user_id: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{user_id}")
    }

    fn queue_key(user_id: &str) -> String {
        format!("{QUEUE_KEY_PREFIX}{user_id}")
    }

    /// Queue `item` if the user is locked; otherwise tell the caller to run it.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
    pub async fn try_enqueue_or_admit(
        &self,
        user_id: &str,
        inbound: InboundMessage,
        notification_id: Option<MessageId>,
    ) -> Result<Admission> {
        if !self.is_locked(user_id).await? {
            return Ok(Admission::Admitted);
        }
        let key = Self::queue_key(user_id);
        let bytes = serde_json::to_vec(&PendingItem {
            inbound,
            notification_id,
        })?;
        match self
            .store
            .push_back_bounded(&key, bytes, self.max_queue_depth)
            .await?
        {
            Push::Appended(depth) => {
                self.store.expire(&key, self.queue_ttl).await?;
                tracing::debug!(depth, "pending item queued");
                Ok(Admission::Queued { depth })
            }
            Push::Full(depth) => {
                tracing::warn!(depth, max = self.max_queue_depth, "pending queue is full");
                Ok(Admission::Full { depth })
            }
        }
    }

    /// Append to the user's queue unconditionally and re-arm the queue TTL.
    pub async fn enqueue(&self, user_id: &str, item: &PendingItem) -> Result<usize> {
        let key = Self::queue_key(user_id);
        let bytes = serde_json::to_vec(item)?;
        let depth = self.store.push_back(&key, bytes).await?;
        self.store.expire(&key, self.queue_ttl).await?;
        tracing::debug!(user_id, depth, "pending item queued");
        Ok(depth)
    }

    pub async fn acquire_lock(&self, user_id: &str) -> Result<LockAcquire> {
        let acquired = self
            .store
            .acquire_if_absent(&Self::lock_key(user_id), self.lock_ttl)
            .await?;
        Ok(if acquired {
            LockAcquire::Acquired
        } else {
            LockAcquire::AlreadyLocked
        })
    }

    /// Push the lock's expiry out by a full TTL. Used between queued turns.
    pub async fn refresh_lock(&self, user_id: &str) -> Result<()> {
        self.store
            .expire(&Self::lock_key(user_id), self.lock_ttl)
            .await?;
        Ok(())
    }

    /// Idempotent: releasing an absent or expired lock succeeds.
    pub async fn release_lock(&self, user_id: &str) -> Result<()> {
        self.store.delete(&Self::lock_key(user_id)).await?;
        Ok(())
    }

    pub async fn is_locked(&self, user_id: &str) -> Result<bool> {
        Ok(self.store.exists(&Self::lock_key(user_id)).await?)
    }

    /// Pop the oldest pending item. Entries that no longer decode are dropped.
    pub async fn dequeue_next(&self, user_id: &str) -> Result<Option<PendingItem>> {
        let key = Self::queue_key(user_id);
        while let Some(bytes) = self.store.pop_front(&key).await? {
            match serde_json::from_slice::<PendingItem>(&bytes) {
                Ok(item) => return Ok(Some(item)),
                Err(error) => {
                    tracing::warn!(user_id, %error, "dropping undecodable pending item");
                }
            }
        }
        Ok(None)
    }

    pub async fn queue_depth(&self, user_id: &str) -> Result<usize> {
        Ok(self.store.length(&Self::queue_key(user_id)).await?)
    }
}
