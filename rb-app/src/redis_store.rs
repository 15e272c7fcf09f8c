use crate::lock_store::{LockStore, Push};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// [`LockStore`] backed by Redis, shared by every relaybot process that
/// points at the same server.
#[derive(Clone)]
pub struct RedisLockStore {
    manager: ConnectionManager,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url.to_string())
            .with_context(|| format!("failed to open redis client for {redis_url}"))?;
        let manager = client
            .get_connection_manager()
            .await
            .with_context(|| "failed to connect to redis")?;
        Ok(Self { manager })
    }
}

/// `RPUSH` guarded by `LLEN`, run as one script so no other client can
/// interleave. Returns `{appended, length}`.
const BOUNDED_PUSH_SCRIPT: &str = r"
local len = redis.call('LLEN', KEYS[1])
if len >= tonumber(ARGV[2]) then
  return {0, len}
end
return {1, redis.call('RPUSH', KEYS[1], ARGV[1])}
";

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn acquire_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to SET NX {key}"))?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let exists: bool = conn
            .exists(key)
            .await
            .with_context(|| format!("failed to check {key}"))?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key)
            .await
            .with_context(|| format!("failed to delete {key}"))?;
        Ok(())
    }

    async fn push_back(&self, key: &str, value: Vec<u8>) -> Result<usize> {
        let mut conn = self.manager.clone();
        let len: usize = conn
            .rpush(key, value)
            .await
            .with_context(|| format!("failed to push onto {key}"))?;
        Ok(len)
    }

    async fn push_back_bounded(&self, key: &str, value: Vec<u8>, max_len: usize) -> Result<Push> {
        let mut conn = self.manager.clone();
        let (appended, len): (i64, usize) = redis::Script::new(BOUNDED_PUSH_SCRIPT)
            .key(key)
            .arg(value)
            .arg(max_len)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("failed to push onto {key}"))?;
        Ok(if appended == 1 {
            Push::Appended(len)
        } else {
            Push::Full(len)
        })
    }

    async fn pop_front(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn
            .lpop(key, None)
            .await
            .with_context(|| format!("failed to pop from {key}"))?;
        Ok(value)
    }

    async fn length(&self, key: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        let len: usize = conn
            .llen(key)
            .await
            .with_context(|| format!("failed to read length of {key}"))?;
        Ok(len)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.pexpire::<_, ()>(key, ttl_millis(ttl))
            .await
            .with_context(|| format!("failed to set expiry on {key}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ttl_millis;
    use std::time::Duration;

    #[test]
    fn ttl_is_never_zero_or_negative() {
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::MAX), i64::MAX);
    }
}
