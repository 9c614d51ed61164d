//! Named, time-boxed locks shared between server replicas.
//!
//! A lock is identified by name and held under a random token until it is
//! released or its TTL lapses. Release only succeeds for the holder of the
//! matching token, so a replica whose TTL ran out cannot drop a lock that a
//! peer has since taken.
//!
//! [`MemoryLockService`] serves a single process (and tests simulating several
//! replicas). [`RedisLockService`] coordinates real replicas (feature
//! `redis-lock`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::LockError;

/// Proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub token: String,
}

impl LockToken {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// A distributed mutual-exclusion service.
#[async_trait::async_trait]
pub trait LockService: std::fmt::Debug + Send + Sync + 'static {
    /// Try once to take the lock `name` for `ttl`.
    ///
    /// Returns `Ok(None)` if another holder has it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the lock service cannot be reached.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Release a held lock. Releasing an expired or foreign lock is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the lock service cannot be reached.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;
}

/// Take `name`, retrying `retries` times with a fixed `backoff`.
///
/// # Errors
///
/// Returns [`LockError::Unavailable`] once the attempts are exhausted, or the
/// last service error if the service kept failing.
pub async fn acquire_with_retry(
    service: &dyn LockService,
    name: &str,
    ttl: Duration,
    retries: u32,
    backoff: Duration,
) -> Result<LockToken, LockError> {
    let attempts = retries.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match service.try_acquire(name, ttl).await {
            Ok(Some(token)) => return Ok(token),
            Ok(None) => {}
            Err(e) => last_err = Some(e),
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    Err(last_err.unwrap_or_else(|| LockError::Unavailable {
        name: name.to_owned(),
        reason: format!("still held after {attempts} attempts"),
    }))
}

/// In-process lock service. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockService {
    held: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryLockService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = held.get(name) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = LockToken::new(name);
        held.insert(name.to_owned(), (token.token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        if held
            .get(&token.name)
            .is_some_and(|(current, _)| *current == token.token)
        {
            held.remove(&token.name);
        }
        Ok(())
    }
}

#[cfg(feature = "redis-lock")]
pub use redis_lock::RedisLockService;

#[cfg(feature = "redis-lock")]
mod redis_lock {
    use std::time::Duration;

    use redis::aio::MultiplexedConnection;

    use super::{LockService, LockToken};
    use crate::error::LockError;

    /// Deletes the key only if it still holds our token.
    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    /// Key namespace for lock entries.
    const KEY_PREFIX: &str = "razeedash:lock:";

    /// Lock service backed by Redis `SET NX PX`.
    pub struct RedisLockService {
        conn: MultiplexedConnection,
    }

    impl std::fmt::Debug for RedisLockService {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisLockService").finish_non_exhaustive()
        }
    }

    impl RedisLockService {
        /// Connect to Redis.
        ///
        /// # Errors
        ///
        /// Returns [`LockError::Unavailable`] if the URL is invalid or the
        /// server cannot be reached.
        pub async fn connect(url: &str) -> Result<Self, LockError> {
            let unavailable = |reason: String| LockError::Unavailable {
                name: "redis".to_owned(),
                reason,
            };
            let client = redis::Client::open(url).map_err(|e| unavailable(e.to_string()))?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| unavailable(e.to_string()))?;
            Ok(Self { conn })
        }
    }

    #[async_trait::async_trait]
    impl LockService for RedisLockService {
        async fn try_acquire(
            &self,
            name: &str,
            ttl: Duration,
        ) -> Result<Option<LockToken>, LockError> {
            let token = LockToken::new(name);
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            let mut conn = self.conn.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(format!("{KEY_PREFIX}{name}"))
                .arg(&token.token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Unavailable {
                    name: name.to_owned(),
                    reason: e.to_string(),
                })?;
            Ok(reply.map(|_| token))
        }

        async fn release(&self, token: &LockToken) -> Result<(), LockError> {
            let mut conn = self.conn.clone();
            let _: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(format!("{KEY_PREFIX}{}", token.name))
                .arg(&token.token)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| LockError::Unavailable {
                    name: token.name.clone(),
                    reason: e.to_string(),
                })?;
            Ok(())
        }
    }
}
