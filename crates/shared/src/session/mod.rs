use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::models::{ConversationTurn, SessionHistory};

mod cache;
mod locks;
mod memory;
mod redis_cache;

pub use cache::{CacheError, CacheFuture, CachedSessionStore, SessionCache, session_cache_key};
pub use locks::{SessionGuard, SessionLocks};
pub use memory::MemorySessionStore;
pub use redis_cache::RedisSessionCache;

pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Cache,
    Memory,
}

impl SessionBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "redis",
            Self::Memory => "memory",
        }
    }
}

/// Per-session conversation history. Implementations never surface storage
/// failures: a read that cannot be served returns an empty history.
pub trait SessionStore: Send + Sync {
    fn get<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, SessionHistory>;

    /// Appends every turn in one write, then evicts the oldest beyond the cap.
    fn append<'a>(
        &'a self,
        session_id: &'a str,
        turns: Vec<ConversationTurn>,
    ) -> SessionFuture<'a, ()>;

    fn clear<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, ()>;

    /// Drops sessions idle longer than the TTL and returns how many were removed.
    fn expire(&self) -> SessionFuture<'_, usize>;

    fn backend(&self) -> SessionBackend;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub ttl: Duration,
    pub max_turns: usize,
}

/// Picks the Redis-backed store when `redis_url` is set and reachable, and the
/// in-process store otherwise.
pub async fn open_session_store(
    redis_url: Option<&str>,
    limits: SessionLimits,
) -> Arc<dyn SessionStore> {
    let Some(redis_url) = redis_url else {
        info!("REDIS_URL not set, using in-memory session store");
        return Arc::new(MemorySessionStore::new(limits));
    };

    match RedisSessionCache::connect(redis_url).await {
        Ok(cache) => {
            info!("connected to redis session cache");
            Arc::new(CachedSessionStore::new(cache, limits))
        }
        Err(err) => {
            warn!(error = %err, "redis unavailable, using in-memory session store");
            Arc::new(MemorySessionStore::new(limits))
        }
    }
}
