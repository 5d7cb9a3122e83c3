use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::{MemorySessionStore, SessionBackend, SessionFuture, SessionLimits, SessionStore};
use crate::models::{ConversationTurn, SessionHistory};

const SESSION_KEY_PREFIX: &str = "securerag:session:v1";
const CACHED_SESSION_VERSION: u32 = 1;

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("session cache unavailable: {0}")]
    Unavailable(String),
    #[error("session cache payload invalid: {0}")]
    InvalidPayload(String),
}

/// Key-value cache with per-key expiry, the contract a shared session cache
/// has to offer.
pub trait SessionCache: Send + Sync {
    fn load<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    fn store<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, ()>;

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()>;
}

pub fn session_cache_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}:{session_id}")
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedSession {
    version: u32,
    history: SessionHistory,
}

fn encode_history(history: &SessionHistory) -> Result<String, CacheError> {
    serde_json::to_string(&CachedSession {
        version: CACHED_SESSION_VERSION,
        history: history.clone(),
    })
    .map_err(|err| CacheError::InvalidPayload(err.to_string()))
}

fn decode_history(raw: &str) -> Result<SessionHistory, CacheError> {
    let cached: CachedSession =
        serde_json::from_str(raw).map_err(|err| CacheError::InvalidPayload(err.to_string()))?;
    if cached.version != CACHED_SESSION_VERSION {
        return Err(CacheError::InvalidPayload(format!(
            "unsupported session version {}",
            cached.version
        )));
    }
    Ok(cached.history)
}

/// Session store backed by a shared cache, with every write mirrored into a
/// local store that serves requests whenever the cache fails. Sessions whose
/// last write only reached the mirror are tracked as unsynced and written
/// back on the next successful cache round trip.
pub struct CachedSessionStore<C> {
    cache: C,
    mirror: MemorySessionStore,
    unsynced: Mutex<HashSet<String>>,
    limits: SessionLimits,
}

impl<C> CachedSessionStore<C>
where
    C: SessionCache,
{
    pub fn new(cache: C, limits: SessionLimits) -> Self {
        Self {
            cache,
            mirror: MemorySessionStore::new(limits),
            unsynced: Mutex::new(HashSet::new()),
            limits,
        }
    }

    fn lock_unsynced(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.unsynced.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_unsynced(&self, session_id: &str) -> bool {
        self.lock_unsynced().contains(session_id)
    }

    fn mark_unsynced(&self, session_id: &str, unsynced: bool) {
        let mut sessions = self.lock_unsynced();
        if unsynced {
            sessions.insert(session_id.to_string());
        } else {
            sessions.remove(session_id);
        }
    }

    async fn read(&self, session_id: &str) -> SessionHistory {
        if self.is_unsynced(session_id) {
            let history = self.mirror.get_at(session_id, Instant::now());
            self.write_back(session_id, &history).await;
            return history;
        }

        let key = session_cache_key(session_id);
        let loaded = self
            .cache
            .load(&key)
            .await
            .and_then(|raw| raw.as_deref().map(decode_history).transpose());

        match loaded {
            Ok(Some(history)) => {
                self.mirror.put(session_id, history.clone());
                history
            }
            Ok(None) => {
                self.mirror.remove(session_id);
                SessionHistory::new()
            }
            Err(err) => {
                warn!(session_id, error = %err, "session cache read failed, using local mirror");
                self.mirror.get_at(session_id, Instant::now())
            }
        }
    }

    /// Stores `history` in the cache. On failure the session stays unsynced
    /// so the mirror keeps serving it.
    async fn write_back(&self, session_id: &str, history: &SessionHistory) {
        let key = session_cache_key(session_id);
        let stored = match encode_history(history) {
            Ok(payload) => self.cache.store(&key, payload, self.limits.ttl).await,
            Err(err) => Err(err),
        };

        match stored {
            Ok(()) => {
                if self.is_unsynced(session_id) {
                    info!(session_id, "session cache recovered, local turns written back");
                }
                self.mark_unsynced(session_id, false);
            }
            Err(err) => {
                warn!(session_id, error = %err, "session cache write failed, kept local mirror");
                self.mark_unsynced(session_id, true);
            }
        }
    }
}

impl<C> SessionStore for CachedSessionStore<C>
where
    C: SessionCache,
{
    fn get<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, SessionHistory> {
        Box::pin(self.read(session_id))
    }

    fn append<'a>(
        &'a self,
        session_id: &'a str,
        turns: Vec<ConversationTurn>,
    ) -> SessionFuture<'a, ()> {
        Box::pin(async move {
            let mut history = self.read(session_id).await;
            history.extend_bounded(turns, self.limits.max_turns);
            self.mirror.put(session_id, history.clone());
            self.write_back(session_id, &history).await;
        })
    }

    fn clear<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, ()> {
        Box::pin(async move {
            self.mirror.remove(session_id);
            match self.cache.delete(&session_cache_key(session_id)).await {
                Ok(()) => self.mark_unsynced(session_id, false),
                Err(err) => {
                    // The empty mirror entry has to win over the stale cached copy.
                    warn!(session_id, error = %err, "session cache delete failed");
                    self.mark_unsynced(session_id, true);
                }
            }
        })
    }

    fn expire(&self) -> SessionFuture<'_, usize> {
        // The cache expires its own keys; only the mirror needs sweeping.
        Box::pin(async move { self.mirror.expire_at(Instant::now()) })
    }

    fn backend(&self) -> SessionBackend {
        SessionBackend::Cache
    }
}
