use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::{SessionBackend, SessionFuture, SessionLimits, SessionStore};
use crate::models::{ConversationTurn, SessionHistory};

#[derive(Debug)]
struct MemoryEntry {
    history: SessionHistory,
    last_access: Instant,
}

/// Process-local session store. The map lock is only held for synchronous
/// sections, never across an await.
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
    limits: SessionLimits,
}

impl MemorySessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            limits,
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn get_at(&self, session_id: &str, now: Instant) -> SessionHistory {
        let mut entries = self.lock_entries();
        match entries.get_mut(session_id) {
            None => return SessionHistory::new(),
            Some(entry) if now.saturating_duration_since(entry.last_access) <= self.limits.ttl => {
                entry.last_access = now;
                return entry.history.clone();
            }
            Some(_) => {}
        }

        entries.remove(session_id);
        SessionHistory::new()
    }

    pub(crate) fn append_at(&self, session_id: &str, turns: Vec<ConversationTurn>, now: Instant) {
        let mut entries = self.lock_entries();
        let entry = entries
            .entry(session_id.to_string())
            .or_insert_with(|| MemoryEntry {
                history: SessionHistory::new(),
                last_access: now,
            });
        if now.saturating_duration_since(entry.last_access) > self.limits.ttl {
            entry.history = SessionHistory::new();
        }
        entry.history.extend_bounded(turns, self.limits.max_turns);
        entry.last_access = now;
    }

    /// Replaces the stored history, used to mirror a cache write.
    pub(crate) fn put(&self, session_id: &str, history: SessionHistory) {
        let mut entries = self.lock_entries();
        entries.insert(
            session_id.to_string(),
            MemoryEntry {
                history,
                last_access: Instant::now(),
            },
        );
    }

    pub(crate) fn remove(&self, session_id: &str) {
        self.lock_entries().remove(session_id);
    }

    pub(crate) fn expire_at(&self, now: Instant) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_access) <= self.limits.ttl);
        before - entries.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock_entries().len()
    }
}

impl SessionStore for MemorySessionStore {
    fn get<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, SessionHistory> {
        Box::pin(async move { self.get_at(session_id, Instant::now()) })
    }

    fn append<'a>(
        &'a self,
        session_id: &'a str,
        turns: Vec<ConversationTurn>,
    ) -> SessionFuture<'a, ()> {
        Box::pin(async move { self.append_at(session_id, turns, Instant::now()) })
    }

    fn clear<'a>(&'a self, session_id: &'a str) -> SessionFuture<'a, ()> {
        Box::pin(async move { self.remove(session_id) })
    }

    fn expire(&self) -> SessionFuture<'_, usize> {
        Box::pin(async move { self.expire_at(Instant::now()) })
    }

    fn backend(&self) -> SessionBackend {
        SessionBackend::Memory
    }
}
