use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type SessionGuard = OwnedMutexGuard<()>;

/// Hands out one async mutex per session id. Waiters are served in arrival
/// order; an id's entry disappears once nobody holds or awaits it.
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    locks: Arc<Mutex<HashMap<String, Weak<AsyncMutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, Weak<AsyncMutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn session_mutex(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.lock_map();
        locks.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = locks.get(session_id).and_then(Weak::upgrade) {
            return existing;
        }

        let mutex = Arc::new(AsyncMutex::new(()));
        locks.insert(session_id.to_string(), Arc::downgrade(&mutex));
        mutex
    }

    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        self.session_mutex(session_id).lock_owned().await
    }

    pub fn tracked_sessions(&self) -> usize {
        self.lock_map()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::SessionLocks;

    #[tokio::test]
    async fn same_session_is_serialized_in_arrival_order() {
        let locks = SessionLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire("s1").await;
        let mut handles = Vec::new();
        for idx in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("s1").await;
                order.lock().await.push(idx);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);

        for handle in handles {
            handle.await.expect("task should finish");
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn different_sessions_do_not_block_each_other() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_sessions_are_forgotten() {
        let locks = SessionLocks::new();
        {
            let _guard = locks.acquire("s1").await;
            assert_eq!(locks.tracked_sessions(), 1);
        }
        assert_eq!(locks.tracked_sessions(), 0);
    }
}
