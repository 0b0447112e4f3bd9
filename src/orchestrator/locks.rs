//! Per-path async locks for applying and rolling back changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct FileLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every path, always in sorted order so two callers with
    /// overlapping sets cannot deadlock. Guards release on drop.
    pub async fn acquire(&self, paths: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&String> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            sorted
                .iter()
                .map(|p| map.entry((*p).clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for m in mutexes {
            guards.push(m.lock_owned().await);
        }
        guards
    }

    /// Paths currently tracked; used by tests.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_overlapping_sets_serialize() {
        let locks = Arc::new(FileLocks::new());
        let first = locks.acquire(&["b.ts".into(), "a.ts".into()]).await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire(&["a.ts".into(), "c.ts".into()]).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_sets_do_not_block() {
        let locks = FileLocks::new();
        let _a = locks.acquire(&["a.ts".into()]).await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire(&["b.ts".into()])).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = FileLocks::new();
        drop(locks.acquire(&["a.ts".into(), "a.ts".into()]).await);
        let _b = locks.acquire(&["b.ts".into()]).await;
        assert_eq!(locks.tracked(), 1);
    }
}
