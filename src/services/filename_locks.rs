//! Per-filename mutual exclusion shared by ingestion and deletion
//!
//! Each filename gets its own async lock, created on first use and removed
//! once nobody holds or waits for it, so ingests of different files never
//! wait on each other.
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct FilenameLocks {
    locks: Arc<StdMutex<LockMap>>,
}

/// Held while a filename is locked; releases on drop
pub struct FilenameGuard {
    filename: String,
    locks: Arc<StdMutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl FilenameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, filename: &str) -> FilenameGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(filename.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;

        FilenameGuard {
            filename: filename.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Lock several filenames at once, in sorted order
    ///
    /// Ingestion only ever holds a single name, so sorted acquisition here
    /// cannot deadlock against it or against another multi-lock.
    pub async fn lock_all<'a, I>(&self, filenames: I) -> Vec<FilenameGuard>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut names: Vec<&str> = filenames.into_iter().collect();
        names.sort_unstable();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock(name).await);
        }
        guards
    }

    /// Number of filenames with a live lock entry
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl FilenameGuard {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for FilenameGuard {
    fn drop(&mut self) {
        // Release first so the count below only sees the map and any waiters
        drop(self.guard.take());

        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = map.get(&self.filename) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.filename);
            }
        }
    }
}
