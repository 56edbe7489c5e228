//! Nonce → workspace lookup shared by the job pipeline and log observers.
//!
//! Entries are inserted when a job's workspace is allocated and evicted when
//! that workspace is destroyed. The registry never owns the directory; it
//! only lets a streaming observer find it while the job is in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::debug;

/// Concurrent map from caller-chosen nonce to the job's workspace path.
///
/// Nonces are not unique: a newer job with the same nonce replaces the
/// lookup, and eviction of the older job leaves the newer entry in place.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: RwLock<HashMap<String, PathBuf>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `nonce` at `path`, replacing any previous job's entry.
    pub async fn register(&self, nonce: &str, path: &Path) {
        let previous = self
            .entries
            .write()
            .await
            .insert(nonce.to_string(), path.to_path_buf());
        if let Some(previous) = previous {
            debug!(nonce = %nonce, previous = %previous.display(), "Nonce reused, replacing registry entry");
        }
    }

    /// Workspace currently registered for `nonce`.
    pub async fn lookup(&self, nonce: &str) -> Option<PathBuf> {
        self.entries.read().await.get(nonce).cloned()
    }

    /// Remove the entry for `nonce` if it still points at `path`.
    ///
    /// Returns whether an entry was removed.
    pub async fn evict(&self, nonce: &str, path: &Path) -> bool {
        remove_if_current(&mut *self.entries.write().await, nonce, path)
    }

    /// [`evict`](Self::evict) without waiting, for synchronous drop paths.
    ///
    /// Returns `None` when the map is currently locked.
    pub fn try_evict(&self, nonce: &str, path: &Path) -> Option<bool> {
        let mut entries = self.entries.try_write().ok()?;
        Some(remove_if_current(&mut entries, nonce, path))
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn remove_if_current(entries: &mut HashMap<String, PathBuf>, nonce: &str, path: &Path) -> bool {
    if entries.get(nonce).is_some_and(|current| current == path) {
        entries.remove(nonce);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_lookup() {
        let registry = JobRegistry::new();
        registry.register("abc", Path::new("/tmp/abc_1")).await;
        assert_eq!(registry.lookup("abc").await, Some(PathBuf::from("/tmp/abc_1")));
        assert_eq!(registry.lookup("other").await, None);
    }

    #[tokio::test]
    async fn evict_removes_matching_entry() {
        let registry = JobRegistry::new();
        registry.register("abc", Path::new("/tmp/abc_1")).await;
        assert!(registry.evict("abc", Path::new("/tmp/abc_1")).await);
        assert_eq!(registry.lookup("abc").await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let registry = JobRegistry::new();
        registry.register("abc", Path::new("/tmp/abc_1")).await;
        assert!(registry.evict("abc", Path::new("/tmp/abc_1")).await);
        assert!(!registry.evict("abc", Path::new("/tmp/abc_1")).await);
    }

    #[tokio::test]
    async fn try_evict_backs_off_while_locked() {
        let registry = JobRegistry::new();
        registry.register("abc", Path::new("/tmp/abc_1")).await;

        let guard = registry.entries.read().await;
        assert_eq!(registry.try_evict("abc", Path::new("/tmp/abc_1")), None);
        drop(guard);

        assert_eq!(registry.try_evict("abc", Path::new("/tmp/abc_1")), Some(true));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn reused_nonce_survives_older_eviction() {
        let registry = JobRegistry::new();
        registry.register("abc", Path::new("/tmp/abc_1")).await;
        registry.register("abc", Path::new("/tmp/abc_2")).await;
        assert_eq!(registry.len().await, 1);

        assert!(!registry.evict("abc", Path::new("/tmp/abc_1")).await);
        assert_eq!(registry.lookup("abc").await, Some(PathBuf::from("/tmp/abc_2")));
    }

    #[tokio::test]
    async fn concurrent_registrations() {
        let registry = std::sync::Arc::new(JobRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = std::sync::Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let nonce = format!("n{i}");
                let path = PathBuf::from(format!("/tmp/{nonce}_x"));
                registry.register(&nonce, &path).await;
                assert_eq!(registry.lookup(&nonce).await, Some(path));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len().await, 32);
    }
}
