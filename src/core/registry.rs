//! In-process registry of control handles for running downloads
//!
//! Handles live only in memory. After a restart the registry is empty and
//! the engine falls back to the persisted status.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::core::error_handling::ChunkError;

/// Shared pause/cancel flags for one download and its workers
#[derive(Debug, Default)]
pub struct ControlHandle {
    paused: AtomicBool,
    cancelled: AtomicBool,
    merging: AtomicBool,
    completed_chunks: AtomicUsize,
    notify: Notify,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Set once every chunk is done; pausing is refused from here on
    pub fn begin_merge(&self) {
        self.merging.store(true, Ordering::SeqCst);
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::SeqCst)
    }

    /// Returns the new count
    pub fn mark_chunk_completed(&self) -> usize {
        self.completed_chunks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn completed_chunks(&self) -> usize {
        self.completed_chunks.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            // 先注册等待者再检查标志，避免错过通知
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Block while paused. Fails with `Cancelled` if cancelled meanwhile.
    pub async fn wait_while_paused(&self) -> Result<(), ChunkError> {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return Err(ChunkError::Cancelled);
            }
            if !self.is_paused() {
                return Ok(());
            }
            notified.await;
        }
    }
}

/// Concurrency-safe table of control handles keyed by download id
#[derive(Debug, Default)]
pub struct DownloadRegistry {
    handles: DashMap<String, Arc<ControlHandle>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert only if no handle is registered for `id`
    pub fn try_register(&self, id: &str, handle: Arc<ControlHandle>) -> bool {
        match self.handles.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ControlHandle>> {
        self.handles.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the entry only if it still holds `handle`
    pub fn unregister_if(&self, id: &str, handle: &Arc<ControlHandle>) -> bool {
        self.handles
            .remove_if(id, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_get_unregister() {
        let registry = DownloadRegistry::new();
        let handle = Arc::new(ControlHandle::new());

        assert!(registry.try_register("a", Arc::clone(&handle)));
        assert!(registry.contains("a"));
        assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &handle));

        assert!(registry.unregister_if("a", &handle));
        assert!(registry.get("a").is_none());
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_try_register_keeps_existing() {
        let registry = DownloadRegistry::new();
        let first = Arc::new(ControlHandle::new());
        let second = Arc::new(ControlHandle::new());

        assert!(registry.try_register("a", Arc::clone(&first)));
        assert!(!registry.try_register("a", second));
        assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &first));
    }

    #[test]
    fn test_unregister_if_ignores_other_handle() {
        let registry = DownloadRegistry::new();
        let current = Arc::new(ControlHandle::new());
        let stale = Arc::new(ControlHandle::new());
        assert!(registry.try_register("a", Arc::clone(&current)));

        assert!(!registry.unregister_if("a", &stale));
        assert!(registry.contains("a"));
        assert!(registry.unregister_if("a", &current));
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_merge_flag() {
        let handle = ControlHandle::new();
        assert!(!handle.is_merging());
        handle.begin_merge();
        assert!(handle.is_merging());
        assert!(!handle.is_paused());
    }

    #[test]
    fn test_completed_counter() {
        let handle = ControlHandle::new();
        assert_eq!(handle.mark_chunk_completed(), 1);
        assert_eq!(handle.mark_chunk_completed(), 2);
        assert_eq!(handle.completed_chunks(), 2);
    }

    #[tokio::test]
    async fn test_resume_wakes_paused_waiter() {
        let handle = Arc::new(ControlHandle::new());
        handle.pause();

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_while_paused().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        handle.resume();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_wakes_paused_waiter() {
        let handle = Arc::new(ControlHandle::new());
        handle.pause();

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_while_paused().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChunkError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let handle = Arc::new(ControlHandle::new());
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.cancelled().await })
        };

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
