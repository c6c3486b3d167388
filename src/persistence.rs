//! Last-known-topology persistence.
//!
//! The routing core treats persistence as an opaque load/store contract: a
//! [`PersistenceBackend`] is asked for the last known topology once at
//! startup and handed the current topology once at graceful shutdown. The
//! serialized format is entirely the backend's business. Persistence
//! failures are surfaced but never change routing behavior.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PersistenceError;
use crate::topology::TopologySnapshot;

/// Stores and recalls the last known topology.
///
/// # Example
///
/// ```
/// use route_audio::{PersistenceBackend, PersistenceError, TopologySnapshot};
/// use async_trait::async_trait;
///
/// struct NullBackend;
///
/// #[async_trait]
/// impl PersistenceBackend for NullBackend {
///     async fn restore(&self) -> Result<Option<TopologySnapshot>, PersistenceError> {
///         Ok(None)
///     }
///
///     async fn snapshot(&self, _topology: &TopologySnapshot) -> Result<(), PersistenceError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Loads the last known topology, or `None` on first start.
    async fn restore(&self) -> Result<Option<TopologySnapshot>, PersistenceError>;

    /// Stores the current topology.
    async fn snapshot(&self, topology: &TopologySnapshot) -> Result<(), PersistenceError>;
}

/// An in-memory backend, useful for tests and embedders that persist
/// elsewhere.
///
/// Clones share storage, so a test can keep one clone while the router
/// owns the other and inspect what `stop()` persisted.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    stored: std::sync::Arc<Mutex<Option<TopologySnapshot>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-seeded with a snapshot to restore.
    #[must_use]
    pub fn with_snapshot(snapshot: TopologySnapshot) -> Self {
        Self {
            stored: std::sync::Arc::new(Mutex::new(Some(snapshot))),
        }
    }

    /// The currently stored snapshot, if any.
    #[must_use]
    pub fn stored(&self) -> Option<TopologySnapshot> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn restore(&self) -> Result<Option<TopologySnapshot>, PersistenceError> {
        Ok(self.stored.lock().clone())
    }

    async fn snapshot(&self, topology: &TopologySnapshot) -> Result<(), PersistenceError> {
        *self.stored.lock() = Some(topology.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        assert!(backend.restore().await.unwrap().is_none());

        let snapshot = TopologySnapshot::default();
        backend.snapshot(&snapshot).await.unwrap();
        assert_eq!(backend.restore().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_memory_backend_seeded() {
        let backend = MemoryBackend::with_snapshot(TopologySnapshot::default());
        assert!(backend.restore().await.unwrap().is_some());
    }
}
