//! Builder pattern for `AudioRouter`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::adapter::{CompletionSender, DomainAdapter};
use crate::config::RouterConfig;
use crate::error::RoutingError;
use crate::event::{event_callback, EventCallback, TopologyEvent};
use crate::ids::EntityKind;
use crate::persistence::PersistenceBackend;
use crate::reactor::Reactor;
use crate::routing::RoutePlanner;
use crate::session::Session;
use crate::topology::TopologyStore;

/// Entry point for building a router.
///
/// # Example
///
/// ```ignore
/// use route_audio::{AudioRouter, MockDomainAdapter, RouterConfig};
///
/// let session = AudioRouter::builder()
///     .with_config(RouterConfig::default())
///     .add_adapter(MockDomainAdapter::new("bus.cabin"))
///     .on_event(|event| tracing::info!(?event, "topology changed"))
///     .start()
///     .await?;
/// ```
pub struct AudioRouter;

impl AudioRouter {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn builder() -> AudioRouterBuilder {
        AudioRouterBuilder::new()
    }
}

/// Builder for a running router [`Session`].
pub struct AudioRouterBuilder {
    config: RouterConfig,
    adapters: Vec<Arc<dyn DomainAdapter>>,
    callbacks: Vec<EventCallback>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
}

impl Default for AudioRouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRouterBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
            adapters: Vec::new(),
            callbacks: Vec::new(),
            persistence: None,
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a domain adapter.
    ///
    /// Domains registered later are bound to adapters by bus name; every
    /// bus name may appear once.
    #[must_use]
    pub fn add_adapter<A: DomainAdapter + 'static>(mut self, adapter: A) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    /// Registers a topology change observer from a closure.
    ///
    /// Callbacks run on the reactor thread in mutation order and must not
    /// block.
    #[must_use]
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TopologyEvent) + Send + Sync + 'static,
    {
        self.callbacks.push(event_callback(callback));
        self
    }

    /// Registers a pre-built observer such as
    /// [`channel_events`](crate::channel_events).
    #[must_use]
    pub fn subscribe(mut self, callback: EventCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Sets the persistence backend for restore-at-start and
    /// snapshot-at-stop.
    #[must_use]
    pub fn with_persistence<P: PersistenceBackend + 'static>(mut self, backend: P) -> Self {
        self.persistence = Some(Arc::new(backend));
        self
    }

    /// Starts the router.
    ///
    /// Restores the last known topology from the persistence backend (if
    /// any), starts every adapter, spawns the reactor task and returns the
    /// [`Session`] controlling it.
    ///
    /// # Errors
    ///
    /// Fails on duplicate adapter bus names, on a persistence restore
    /// error, and on a corrupt snapshot clashing with itself.
    pub async fn start(self) -> Result<Session, RoutingError> {
        let mut store = TopologyStore::new();
        for callback in self.callbacks {
            store.subscribe(callback);
        }

        if let Some(backend) = &self.persistence {
            match backend.restore().await {
                Ok(Some(snapshot)) => {
                    tracing::info!(
                        domains = snapshot.domains.len(),
                        sources = snapshot.sources.len(),
                        sinks = snapshot.sinks.len(),
                        "restoring last known topology"
                    );
                    store.restore(snapshot)?;
                }
                Ok(None) => {}
                Err(err) => return Err(RoutingError::Persistence(err)),
            }
        }

        let mut planner = RoutePlanner::new(self.config.max_path_hops);
        planner.rebuild(&store);

        let mut adapters: HashMap<String, Arc<dyn DomainAdapter>> = HashMap::new();
        for adapter in &self.adapters {
            let bus_name = adapter.bus_name().to_string();
            if adapters.insert(bus_name.clone(), adapter.clone()).is_some() {
                tracing::error!(bus_name, "duplicate adapter bus name");
                return Err(RoutingError::AlreadyExists {
                    kind: EntityKind::Domain,
                    id: 0,
                });
            }
        }

        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity);
        let (completion_tx, completion_rx) = mpsc::channel(self.config.completion_capacity);

        let startups = self
            .adapters
            .iter()
            .map(|adapter| adapter.on_startup(CompletionSender::new(completion_tx.clone())));
        futures::future::join_all(startups).await;

        let reactor = Reactor::new(
            store,
            planner,
            adapters,
            command_rx,
            completion_rx,
            completion_tx,
            self.persistence,
            self.config,
        );
        let handle = tokio::spawn(reactor.run());
        Ok(Session::new(command_tx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockDomainAdapter;
    use crate::error::PersistenceError;
    use crate::persistence::MemoryBackend;
    use crate::topology::TopologySnapshot;
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_start_with_no_adapters() {
        let session = AudioRouter::builder().start().await.unwrap();
        assert!(session.domains().await.unwrap().is_empty());
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_bus_name_rejected() {
        let result = AudioRouter::builder()
            .add_adapter(MockDomainAdapter::new("bus.same"))
            .add_adapter(MockDomainAdapter::new("bus.same"))
            .start()
            .await;
        assert!(matches!(result, Err(RoutingError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_restore_failure_surfaces() {
        struct FailingBackend;

        #[async_trait]
        impl PersistenceBackend for FailingBackend {
            async fn restore(&self) -> Result<Option<TopologySnapshot>, PersistenceError> {
                Err(PersistenceError::custom("flash worn out"))
            }

            async fn snapshot(
                &self,
                _topology: &TopologySnapshot,
            ) -> Result<(), PersistenceError> {
                Ok(())
            }
        }

        let result = AudioRouter::builder()
            .with_persistence(FailingBackend)
            .start()
            .await;
        assert!(matches!(result, Err(RoutingError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_empty_backend_starts_clean() {
        let session = AudioRouter::builder()
            .with_persistence(MemoryBackend::new())
            .start()
            .await
            .unwrap();
        assert!(session.snapshot().await.unwrap().is_empty());
        session.stop().await.unwrap();
    }
}
