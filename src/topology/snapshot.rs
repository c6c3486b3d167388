//! Last-known topology for the persistence collaborator.

use crate::topology::entities::{Converter, Crossfader, Domain, Gateway, Sink, Source};

/// The durable part of the topology: registered entities with their last
/// known volumes, states and properties.
///
/// Live connections and main connections are deliberately absent - routes
/// are re-established after a restart, not replayed. The serialized format
/// is owned by the [`PersistenceBackend`](crate::PersistenceBackend); this
/// type is only the in-memory contract.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologySnapshot {
    /// Registered domains.
    pub domains: Vec<Domain>,
    /// Registered sources.
    pub sources: Vec<Source>,
    /// Registered sinks.
    pub sinks: Vec<Sink>,
    /// Registered gateways.
    pub gateways: Vec<Gateway>,
    /// Registered converters.
    pub converters: Vec<Converter>,
    /// Registered crossfaders.
    pub crossfaders: Vec<Crossfader>,
}

impl TopologySnapshot {
    /// Returns `true` if the snapshot contains no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
            && self.sources.is_empty()
            && self.sinks.is_empty()
            && self.gateways.is_empty()
            && self.converters.is_empty()
            && self.crossfaders.is_empty()
    }
}
