//! The topology database.
//!
//! [`TopologyStore`] owns every entity record and enforces referential
//! integrity. It is exclusively owned by the reactor task; no locking, no
//! interior mutability. Every successful mutation synchronously emits one
//! change notification per affected entity, in mutation order, before the
//! mutating call returns.

use std::collections::BTreeMap;

use crate::error::RoutingError;
use crate::event::{EventCallback, TopologyEvent};
use crate::format::ConnectionFormat;
use crate::ids::{
    ConnectionId, ConverterId, CrossfaderId, DomainId, EntityKind, GatewayId, MainConnectionId,
    SinkId, SourceId,
};
use crate::topology::entities::*;
use crate::topology::snapshot::TopologySnapshot;

/// Dynamically assigned ids start here; lower values are reserved for
/// statically configured entities.
const DYNAMIC_ID_BASE: u16 = 100;

/// The live graph of routable entities and their relationships.
pub struct TopologyStore {
    domains: BTreeMap<DomainId, Domain>,
    sources: BTreeMap<SourceId, Source>,
    sinks: BTreeMap<SinkId, Sink>,
    gateways: BTreeMap<GatewayId, Gateway>,
    converters: BTreeMap<ConverterId, Converter>,
    crossfaders: BTreeMap<CrossfaderId, Crossfader>,
    connections: BTreeMap<ConnectionId, Connection>,
    main_connections: BTreeMap<MainConnectionId, MainConnection>,
    next_id: [u16; 8],
    observers: Vec<EventCallback>,
}

/// Index into `next_id` per entity kind.
fn kind_slot(kind: EntityKind) -> usize {
    match kind {
        EntityKind::Domain => 0,
        EntityKind::Source => 1,
        EntityKind::Sink => 2,
        EntityKind::Gateway => 3,
        EntityKind::Converter => 4,
        EntityKind::Crossfader => 5,
        EntityKind::Connection => 6,
        EntityKind::MainConnection => 7,
    }
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            domains: BTreeMap::new(),
            sources: BTreeMap::new(),
            sinks: BTreeMap::new(),
            gateways: BTreeMap::new(),
            converters: BTreeMap::new(),
            crossfaders: BTreeMap::new(),
            connections: BTreeMap::new(),
            main_connections: BTreeMap::new(),
            next_id: [DYNAMIC_ID_BASE; 8],
            observers: Vec::new(),
        }
    }

    /// Registers a change observer.
    ///
    /// Observers are invoked synchronously on the reactor thread for every
    /// mutation, in subscription order, and must not block.
    pub fn subscribe(&mut self, callback: EventCallback) {
        self.observers.push(callback);
    }

    fn emit(&self, event: TopologyEvent) {
        for observer in &self.observers {
            observer(&event);
        }
    }

    fn emit_all(&self, events: Vec<TopologyEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Picks the next free dynamic id for `kind`, given an occupancy probe.
    fn alloc_id(
        &mut self,
        kind: EntityKind,
        taken: impl Fn(&Self, u16) -> bool,
    ) -> Result<u16, RoutingError> {
        let slot = kind_slot(kind);
        let start = self.next_id[slot].max(DYNAMIC_ID_BASE);
        let mut candidate = start;
        loop {
            if !taken(self, candidate) {
                self.next_id[slot] = candidate.checked_add(1).unwrap_or(DYNAMIC_ID_BASE);
                return Ok(candidate);
            }
            candidate = candidate.checked_add(1).unwrap_or(DYNAMIC_ID_BASE);
            if candidate == start {
                return Err(RoutingError::Conflict {
                    kind,
                    id: 0,
                    dependents: usize::from(u16::MAX),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Domains
    // -----------------------------------------------------------------------

    /// Registers a domain.
    pub fn register_domain(&mut self, data: DomainData) -> Result<DomainId, RoutingError> {
        let id = match data.id.filter(|id| !id.is_unset()) {
            Some(id) => {
                if self.domains.contains_key(&id) {
                    return Err(RoutingError::AlreadyExists {
                        kind: EntityKind::Domain,
                        id: id.raw(),
                    });
                }
                id
            }
            None => DomainId(
                self.alloc_id(EntityKind::Domain, |s, id| {
                    s.domains.contains_key(&DomainId(id))
                })?,
            ),
        };
        self.domains.insert(
            id,
            Domain {
                id,
                name: data.name,
                bus_name: data.bus_name,
                node_name: data.node_name,
                early: data.early,
                complete: false,
                state: data.state,
            },
        );
        self.emit(TopologyEvent::DomainRegistered { id });
        Ok(id)
    }

    /// Marks a domain's registration as complete.
    pub fn set_domain_complete(&mut self, id: DomainId) -> Result<(), RoutingError> {
        let domain = self.domains.get_mut(&id).ok_or(RoutingError::NotFound {
            kind: EntityKind::Domain,
            id: id.raw(),
        })?;
        domain.complete = true;
        Ok(())
    }

    /// Updates a domain's lifecycle state.
    pub fn set_domain_state(
        &mut self,
        id: DomainId,
        state: DomainState,
    ) -> Result<(), RoutingError> {
        let domain = self.domains.get_mut(&id).ok_or(RoutingError::NotFound {
            kind: EntityKind::Domain,
            id: id.raw(),
        })?;
        if domain.state != state {
            domain.state = state;
            self.emit(TopologyEvent::DomainStateChanged { id, state });
        }
        Ok(())
    }

    /// Deregisters a domain.
    ///
    /// Without `cascade`, fails with `Conflict` while the domain still owns
    /// sources, sinks, converters or crossfaders, or participates in
    /// gateways. With `cascade`, all dependents (including connections and
    /// main connections routed through them) are removed first, emitting
    /// one notification per removed entity.
    pub fn deregister_domain(&mut self, id: DomainId, cascade: bool) -> Result<(), RoutingError> {
        if !self.domains.contains_key(&id) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Domain,
                id: id.raw(),
            });
        }

        let sources: Vec<SourceId> = self
            .sources
            .values()
            .filter(|s| s.domain == id)
            .map(|s| s.id)
            .collect();
        let sinks: Vec<SinkId> = self
            .sinks
            .values()
            .filter(|s| s.domain == id)
            .map(|s| s.id)
            .collect();
        let converters: Vec<ConverterId> = self
            .converters
            .values()
            .filter(|c| c.domain == id)
            .map(|c| c.id)
            .collect();
        let gateways: Vec<GatewayId> = self
            .gateways
            .values()
            .filter(|g| {
                g.ingress_domain == id || g.egress_domain == id || g.control_domain == id
            })
            .map(|g| g.id)
            .collect();
        let crossfaders: Vec<CrossfaderId> = self
            .crossfaders
            .values()
            .filter(|c| {
                sources.contains(&c.source)
                    || sinks.contains(&c.sink_a)
                    || sinks.contains(&c.sink_b)
            })
            .map(|c| c.id)
            .collect();
        let mut connections: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| sources.contains(&c.source) || sinks.contains(&c.sink))
            .map(|c| c.id)
            .collect();
        let main_connections: Vec<MainConnectionId> = self
            .main_connections
            .values()
            .filter(|mc| {
                sources.contains(&mc.source)
                    || sinks.contains(&mc.sink)
                    || mc.connections.iter().any(|c| connections.contains(c))
            })
            .map(|mc| mc.id)
            .collect();
        // A path routed through this domain dies whole: constituents in
        // surviving domains go too.
        for mc in &main_connections {
            if let Some(mc) = self.main_connections.get(mc) {
                for conn in &mc.connections {
                    if !connections.contains(conn) {
                        connections.push(*conn);
                    }
                }
            }
        }

        let dependents = sources.len()
            + sinks.len()
            + converters.len()
            + gateways.len()
            + crossfaders.len()
            + connections.len()
            + main_connections.len();
        if dependents > 0 && !cascade {
            return Err(RoutingError::Conflict {
                kind: EntityKind::Domain,
                id: id.raw(),
                dependents,
            });
        }

        let mut events = Vec::with_capacity(dependents + 1);
        for mc in main_connections {
            self.main_connections.remove(&mc);
            events.push(TopologyEvent::MainConnectionRemoved { id: mc });
        }
        for conn in connections {
            self.connections.remove(&conn);
            events.push(TopologyEvent::ConnectionRemoved { id: conn });
        }
        for crossfader in crossfaders {
            self.crossfaders.remove(&crossfader);
            events.push(TopologyEvent::CrossfaderRemoved { id: crossfader });
        }
        for converter in converters {
            self.converters.remove(&converter);
            events.push(TopologyEvent::ConverterRemoved { id: converter });
        }
        for gateway in gateways {
            self.gateways.remove(&gateway);
            events.push(TopologyEvent::GatewayRemoved { id: gateway });
        }
        for source in sources {
            self.sources.remove(&source);
            events.push(TopologyEvent::SourceRemoved { id: source });
        }
        for sink in sinks {
            self.sinks.remove(&sink);
            events.push(TopologyEvent::SinkRemoved { id: sink });
        }
        self.domains.remove(&id);
        events.push(TopologyEvent::DomainRemoved { id });
        self.emit_all(events);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Registers a source.
    pub fn register_source(&mut self, data: SourceData) -> Result<SourceId, RoutingError> {
        if !self.domains.contains_key(&data.domain) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Domain,
                id: data.domain.raw(),
            });
        }
        let id = match data.id.filter(|id| !id.is_unset()) {
            Some(id) => {
                if self.sources.contains_key(&id) {
                    return Err(RoutingError::AlreadyExists {
                        kind: EntityKind::Source,
                        id: id.raw(),
                    });
                }
                id
            }
            None => SourceId(
                self.alloc_id(EntityKind::Source, |s, id| {
                    s.sources.contains_key(&SourceId(id))
                })?,
            ),
        };
        let domain = data.domain;
        self.sources.insert(
            id,
            Source {
                id,
                domain,
                class_id: data.class_id,
                name: data.name,
                volume: data.volume,
                visible: data.visible,
                availability: data.availability,
                state: data.state,
                formats: data.formats,
                sound_properties: data.sound_properties,
                notification_configurations: data.notification_configurations,
            },
        );
        self.emit(TopologyEvent::SourceRegistered { id, domain });
        Ok(id)
    }

    /// Deregisters a source.
    pub fn deregister_source(&mut self, id: SourceId, cascade: bool) -> Result<(), RoutingError> {
        if !self.sources.contains_key(&id) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Source,
                id: id.raw(),
            });
        }
        let gateways: Vec<GatewayId> = self
            .gateways
            .values()
            .filter(|g| g.egress_source == id)
            .map(|g| g.id)
            .collect();
        let converters: Vec<ConverterId> = self
            .converters
            .values()
            .filter(|c| c.egress_source == id)
            .map(|c| c.id)
            .collect();
        let crossfaders: Vec<CrossfaderId> = self
            .crossfaders
            .values()
            .filter(|c| c.source == id)
            .map(|c| c.id)
            .collect();
        let mut connections: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.source == id)
            .map(|c| c.id)
            .collect();
        let main_connections: Vec<MainConnectionId> = self
            .main_connections
            .values()
            .filter(|mc| {
                mc.source == id || mc.connections.iter().any(|c| connections.contains(c))
            })
            .map(|mc| mc.id)
            .collect();
        for mc in &main_connections {
            if let Some(mc) = self.main_connections.get(mc) {
                for conn in &mc.connections {
                    if !connections.contains(conn) {
                        connections.push(*conn);
                    }
                }
            }
        }

        let dependents = gateways.len()
            + converters.len()
            + crossfaders.len()
            + connections.len()
            + main_connections.len();
        if dependents > 0 && !cascade {
            return Err(RoutingError::Conflict {
                kind: EntityKind::Source,
                id: id.raw(),
                dependents,
            });
        }

        let mut events = Vec::with_capacity(dependents + 1);
        for mc in main_connections {
            self.main_connections.remove(&mc);
            events.push(TopologyEvent::MainConnectionRemoved { id: mc });
        }
        for conn in connections {
            self.connections.remove(&conn);
            events.push(TopologyEvent::ConnectionRemoved { id: conn });
        }
        for crossfader in crossfaders {
            self.crossfaders.remove(&crossfader);
            events.push(TopologyEvent::CrossfaderRemoved { id: crossfader });
        }
        for converter in converters {
            self.converters.remove(&converter);
            events.push(TopologyEvent::ConverterRemoved { id: converter });
        }
        for gateway in gateways {
            self.gateways.remove(&gateway);
            events.push(TopologyEvent::GatewayRemoved { id: gateway });
        }
        self.sources.remove(&id);
        events.push(TopologyEvent::SourceRemoved { id });
        self.emit_all(events);
        Ok(())
    }

    fn source_mut(&mut self, id: SourceId) -> Result<&mut Source, RoutingError> {
        self.sources.get_mut(&id).ok_or(RoutingError::NotFound {
            kind: EntityKind::Source,
            id: id.raw(),
        })
    }

    /// Updates a source's runtime state.
    pub fn set_source_state(
        &mut self,
        id: SourceId,
        state: SourceState,
    ) -> Result<(), RoutingError> {
        let source = self.source_mut(id)?;
        if source.state != state {
            source.state = state;
            self.emit(TopologyEvent::SourceStateChanged { id, state });
        }
        Ok(())
    }

    /// Updates a source's volume.
    pub fn set_source_volume(&mut self, id: SourceId, volume: i16) -> Result<(), RoutingError> {
        let source = self.source_mut(id)?;
        source.volume = volume;
        self.emit(TopologyEvent::SourceVolumeChanged { id, volume });
        Ok(())
    }

    /// Updates a source's availability.
    pub fn set_source_availability(
        &mut self,
        id: SourceId,
        availability: Availability,
    ) -> Result<(), RoutingError> {
        let source = self.source_mut(id)?;
        if source.availability != availability {
            source.availability = availability;
            self.emit(TopologyEvent::SourceAvailabilityChanged { id, availability });
        }
        Ok(())
    }

    /// Updates (or adds) a sound property on a source.
    pub fn set_source_sound_property(
        &mut self,
        id: SourceId,
        property: SoundProperty,
    ) -> Result<(), RoutingError> {
        let source = self.source_mut(id)?;
        match source
            .sound_properties
            .iter_mut()
            .find(|p| p.kind == property.kind)
        {
            Some(existing) => *existing = property,
            None => source.sound_properties.push(property),
        }
        self.emit(TopologyEvent::SourceSoundPropertyChanged { id, property });
        Ok(())
    }

    /// Updates (or adds) a notification configuration on a source.
    pub fn set_source_notification(
        &mut self,
        id: SourceId,
        configuration: NotificationConfiguration,
    ) -> Result<(), RoutingError> {
        let source = self.source_mut(id)?;
        match source
            .notification_configurations
            .iter_mut()
            .find(|c| c.kind == configuration.kind)
        {
            Some(existing) => *existing = configuration,
            None => source.notification_configurations.push(configuration),
        }
        self.emit(TopologyEvent::SourceNotificationChanged { id, configuration });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sinks
    // -----------------------------------------------------------------------

    /// Registers a sink.
    pub fn register_sink(&mut self, data: SinkData) -> Result<SinkId, RoutingError> {
        if !self.domains.contains_key(&data.domain) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Domain,
                id: data.domain.raw(),
            });
        }
        let id = match data.id.filter(|id| !id.is_unset()) {
            Some(id) => {
                if self.sinks.contains_key(&id) {
                    return Err(RoutingError::AlreadyExists {
                        kind: EntityKind::Sink,
                        id: id.raw(),
                    });
                }
                id
            }
            None => SinkId(
                self.alloc_id(EntityKind::Sink, |s, id| s.sinks.contains_key(&SinkId(id)))?,
            ),
        };
        let domain = data.domain;
        self.sinks.insert(
            id,
            Sink {
                id,
                domain,
                class_id: data.class_id,
                name: data.name,
                volume: data.volume,
                main_volume: data.main_volume,
                visible: data.visible,
                availability: data.availability,
                mute_state: data.mute_state,
                formats: data.formats,
                sound_properties: data.sound_properties,
                notification_configurations: data.notification_configurations,
            },
        );
        self.emit(TopologyEvent::SinkRegistered { id, domain });
        Ok(id)
    }

    /// Deregisters a sink.
    pub fn deregister_sink(&mut self, id: SinkId, cascade: bool) -> Result<(), RoutingError> {
        if !self.sinks.contains_key(&id) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Sink,
                id: id.raw(),
            });
        }
        let gateways: Vec<GatewayId> = self
            .gateways
            .values()
            .filter(|g| g.ingress_sink == id)
            .map(|g| g.id)
            .collect();
        let converters: Vec<ConverterId> = self
            .converters
            .values()
            .filter(|c| c.ingress_sink == id)
            .map(|c| c.id)
            .collect();
        let crossfaders: Vec<CrossfaderId> = self
            .crossfaders
            .values()
            .filter(|c| c.sink_a == id || c.sink_b == id)
            .map(|c| c.id)
            .collect();
        let mut connections: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.sink == id)
            .map(|c| c.id)
            .collect();
        let main_connections: Vec<MainConnectionId> = self
            .main_connections
            .values()
            .filter(|mc| mc.sink == id || mc.connections.iter().any(|c| connections.contains(c)))
            .map(|mc| mc.id)
            .collect();
        for mc in &main_connections {
            if let Some(mc) = self.main_connections.get(mc) {
                for conn in &mc.connections {
                    if !connections.contains(conn) {
                        connections.push(*conn);
                    }
                }
            }
        }

        let dependents = gateways.len()
            + converters.len()
            + crossfaders.len()
            + connections.len()
            + main_connections.len();
        if dependents > 0 && !cascade {
            return Err(RoutingError::Conflict {
                kind: EntityKind::Sink,
                id: id.raw(),
                dependents,
            });
        }

        let mut events = Vec::with_capacity(dependents + 1);
        for mc in main_connections {
            self.main_connections.remove(&mc);
            events.push(TopologyEvent::MainConnectionRemoved { id: mc });
        }
        for conn in connections {
            self.connections.remove(&conn);
            events.push(TopologyEvent::ConnectionRemoved { id: conn });
        }
        for crossfader in crossfaders {
            self.crossfaders.remove(&crossfader);
            events.push(TopologyEvent::CrossfaderRemoved { id: crossfader });
        }
        for converter in converters {
            self.converters.remove(&converter);
            events.push(TopologyEvent::ConverterRemoved { id: converter });
        }
        for gateway in gateways {
            self.gateways.remove(&gateway);
            events.push(TopologyEvent::GatewayRemoved { id: gateway });
        }
        self.sinks.remove(&id);
        events.push(TopologyEvent::SinkRemoved { id });
        self.emit_all(events);
        Ok(())
    }

    fn sink_mut(&mut self, id: SinkId) -> Result<&mut Sink, RoutingError> {
        self.sinks.get_mut(&id).ok_or(RoutingError::NotFound {
            kind: EntityKind::Sink,
            id: id.raw(),
        })
    }

    /// Updates a sink's volume.
    pub fn set_sink_volume(&mut self, id: SinkId, volume: i16) -> Result<(), RoutingError> {
        let sink = self.sink_mut(id)?;
        sink.volume = volume;
        self.emit(TopologyEvent::SinkVolumeChanged { id, volume });
        Ok(())
    }

    /// Updates a sink's mute state.
    pub fn set_sink_mute_state(
        &mut self,
        id: SinkId,
        mute_state: MuteState,
    ) -> Result<(), RoutingError> {
        let sink = self.sink_mut(id)?;
        if sink.mute_state != mute_state {
            sink.mute_state = mute_state;
            self.emit(TopologyEvent::SinkMuteChanged { id, mute_state });
        }
        Ok(())
    }

    /// Updates a sink's availability.
    pub fn set_sink_availability(
        &mut self,
        id: SinkId,
        availability: Availability,
    ) -> Result<(), RoutingError> {
        let sink = self.sink_mut(id)?;
        if sink.availability != availability {
            sink.availability = availability;
            self.emit(TopologyEvent::SinkAvailabilityChanged { id, availability });
        }
        Ok(())
    }

    /// Updates (or adds) a sound property on a sink.
    pub fn set_sink_sound_property(
        &mut self,
        id: SinkId,
        property: SoundProperty,
    ) -> Result<(), RoutingError> {
        let sink = self.sink_mut(id)?;
        match sink
            .sound_properties
            .iter_mut()
            .find(|p| p.kind == property.kind)
        {
            Some(existing) => *existing = property,
            None => sink.sound_properties.push(property),
        }
        self.emit(TopologyEvent::SinkSoundPropertyChanged { id, property });
        Ok(())
    }

    /// Updates (or adds) a notification configuration on a sink.
    pub fn set_sink_notification(
        &mut self,
        id: SinkId,
        configuration: NotificationConfiguration,
    ) -> Result<(), RoutingError> {
        let sink = self.sink_mut(id)?;
        match sink
            .notification_configurations
            .iter_mut()
            .find(|c| c.kind == configuration.kind)
        {
            Some(existing) => *existing = configuration,
            None => sink.notification_configurations.push(configuration),
        }
        self.emit(TopologyEvent::SinkNotificationChanged { id, configuration });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Gateways, converters, crossfaders
    // -----------------------------------------------------------------------

    /// Registers a gateway.
    ///
    /// The ingress sink must already be registered in the ingress domain
    /// and the egress source in the egress domain.
    pub fn register_gateway(&mut self, data: GatewayData) -> Result<GatewayId, RoutingError> {
        for domain in [data.ingress_domain, data.egress_domain, data.control_domain] {
            if !self.domains.contains_key(&domain) {
                return Err(RoutingError::NotFound {
                    kind: EntityKind::Domain,
                    id: domain.raw(),
                });
            }
        }
        if self
            .sinks
            .get(&data.ingress_sink)
            .filter(|s| s.domain == data.ingress_domain)
            .is_none()
        {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Sink,
                id: data.ingress_sink.raw(),
            });
        }
        if self
            .sources
            .get(&data.egress_source)
            .filter(|s| s.domain == data.egress_domain)
            .is_none()
        {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Source,
                id: data.egress_source.raw(),
            });
        }
        let id = match data.id.filter(|id| !id.is_unset()) {
            Some(id) => {
                if self.gateways.contains_key(&id) {
                    return Err(RoutingError::AlreadyExists {
                        kind: EntityKind::Gateway,
                        id: id.raw(),
                    });
                }
                id
            }
            None => GatewayId(
                self.alloc_id(EntityKind::Gateway, |s, id| {
                    s.gateways.contains_key(&GatewayId(id))
                })?,
            ),
        };
        self.gateways.insert(
            id,
            Gateway {
                id,
                name: data.name,
                ingress_sink: data.ingress_sink,
                egress_source: data.egress_source,
                ingress_domain: data.ingress_domain,
                egress_domain: data.egress_domain,
                control_domain: data.control_domain,
                matrix: data.matrix,
                weight: data.weight.max(1),
            },
        );
        self.emit(TopologyEvent::GatewayRegistered { id });
        Ok(id)
    }

    /// Deregisters a gateway.
    pub fn deregister_gateway(&mut self, id: GatewayId) -> Result<(), RoutingError> {
        if self.gateways.remove(&id).is_none() {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Gateway,
                id: id.raw(),
            });
        }
        self.emit(TopologyEvent::GatewayRemoved { id });
        Ok(())
    }

    /// Registers a converter.
    pub fn register_converter(&mut self, data: ConverterData) -> Result<ConverterId, RoutingError> {
        if !self.domains.contains_key(&data.domain) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Domain,
                id: data.domain.raw(),
            });
        }
        if self
            .sinks
            .get(&data.ingress_sink)
            .filter(|s| s.domain == data.domain)
            .is_none()
        {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Sink,
                id: data.ingress_sink.raw(),
            });
        }
        if self
            .sources
            .get(&data.egress_source)
            .filter(|s| s.domain == data.domain)
            .is_none()
        {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Source,
                id: data.egress_source.raw(),
            });
        }
        let id = match data.id.filter(|id| !id.is_unset()) {
            Some(id) => {
                if self.converters.contains_key(&id) {
                    return Err(RoutingError::AlreadyExists {
                        kind: EntityKind::Converter,
                        id: id.raw(),
                    });
                }
                id
            }
            None => ConverterId(
                self.alloc_id(EntityKind::Converter, |s, id| {
                    s.converters.contains_key(&ConverterId(id))
                })?,
            ),
        };
        self.converters.insert(
            id,
            Converter {
                id,
                name: data.name,
                ingress_sink: data.ingress_sink,
                egress_source: data.egress_source,
                domain: data.domain,
                matrix: data.matrix,
                weight: data.weight.max(1),
            },
        );
        self.emit(TopologyEvent::ConverterRegistered { id });
        Ok(id)
    }

    /// Deregisters a converter.
    pub fn deregister_converter(&mut self, id: ConverterId) -> Result<(), RoutingError> {
        if self.converters.remove(&id).is_none() {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Converter,
                id: id.raw(),
            });
        }
        self.emit(TopologyEvent::ConverterRemoved { id });
        Ok(())
    }

    /// Registers a crossfader.
    pub fn register_crossfader(
        &mut self,
        data: CrossfaderData,
    ) -> Result<CrossfaderId, RoutingError> {
        for sink in [data.sink_a, data.sink_b] {
            if !self.sinks.contains_key(&sink) {
                return Err(RoutingError::NotFound {
                    kind: EntityKind::Sink,
                    id: sink.raw(),
                });
            }
        }
        if !self.sources.contains_key(&data.source) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Source,
                id: data.source.raw(),
            });
        }
        let id = match data.id.filter(|id| !id.is_unset()) {
            Some(id) => {
                if self.crossfaders.contains_key(&id) {
                    return Err(RoutingError::AlreadyExists {
                        kind: EntityKind::Crossfader,
                        id: id.raw(),
                    });
                }
                id
            }
            None => CrossfaderId(
                self.alloc_id(EntityKind::Crossfader, |s, id| {
                    s.crossfaders.contains_key(&CrossfaderId(id))
                })?,
            ),
        };
        self.crossfaders.insert(
            id,
            Crossfader {
                id,
                name: data.name,
                sink_a: data.sink_a,
                sink_b: data.sink_b,
                source: data.source,
                hot_sink: data.hot_sink,
            },
        );
        self.emit(TopologyEvent::CrossfaderRegistered { id });
        Ok(id)
    }

    /// Deregisters a crossfader.
    pub fn deregister_crossfader(&mut self, id: CrossfaderId) -> Result<(), RoutingError> {
        if self.crossfaders.remove(&id).is_none() {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Crossfader,
                id: id.raw(),
            });
        }
        self.emit(TopologyEvent::CrossfaderRemoved { id });
        Ok(())
    }

    /// Updates which side of a crossfader is hot.
    pub fn set_crossfader_hot_sink(
        &mut self,
        id: CrossfaderId,
        hot_sink: HotSink,
    ) -> Result<(), RoutingError> {
        let crossfader = self.crossfaders.get_mut(&id).ok_or(RoutingError::NotFound {
            kind: EntityKind::Crossfader,
            id: id.raw(),
        })?;
        if crossfader.hot_sink != hot_sink {
            crossfader.hot_sink = hot_sink;
            self.emit(TopologyEvent::CrossfaderHotSinkChanged { id, hot_sink });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Creates a connection record in state `Connecting`.
    pub fn insert_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<ConnectionId, RoutingError> {
        if !self.sources.contains_key(&source) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Source,
                id: source.raw(),
            });
        }
        if !self.sinks.contains_key(&sink) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Sink,
                id: sink.raw(),
            });
        }
        let id = ConnectionId(self.alloc_id(EntityKind::Connection, |s, id| {
            s.connections.contains_key(&ConnectionId(id))
        })?);
        self.connections.insert(
            id,
            Connection {
                id,
                source,
                sink,
                format,
                state: ConnectionState::Connecting,
                delay_ms: DELAY_UNKNOWN,
            },
        );
        self.emit(TopologyEvent::ConnectionAdded { id, source, sink });
        Ok(id)
    }

    /// Updates a connection's state and refreshes affected main connections.
    pub fn set_connection_state(
        &mut self,
        id: ConnectionId,
        state: ConnectionState,
    ) -> Result<(), RoutingError> {
        let connection = self.connections.get_mut(&id).ok_or(RoutingError::NotFound {
            kind: EntityKind::Connection,
            id: id.raw(),
        })?;
        if connection.state != state {
            connection.state = state;
            self.emit(TopologyEvent::ConnectionStateChanged { id, state });
            self.refresh_main_connections_for(id);
        }
        Ok(())
    }

    /// Updates a connection's measured delay and refreshes affected main
    /// connections.
    pub fn set_connection_delay(
        &mut self,
        id: ConnectionId,
        delay_ms: i16,
    ) -> Result<(), RoutingError> {
        let connection = self.connections.get_mut(&id).ok_or(RoutingError::NotFound {
            kind: EntityKind::Connection,
            id: id.raw(),
        })?;
        if connection.delay_ms != delay_ms {
            connection.delay_ms = delay_ms;
            self.refresh_main_connections_for(id);
        }
        Ok(())
    }

    /// Removes a connection record.
    ///
    /// Fails with `Conflict` while a main connection still lists it.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Result<(), RoutingError> {
        if !self.connections.contains_key(&id) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Connection,
                id: id.raw(),
            });
        }
        let referencing = self
            .main_connections
            .values()
            .filter(|mc| mc.connections.contains(&id))
            .count();
        if referencing > 0 {
            return Err(RoutingError::Conflict {
                kind: EntityKind::Connection,
                id: id.raw(),
                dependents: referencing,
            });
        }
        self.connections.remove(&id);
        self.emit(TopologyEvent::ConnectionRemoved { id });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main connections
    // -----------------------------------------------------------------------

    /// Creates a main connection over the given constituents.
    pub fn insert_main_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        connections: Vec<ConnectionId>,
    ) -> Result<MainConnectionId, RoutingError> {
        if !self.sources.contains_key(&source) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Source,
                id: source.raw(),
            });
        }
        if !self.sinks.contains_key(&sink) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::Sink,
                id: sink.raw(),
            });
        }
        for conn in &connections {
            if !self.connections.contains_key(conn) {
                return Err(RoutingError::NotFound {
                    kind: EntityKind::Connection,
                    id: conn.raw(),
                });
            }
        }
        let id = MainConnectionId(self.alloc_id(EntityKind::MainConnection, |s, id| {
            s.main_connections.contains_key(&MainConnectionId(id))
        })?);
        let state = self.derive_state(&connections);
        let delay_ms = self.derive_delay(&connections);
        self.main_connections.insert(
            id,
            MainConnection {
                id,
                source,
                sink,
                state,
                delay_ms,
                connections,
            },
        );
        self.emit(TopologyEvent::MainConnectionAdded { id, source, sink });
        Ok(id)
    }

    /// Replaces a main connection's constituent list.
    pub fn set_main_connection_route(
        &mut self,
        id: MainConnectionId,
        connections: Vec<ConnectionId>,
    ) -> Result<(), RoutingError> {
        for conn in &connections {
            if !self.connections.contains_key(conn) {
                return Err(RoutingError::NotFound {
                    kind: EntityKind::Connection,
                    id: conn.raw(),
                });
            }
        }
        if !self.main_connections.contains_key(&id) {
            return Err(RoutingError::NotFound {
                kind: EntityKind::MainConnection,
                id: id.raw(),
            });
        }
        let state = self.derive_state(&connections);
        let delay_ms = self.derive_delay(&connections);
        let mc = self
            .main_connections
            .get_mut(&id)
            .ok_or(RoutingError::NotFound {
                kind: EntityKind::MainConnection,
                id: id.raw(),
            })?;
        mc.connections = connections;
        let state_changed = mc.state != state;
        let delay_changed = mc.delay_ms != delay_ms;
        mc.state = state;
        mc.delay_ms = delay_ms;
        if state_changed {
            self.emit(TopologyEvent::MainConnectionStateChanged { id, state });
        }
        if delay_changed {
            self.emit(TopologyEvent::MainConnectionDelayChanged { id, delay_ms });
        }
        Ok(())
    }

    /// Removes a main connection record.
    pub fn remove_main_connection(&mut self, id: MainConnectionId) -> Result<(), RoutingError> {
        if self.main_connections.remove(&id).is_none() {
            return Err(RoutingError::NotFound {
                kind: EntityKind::MainConnection,
                id: id.raw(),
            });
        }
        self.emit(TopologyEvent::MainConnectionRemoved { id });
        Ok(())
    }

    fn derive_state(&self, connections: &[ConnectionId]) -> MainConnectionState {
        MainConnectionState::derive(
            connections
                .iter()
                .filter_map(|id| self.connections.get(id))
                .map(|c| c.state),
        )
    }

    fn derive_delay(&self, connections: &[ConnectionId]) -> i16 {
        MainConnection::sum_delays(
            connections
                .iter()
                .filter_map(|id| self.connections.get(id))
                .map(|c| c.delay_ms),
        )
    }

    /// Recomputes state and delay of every main connection containing the
    /// given constituent.
    fn refresh_main_connections_for(&mut self, connection: ConnectionId) {
        let affected: Vec<MainConnectionId> = self
            .main_connections
            .values()
            .filter(|mc| mc.connections.contains(&connection))
            .map(|mc| mc.id)
            .collect();
        let mut events = Vec::new();
        for id in affected {
            let Some(mc) = self.main_connections.get(&id) else {
                continue;
            };
            let state = self.derive_state(&mc.connections);
            let delay_ms = self.derive_delay(&mc.connections);
            let Some(mc) = self.main_connections.get_mut(&id) else {
                continue;
            };
            if mc.state != state {
                mc.state = state;
                events.push(TopologyEvent::MainConnectionStateChanged { id, state });
            }
            if mc.delay_ms != delay_ms {
                mc.delay_ms = delay_ms;
                events.push(TopologyEvent::MainConnectionDelayChanged { id, delay_ms });
            }
        }
        self.emit_all(events);
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Looks up a domain.
    pub fn domain(&self, id: DomainId) -> Option<&Domain> {
        self.domains.get(&id)
    }

    /// Looks up a source.
    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(&id)
    }

    /// Looks up a sink.
    pub fn sink(&self, id: SinkId) -> Option<&Sink> {
        self.sinks.get(&id)
    }

    /// Looks up a gateway.
    pub fn gateway(&self, id: GatewayId) -> Option<&Gateway> {
        self.gateways.get(&id)
    }

    /// Looks up a converter.
    pub fn converter(&self, id: ConverterId) -> Option<&Converter> {
        self.converters.get(&id)
    }

    /// Looks up a crossfader.
    pub fn crossfader(&self, id: CrossfaderId) -> Option<&Crossfader> {
        self.crossfaders.get(&id)
    }

    /// Looks up a connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Looks up a main connection.
    pub fn main_connection(&self, id: MainConnectionId) -> Option<&MainConnection> {
        self.main_connections.get(&id)
    }

    /// All domains, in id order.
    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.domains.values()
    }

    /// All sources, in id order.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    /// All sinks, in id order.
    pub fn sinks(&self) -> impl Iterator<Item = &Sink> {
        self.sinks.values()
    }

    /// All gateways, in id order.
    pub fn gateways(&self) -> impl Iterator<Item = &Gateway> {
        self.gateways.values()
    }

    /// All converters, in id order.
    pub fn converters(&self) -> impl Iterator<Item = &Converter> {
        self.converters.values()
    }

    /// All crossfaders, in id order.
    pub fn crossfaders(&self) -> impl Iterator<Item = &Crossfader> {
        self.crossfaders.values()
    }

    /// All connections, in id order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// All main connections, in id order.
    pub fn main_connections(&self) -> impl Iterator<Item = &MainConnection> {
        self.main_connections.values()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Captures the durable registry (everything except live connections).
    #[must_use]
    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            domains: self.domains.values().cloned().collect(),
            sources: self.sources.values().cloned().collect(),
            sinks: self.sinks.values().cloned().collect(),
            gateways: self.gateways.values().cloned().collect(),
            converters: self.converters.values().cloned().collect(),
            crossfaders: self.crossfaders.values().cloned().collect(),
        }
    }

    /// Seeds the store from a snapshot, emitting registration events per
    /// restored entity.
    ///
    /// Intended for startup only; existing records with clashing ids cause
    /// `AlreadyExists` and abort the restore at that entity.
    pub fn restore(&mut self, snapshot: TopologySnapshot) -> Result<(), RoutingError> {
        for domain in snapshot.domains {
            let id = domain.id;
            if self.domains.contains_key(&id) {
                return Err(RoutingError::AlreadyExists {
                    kind: EntityKind::Domain,
                    id: id.raw(),
                });
            }
            self.domains.insert(id, domain);
            self.emit(TopologyEvent::DomainRegistered { id });
        }
        for source in snapshot.sources {
            let (id, domain) = (source.id, source.domain);
            if self.sources.contains_key(&id) {
                return Err(RoutingError::AlreadyExists {
                    kind: EntityKind::Source,
                    id: id.raw(),
                });
            }
            self.sources.insert(id, source);
            self.emit(TopologyEvent::SourceRegistered { id, domain });
        }
        for sink in snapshot.sinks {
            let (id, domain) = (sink.id, sink.domain);
            if self.sinks.contains_key(&id) {
                return Err(RoutingError::AlreadyExists {
                    kind: EntityKind::Sink,
                    id: id.raw(),
                });
            }
            self.sinks.insert(id, sink);
            self.emit(TopologyEvent::SinkRegistered { id, domain });
        }
        for gateway in snapshot.gateways {
            let id = gateway.id;
            if self.gateways.contains_key(&id) {
                return Err(RoutingError::AlreadyExists {
                    kind: EntityKind::Gateway,
                    id: id.raw(),
                });
            }
            self.gateways.insert(id, gateway);
            self.emit(TopologyEvent::GatewayRegistered { id });
        }
        for converter in snapshot.converters {
            let id = converter.id;
            if self.converters.contains_key(&id) {
                return Err(RoutingError::AlreadyExists {
                    kind: EntityKind::Converter,
                    id: id.raw(),
                });
            }
            self.converters.insert(id, converter);
            self.emit(TopologyEvent::ConverterRegistered { id });
        }
        for crossfader in snapshot.crossfaders {
            let id = crossfader.id;
            if self.crossfaders.contains_key(&id) {
                return Err(RoutingError::AlreadyExists {
                    kind: EntityKind::Crossfader,
                    id: id.raw(),
                });
            }
            self.crossfaders.insert(id, crossfader);
            self.emit(TopologyEvent::CrossfaderRegistered { id });
        }
        Ok(())
    }
}
