//! Topology change notifications.
//!
//! Every successful mutation of the topology store emits one event per
//! affected entity, delivered synchronously to all subscribers before the
//! mutating call returns, in mutation order. Delivery is fire-and-forget:
//! observers must not block the reactor.

use std::sync::Arc;

use crate::ids::{
    ConnectionId, ConverterId, CrossfaderId, DomainId, EntityKind, GatewayId, MainConnectionId,
    SinkId, SourceId,
};
use crate::topology::{
    Availability, ConnectionState, DomainState, HotSink, MainConnectionState, MuteState,
    NotificationConfiguration, SoundProperty, SourceState,
};

/// A change applied to the topology.
///
/// Events carry the new state alongside the entity id so observers can
/// forward them to command-layer clients without a read-back.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    /// A domain was registered.
    DomainRegistered {
        /// The new domain.
        id: DomainId,
    },
    /// A domain's lifecycle state changed.
    DomainStateChanged {
        /// Affected domain.
        id: DomainId,
        /// New state.
        state: DomainState,
    },
    /// A domain was deregistered.
    DomainRemoved {
        /// The removed domain.
        id: DomainId,
    },

    /// A source was registered.
    SourceRegistered {
        /// The new source.
        id: SourceId,
        /// Owning domain.
        domain: DomainId,
    },
    /// A source was deregistered.
    SourceRemoved {
        /// The removed source.
        id: SourceId,
    },
    /// A source's runtime state changed.
    SourceStateChanged {
        /// Affected source.
        id: SourceId,
        /// New state.
        state: SourceState,
    },
    /// A source's volume changed.
    SourceVolumeChanged {
        /// Affected source.
        id: SourceId,
        /// New volume.
        volume: i16,
    },
    /// A source's availability changed.
    SourceAvailabilityChanged {
        /// Affected source.
        id: SourceId,
        /// New availability.
        availability: Availability,
    },
    /// A source sound property changed.
    SourceSoundPropertyChanged {
        /// Affected source.
        id: SourceId,
        /// New property value.
        property: SoundProperty,
    },
    /// A source notification configuration changed.
    SourceNotificationChanged {
        /// Affected source.
        id: SourceId,
        /// New configuration.
        configuration: NotificationConfiguration,
    },

    /// A sink was registered.
    SinkRegistered {
        /// The new sink.
        id: SinkId,
        /// Owning domain.
        domain: DomainId,
    },
    /// A sink was deregistered.
    SinkRemoved {
        /// The removed sink.
        id: SinkId,
    },
    /// A sink's volume changed.
    SinkVolumeChanged {
        /// Affected sink.
        id: SinkId,
        /// New volume.
        volume: i16,
    },
    /// A sink's mute state changed.
    SinkMuteChanged {
        /// Affected sink.
        id: SinkId,
        /// New mute state.
        mute_state: MuteState,
    },
    /// A sink's availability changed.
    SinkAvailabilityChanged {
        /// Affected sink.
        id: SinkId,
        /// New availability.
        availability: Availability,
    },
    /// A sink sound property changed.
    SinkSoundPropertyChanged {
        /// Affected sink.
        id: SinkId,
        /// New property value.
        property: SoundProperty,
    },
    /// A sink notification configuration changed.
    SinkNotificationChanged {
        /// Affected sink.
        id: SinkId,
        /// New configuration.
        configuration: NotificationConfiguration,
    },

    /// A gateway was registered.
    GatewayRegistered {
        /// The new gateway.
        id: GatewayId,
    },
    /// A gateway was deregistered.
    GatewayRemoved {
        /// The removed gateway.
        id: GatewayId,
    },
    /// A converter was registered.
    ConverterRegistered {
        /// The new converter.
        id: ConverterId,
    },
    /// A converter was deregistered.
    ConverterRemoved {
        /// The removed converter.
        id: ConverterId,
    },
    /// A crossfader was registered.
    CrossfaderRegistered {
        /// The new crossfader.
        id: CrossfaderId,
    },
    /// A crossfader was deregistered.
    CrossfaderRemoved {
        /// The removed crossfader.
        id: CrossfaderId,
    },
    /// A crossfader finished (or started) fading.
    CrossfaderHotSinkChanged {
        /// Affected crossfader.
        id: CrossfaderId,
        /// New hot side.
        hot_sink: HotSink,
    },

    /// A connection record was created.
    ConnectionAdded {
        /// The new connection.
        id: ConnectionId,
        /// Producing endpoint.
        source: SourceId,
        /// Consuming endpoint.
        sink: SinkId,
    },
    /// A connection changed state.
    ConnectionStateChanged {
        /// Affected connection.
        id: ConnectionId,
        /// New state.
        state: ConnectionState,
    },
    /// A connection record was removed.
    ConnectionRemoved {
        /// The removed connection.
        id: ConnectionId,
    },

    /// A main connection was created.
    MainConnectionAdded {
        /// The new main connection.
        id: MainConnectionId,
        /// End-to-end source.
        source: SourceId,
        /// End-to-end sink.
        sink: SinkId,
    },
    /// A main connection's aggregated state changed.
    MainConnectionStateChanged {
        /// Affected main connection.
        id: MainConnectionId,
        /// New aggregated state.
        state: MainConnectionState,
    },
    /// A main connection's delay estimate changed.
    MainConnectionDelayChanged {
        /// Affected main connection.
        id: MainConnectionId,
        /// New delay estimate in milliseconds.
        delay_ms: i16,
    },
    /// A main connection was removed.
    MainConnectionRemoved {
        /// The removed main connection.
        id: MainConnectionId,
    },
}

impl TopologyEvent {
    /// The kind and raw id of the entity this event is about.
    #[must_use]
    pub fn entity(&self) -> (EntityKind, u16) {
        use TopologyEvent as E;
        match self {
            E::DomainRegistered { id }
            | E::DomainStateChanged { id, .. }
            | E::DomainRemoved { id } => (EntityKind::Domain, id.raw()),
            E::SourceRegistered { id, .. }
            | E::SourceRemoved { id }
            | E::SourceStateChanged { id, .. }
            | E::SourceVolumeChanged { id, .. }
            | E::SourceAvailabilityChanged { id, .. }
            | E::SourceSoundPropertyChanged { id, .. }
            | E::SourceNotificationChanged { id, .. } => (EntityKind::Source, id.raw()),
            E::SinkRegistered { id, .. }
            | E::SinkRemoved { id }
            | E::SinkVolumeChanged { id, .. }
            | E::SinkMuteChanged { id, .. }
            | E::SinkAvailabilityChanged { id, .. }
            | E::SinkSoundPropertyChanged { id, .. }
            | E::SinkNotificationChanged { id, .. } => (EntityKind::Sink, id.raw()),
            E::GatewayRegistered { id } | E::GatewayRemoved { id } => {
                (EntityKind::Gateway, id.raw())
            }
            E::ConverterRegistered { id } | E::ConverterRemoved { id } => {
                (EntityKind::Converter, id.raw())
            }
            E::CrossfaderRegistered { id }
            | E::CrossfaderRemoved { id }
            | E::CrossfaderHotSinkChanged { id, .. } => (EntityKind::Crossfader, id.raw()),
            E::ConnectionAdded { id, .. }
            | E::ConnectionStateChanged { id, .. }
            | E::ConnectionRemoved { id } => (EntityKind::Connection, id.raw()),
            E::MainConnectionAdded { id, .. }
            | E::MainConnectionStateChanged { id, .. }
            | E::MainConnectionDelayChanged { id, .. }
            | E::MainConnectionRemoved { id } => (EntityKind::MainConnection, id.raw()),
        }
    }
}

/// Callback type for receiving topology change events.
///
/// Register via [`AudioRouterBuilder::on_event()`] or
/// [`TopologyStore::subscribe()`]. Callbacks run on the reactor thread and
/// must not block.
///
/// [`AudioRouterBuilder::on_event()`]: crate::AudioRouterBuilder::on_event
/// [`TopologyStore::subscribe()`]: crate::TopologyStore::subscribe
pub type EventCallback = Arc<dyn Fn(&TopologyEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use route_audio::event_callback;
///
/// let callback = event_callback(|event| {
///     println!("topology changed: {event:?}");
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(&TopologyEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates an [`EventCallback`] that forwards events into a tokio channel.
///
/// This is the usual bridge to a command/notification layer: the channel's
/// consumer fans events out to connected clients at its own pace. A full
/// channel drops the event with a warning rather than blocking the reactor.
pub fn channel_events(tx: tokio::sync::mpsc::Sender<TopologyEvent>) -> EventCallback {
    Arc::new(move |event: &TopologyEvent| {
        if let Err(err) = tx.try_send(event.clone()) {
            tracing::warn!(?err, "dropping topology event for slow observer");
        }
    })
}
