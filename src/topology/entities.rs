//! Entity records held by the topology store.
//!
//! Shapes follow the registration data domains supply: a `*Data` struct is
//! what a plugin hands in at registration (with an optional static id), the
//! corresponding record struct is what the store owns afterwards.

use crate::format::{ConnectionFormat, ConvertibilityMatrix};
use crate::ids::{
    ConnectionId, ConverterId, CrossfaderId, DomainId, GatewayId, MainConnectionId, SinkId,
    SourceId,
};

/// Lifecycle state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainState {
    /// Fully controlled by the routing core.
    #[default]
    Controlled,
    /// The domain starts up on its own; early audio may already be playing.
    IndependentStartup,
    /// The domain shuts down on its own.
    IndependentRundown,
}

/// Runtime state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    /// Producing audio.
    On,
    /// Not producing audio.
    #[default]
    Off,
    /// Producing silence; stream kept open.
    Paused,
}

/// Whether an endpoint can currently take part in a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvailabilityStatus {
    /// Usable.
    Available,
    /// Not usable (reason code says why).
    Unavailable,
    /// Not yet reported by the owning domain.
    #[default]
    Unknown,
}

/// Availability plus the domain-defined reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Availability {
    /// Current status.
    pub status: AvailabilityStatus,
    /// Domain-defined reason code (`0` = unspecified).
    pub reason: u16,
}

impl Availability {
    /// An available endpoint with no reason code.
    #[must_use]
    pub fn available() -> Self {
        Self {
            status: AvailabilityStatus::Available,
            reason: 0,
        }
    }

    /// An unavailable endpoint with the given reason code.
    #[must_use]
    pub fn unavailable(reason: u16) -> Self {
        Self {
            status: AvailabilityStatus::Unavailable,
            reason,
        }
    }
}

/// Mute state of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuteState {
    /// Audible.
    #[default]
    Unmuted,
    /// Muted.
    Muted,
}

/// State of one realized connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Connect dispatched, not yet acknowledged.
    Connecting,
    /// Established.
    Connected,
    /// Disconnect dispatched, not yet acknowledged.
    Disconnecting,
    /// Torn down.
    #[default]
    Disconnected,
    /// Temporarily silenced without tearing the link down.
    Suspended,
}

/// Aggregated state of a main connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MainConnectionState {
    /// At least one constituent is still connecting.
    Connecting,
    /// All constituents are connected.
    Connected,
    /// At least one constituent is disconnecting.
    Disconnecting,
    /// Torn down (or no constituents).
    #[default]
    Disconnected,
    /// At least one constituent is suspended.
    Suspended,
}

impl MainConnectionState {
    /// Derives the aggregated state from constituent connection states.
    ///
    /// The aggregate is a pure function of the constituents: all-connected
    /// maps to `Connected`, any-disconnected (absent transitional states)
    /// maps to `Disconnected`, transitional states dominate settled ones.
    pub fn derive(states: impl IntoIterator<Item = ConnectionState>) -> Self {
        let mut saw_any = false;
        let mut disconnected = false;
        let mut suspended = false;
        for state in states {
            saw_any = true;
            match state {
                ConnectionState::Connecting => return Self::Connecting,
                ConnectionState::Disconnecting => return Self::Disconnecting,
                ConnectionState::Disconnected => disconnected = true,
                ConnectionState::Suspended => suspended = true,
                ConnectionState::Connected => {}
            }
        }
        if !saw_any || disconnected {
            Self::Disconnected
        } else if suspended {
            Self::Suspended
        } else {
            Self::Connected
        }
    }
}

/// Which side of a crossfader is currently hot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HotSink {
    /// Sink A carries the audio.
    #[default]
    HotA,
    /// Sink B carries the audio.
    HotB,
    /// Mid-fade.
    Intermediate,
}

/// A sound property (treble, bass, equalizer band, ...) on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundProperty {
    /// Domain-defined property type.
    pub kind: u16,
    /// Property value.
    pub value: i16,
}

/// How a domain should report a measured value back to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationStatus {
    /// Reporting disabled.
    #[default]
    Off,
    /// Report periodically; the parameter is the period.
    Periodic,
    /// Report when the value drops below the parameter.
    Minimum,
    /// Report when the value exceeds the parameter.
    Maximum,
    /// Report when the value changes by more than the parameter.
    Change,
}

/// Notification configuration for one measured value on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationConfiguration {
    /// Domain-defined notification type.
    pub kind: u16,
    /// Reporting mode.
    pub status: NotificationStatus,
    /// Mode parameter (period, threshold, or delta).
    pub parameter: i16,
}

/// Ramp parameters for a volume change.
///
/// The default ramp (`shape` 0, zero duration) applies the change
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeRamp {
    /// Domain-defined ramp shape (`0` = immediate).
    pub shape: u16,
    /// Ramp duration in milliseconds.
    pub duration_ms: u16,
}

/// Delay value in milliseconds; `-1` means not yet known.
pub const DELAY_UNKNOWN: i16 = -1;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One independently controlled audio subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    /// Assigned id.
    pub id: DomainId,
    /// Human-readable name.
    pub name: String,
    /// Bus identifier the owning adapter answers on.
    pub bus_name: String,
    /// Node name within the bus.
    pub node_name: String,
    /// The domain may play audio before the core is up.
    pub early: bool,
    /// Registration of the domain's entities is complete.
    pub complete: bool,
    /// Lifecycle state.
    pub state: DomainState,
}

/// A logical audio producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// Assigned id.
    pub id: SourceId,
    /// Owning domain.
    pub domain: DomainId,
    /// Source class (grouping defined by the controller policy).
    pub class_id: u16,
    /// Human-readable name.
    pub name: String,
    /// Current volume.
    pub volume: i16,
    /// Shown to command-layer clients.
    pub visible: bool,
    /// Current availability.
    pub availability: Availability,
    /// Runtime state.
    pub state: SourceState,
    /// Supported connection formats, in preference order.
    pub formats: Vec<ConnectionFormat>,
    /// Sound properties.
    pub sound_properties: Vec<SoundProperty>,
    /// Notification configurations.
    pub notification_configurations: Vec<NotificationConfiguration>,
}

/// A logical audio consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Sink {
    /// Assigned id.
    pub id: SinkId,
    /// Owning domain.
    pub domain: DomainId,
    /// Sink class (grouping defined by the controller policy).
    pub class_id: u16,
    /// Human-readable name.
    pub name: String,
    /// Current volume.
    pub volume: i16,
    /// Volume as presented to command-layer clients.
    pub main_volume: i16,
    /// Shown to command-layer clients.
    pub visible: bool,
    /// Current availability.
    pub availability: Availability,
    /// Mute state.
    pub mute_state: MuteState,
    /// Supported connection formats, in preference order.
    pub formats: Vec<ConnectionFormat>,
    /// Sound properties.
    pub sound_properties: Vec<SoundProperty>,
    /// Notification configurations.
    pub notification_configurations: Vec<NotificationConfiguration>,
}

/// A cross-domain format-converting link.
///
/// A gateway's ingress is a sink registered in the ingress domain; its
/// egress is a source registered in the egress domain. The matrix's
/// source-side formats are what the ingress sink accepts, its sink-side
/// formats what the egress source emits.
#[derive(Debug, Clone, PartialEq)]
pub struct Gateway {
    /// Assigned id.
    pub id: GatewayId,
    /// Human-readable name.
    pub name: String,
    /// The sink that feeds the gateway.
    pub ingress_sink: SinkId,
    /// The source the gateway re-emits on.
    pub egress_source: SourceId,
    /// Domain of the ingress sink.
    pub ingress_domain: DomainId,
    /// Domain of the egress source.
    pub egress_domain: DomainId,
    /// Domain that executes the conversion.
    pub control_domain: DomainId,
    /// Allowed format pairs.
    pub matrix: ConvertibilityMatrix,
    /// Domain-assigned cost (conversion quality/latency).
    pub weight: u16,
}

/// An intra-domain format-converting link.
#[derive(Debug, Clone, PartialEq)]
pub struct Converter {
    /// Assigned id.
    pub id: ConverterId,
    /// Human-readable name.
    pub name: String,
    /// The sink that feeds the converter.
    pub ingress_sink: SinkId,
    /// The source the converter re-emits on.
    pub egress_source: SourceId,
    /// The domain the converter lives in.
    pub domain: DomainId,
    /// Allowed format pairs.
    pub matrix: ConvertibilityMatrix,
    /// Domain-assigned cost (conversion quality/latency).
    pub weight: u16,
}

/// A fader between two sinks sharing one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crossfader {
    /// Assigned id.
    pub id: CrossfaderId,
    /// Human-readable name.
    pub name: String,
    /// Sink A.
    pub sink_a: SinkId,
    /// Sink B.
    pub sink_b: SinkId,
    /// The shared source.
    pub source: SourceId,
    /// Which side currently carries audio.
    pub hot_sink: HotSink,
}

/// One realized source-to-sink link; the atomic routable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    /// Assigned id.
    pub id: ConnectionId,
    /// Producing endpoint.
    pub source: SourceId,
    /// Consuming endpoint.
    pub sink: SinkId,
    /// Negotiated format.
    pub format: ConnectionFormat,
    /// Current state.
    pub state: ConnectionState,
    /// Reported delay in milliseconds ([`DELAY_UNKNOWN`] until measured).
    pub delay_ms: i16,
}

/// An end-to-end logical path composed of one or more connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainConnection {
    /// Assigned id.
    pub id: MainConnectionId,
    /// The user-visible source.
    pub source: SourceId,
    /// The user-visible sink.
    pub sink: SinkId,
    /// Aggregated state, derived from the constituents.
    pub state: MainConnectionState,
    /// Total delay estimate in milliseconds.
    pub delay_ms: i16,
    /// Constituent connections, ordered source to sink.
    pub connections: Vec<ConnectionId>,
}

impl MainConnection {
    /// Recomputes the delay estimate from constituent delays.
    ///
    /// Unknown constituent delays are skipped; a main connection with no
    /// measured constituent reports [`DELAY_UNKNOWN`].
    pub fn sum_delays(delays: impl IntoIterator<Item = i16>) -> i16 {
        let mut total: i32 = 0;
        let mut measured = false;
        for delay in delays {
            if delay >= 0 {
                measured = true;
                total += i32::from(delay);
            }
        }
        if !measured {
            return DELAY_UNKNOWN;
        }
        total.min(i32::from(i16::MAX)) as i16
    }
}

// ---------------------------------------------------------------------------
// Registration data
// ---------------------------------------------------------------------------

/// Registration data for a domain.
#[derive(Debug, Clone)]
pub struct DomainData {
    /// Static id, or `None` for dynamic assignment.
    pub id: Option<DomainId>,
    /// Human-readable name.
    pub name: String,
    /// Bus identifier the owning adapter answers on.
    pub bus_name: String,
    /// Node name within the bus.
    pub node_name: String,
    /// The domain may play audio before the core is up.
    pub early: bool,
    /// Lifecycle state at registration.
    pub state: DomainState,
}

impl DomainData {
    /// Registration data with dynamic id and defaults.
    pub fn new(name: impl Into<String>, bus_name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            bus_name: bus_name.into(),
            node_name: String::new(),
            early: false,
            state: DomainState::Controlled,
        }
    }
}

/// Registration data for a source.
#[derive(Debug, Clone)]
pub struct SourceData {
    /// Static id, or `None` for dynamic assignment.
    pub id: Option<SourceId>,
    /// Owning domain.
    pub domain: DomainId,
    /// Source class.
    pub class_id: u16,
    /// Human-readable name.
    pub name: String,
    /// Initial volume.
    pub volume: i16,
    /// Shown to command-layer clients.
    pub visible: bool,
    /// Initial availability.
    pub availability: Availability,
    /// Initial state.
    pub state: SourceState,
    /// Supported connection formats, in preference order.
    pub formats: Vec<ConnectionFormat>,
    /// Initial sound properties.
    pub sound_properties: Vec<SoundProperty>,
    /// Initial notification configurations.
    pub notification_configurations: Vec<NotificationConfiguration>,
}

impl SourceData {
    /// Registration data with dynamic id and defaults.
    pub fn new(
        domain: DomainId,
        name: impl Into<String>,
        formats: Vec<ConnectionFormat>,
    ) -> Self {
        Self {
            id: None,
            domain,
            class_id: 0,
            name: name.into(),
            volume: 0,
            visible: true,
            availability: Availability::available(),
            state: SourceState::Off,
            formats,
            sound_properties: Vec::new(),
            notification_configurations: Vec::new(),
        }
    }

    /// Sets a static id.
    #[must_use]
    pub fn with_id(mut self, id: SourceId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Registration data for a sink.
#[derive(Debug, Clone)]
pub struct SinkData {
    /// Static id, or `None` for dynamic assignment.
    pub id: Option<SinkId>,
    /// Owning domain.
    pub domain: DomainId,
    /// Sink class.
    pub class_id: u16,
    /// Human-readable name.
    pub name: String,
    /// Initial volume.
    pub volume: i16,
    /// Initial main volume.
    pub main_volume: i16,
    /// Shown to command-layer clients.
    pub visible: bool,
    /// Initial availability.
    pub availability: Availability,
    /// Initial mute state.
    pub mute_state: MuteState,
    /// Supported connection formats, in preference order.
    pub formats: Vec<ConnectionFormat>,
    /// Initial sound properties.
    pub sound_properties: Vec<SoundProperty>,
    /// Initial notification configurations.
    pub notification_configurations: Vec<NotificationConfiguration>,
}

impl SinkData {
    /// Registration data with dynamic id and defaults.
    pub fn new(
        domain: DomainId,
        name: impl Into<String>,
        formats: Vec<ConnectionFormat>,
    ) -> Self {
        Self {
            id: None,
            domain,
            class_id: 0,
            name: name.into(),
            volume: 0,
            main_volume: 0,
            visible: true,
            availability: Availability::available(),
            mute_state: MuteState::Unmuted,
            formats,
            sound_properties: Vec::new(),
            notification_configurations: Vec::new(),
        }
    }

    /// Sets a static id.
    #[must_use]
    pub fn with_id(mut self, id: SinkId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Registration data for a gateway.
#[derive(Debug, Clone)]
pub struct GatewayData {
    /// Static id, or `None` for dynamic assignment.
    pub id: Option<GatewayId>,
    /// Human-readable name.
    pub name: String,
    /// The sink that feeds the gateway (must exist in `ingress_domain`).
    pub ingress_sink: SinkId,
    /// The source the gateway re-emits on (must exist in `egress_domain`).
    pub egress_source: SourceId,
    /// Domain of the ingress sink.
    pub ingress_domain: DomainId,
    /// Domain of the egress source.
    pub egress_domain: DomainId,
    /// Domain that executes the conversion.
    pub control_domain: DomainId,
    /// Allowed format pairs.
    pub matrix: ConvertibilityMatrix,
    /// Domain-assigned cost.
    pub weight: u16,
}

impl GatewayData {
    /// Registration data with dynamic id and weight 1.
    pub fn new(
        name: impl Into<String>,
        ingress_sink: SinkId,
        egress_source: SourceId,
        ingress_domain: DomainId,
        egress_domain: DomainId,
        matrix: ConvertibilityMatrix,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            ingress_sink,
            egress_source,
            ingress_domain,
            egress_domain,
            control_domain: ingress_domain,
            matrix,
            weight: 1,
        }
    }
}

/// Registration data for a converter.
#[derive(Debug, Clone)]
pub struct ConverterData {
    /// Static id, or `None` for dynamic assignment.
    pub id: Option<ConverterId>,
    /// Human-readable name.
    pub name: String,
    /// The sink that feeds the converter.
    pub ingress_sink: SinkId,
    /// The source the converter re-emits on.
    pub egress_source: SourceId,
    /// The domain the converter lives in.
    pub domain: DomainId,
    /// Allowed format pairs.
    pub matrix: ConvertibilityMatrix,
    /// Domain-assigned cost.
    pub weight: u16,
}

impl ConverterData {
    /// Registration data with dynamic id and weight 1.
    pub fn new(
        name: impl Into<String>,
        ingress_sink: SinkId,
        egress_source: SourceId,
        domain: DomainId,
        matrix: ConvertibilityMatrix,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            ingress_sink,
            egress_source,
            domain,
            matrix,
            weight: 1,
        }
    }
}

/// Registration data for a crossfader.
#[derive(Debug, Clone)]
pub struct CrossfaderData {
    /// Static id, or `None` for dynamic assignment.
    pub id: Option<CrossfaderId>,
    /// Human-readable name.
    pub name: String,
    /// Sink A.
    pub sink_a: SinkId,
    /// Sink B.
    pub sink_b: SinkId,
    /// The shared source.
    pub source: SourceId,
    /// Initially hot side.
    pub hot_sink: HotSink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_all_connected() {
        let state = MainConnectionState::derive([
            ConnectionState::Connected,
            ConnectionState::Connected,
        ]);
        assert_eq!(state, MainConnectionState::Connected);
    }

    #[test]
    fn test_derive_any_disconnected_dominates_connected() {
        let state = MainConnectionState::derive([
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]);
        assert_eq!(state, MainConnectionState::Disconnected);
    }

    #[test]
    fn test_derive_transitional_dominates() {
        let state = MainConnectionState::derive([
            ConnectionState::Connected,
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
        ]);
        assert_eq!(state, MainConnectionState::Connecting);
        let state = MainConnectionState::derive([
            ConnectionState::Disconnecting,
            ConnectionState::Connected,
        ]);
        assert_eq!(state, MainConnectionState::Disconnecting);
    }

    #[test]
    fn test_derive_suspended() {
        let state = MainConnectionState::derive([
            ConnectionState::Connected,
            ConnectionState::Suspended,
        ]);
        assert_eq!(state, MainConnectionState::Suspended);
    }

    #[test]
    fn test_derive_empty_is_disconnected() {
        assert_eq!(
            MainConnectionState::derive([]),
            MainConnectionState::Disconnected
        );
    }

    #[test]
    fn test_sum_delays_skips_unknown() {
        assert_eq!(MainConnection::sum_delays([10, DELAY_UNKNOWN, 20]), 30);
        assert_eq!(
            MainConnection::sum_delays([DELAY_UNKNOWN, DELAY_UNKNOWN]),
            DELAY_UNKNOWN
        );
    }

    #[test]
    fn test_sum_delays_saturates() {
        assert_eq!(MainConnection::sum_delays([i16::MAX, i16::MAX]), i16::MAX);
    }

    #[test]
    fn test_availability_helpers() {
        assert_eq!(
            Availability::available().status,
            AvailabilityStatus::Available
        );
        let unavailable = Availability::unavailable(7);
        assert_eq!(unavailable.status, AvailabilityStatus::Unavailable);
        assert_eq!(unavailable.reason, 7);
    }
}
