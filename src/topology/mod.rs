//! The topology database: entity records and the store that owns them.
//!
//! The store is the single source of truth for everything routable. It is
//! owned by the reactor task and mutated only there; see the crate docs for
//! the single-writer discipline.

mod entities;
mod snapshot;
mod store;

pub use entities::{
    Availability, AvailabilityStatus, Connection, ConnectionState, Converter, ConverterData,
    Crossfader, CrossfaderData, Domain, DomainData, DomainState, Gateway, GatewayData, HotSink,
    MainConnection, MainConnectionState, MuteState, NotificationConfiguration, NotificationStatus,
    Sink, SinkData, SoundProperty, Source, SourceData, SourceState, VolumeRamp, DELAY_UNKNOWN,
};
pub use snapshot::TopologySnapshot;
pub use store::TopologyStore;
