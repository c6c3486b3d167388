//! # route-audio
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! In-vehicle audio routing core with multi-domain path planning.
//!
//! `route-audio` tracks every audio source, sink, domain, gateway and
//! converter registered by hardware/software plugins, computes feasible
//! end-to-end signal paths between a logical source and sink, and drives
//! the asynchronous actions (connect, disconnect, volume, crossfade,
//! notification configuration) that realize a path across independently
//! controlled domains.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use route_audio::{AudioRouter, DomainData, SourceData, SinkData, ConnectionFormat};
//!
//! let session = AudioRouter::builder()
//!     .add_adapter(my_domain_adapter)            // one per plugin bus
//!     .on_event(|e| tracing::info!(?e, "topology event"))
//!     .start()
//!     .await?;
//!
//! let cabin = session.register_domain(DomainData::new("cabin", "bus.cabin")).await?;
//! let radio = session
//!     .register_source(SourceData::new(cabin, "radio", vec![ConnectionFormat::STEREO]))
//!     .await?;
//! let speakers = session
//!     .register_sink(SinkData::new(cabin, "speakers", vec![ConnectionFormat::STEREO]))
//!     .await?;
//!
//! // Plan and realize a route; resolves when every hop's domain acked.
//! let main_connection = session.connect(radio, speakers).await?;
//!
//! session.disconnect(main_connection).await?;
//! session.stop().await?;
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict single-writer discipline:
//!
//! - **Reactor Task**: One `select!`-driven task owns the topology store,
//!   the routing graph and all pending-handle state
//! - **Command Channel**: [`Session`] methods marshal requests onto the
//!   reactor and await their replies
//! - **Completion Channel**: Domain adapters acknowledge dispatched
//!   actions from any thread; acks are serialized onto the reactor before
//!   any state changes
//!
//! Planning prunes on format convertibility at every gateway/converter
//! edge, multi-hop commits are dispatched strictly hop-by-hop with
//! automatic unwind on failure, and every in-flight action carries a
//! deadline - no handle is ever left pending indefinitely.

#![warn(missing_docs)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod adapter;
mod builder;
mod config;
mod error;
mod event;
pub mod format;
mod ids;
mod persistence;
mod reactor;
pub mod routing;
mod session;
pub mod topology;

pub(crate) mod dispatch;

pub use adapter::{
    ActionOutcome, Completion, CompletionSender, DomainAction, DomainAdapter, MockBehavior,
    MockDomainAdapter, VolumeEntity, VolumeTarget,
};
pub use builder::{AudioRouter, AudioRouterBuilder};
pub use config::RouterConfig;
pub use dispatch::{Handle, HandleKind};
pub use error::{AdapterError, PersistenceError, RoutingError};
pub use event::{channel_events, event_callback, EventCallback, TopologyEvent};
pub use format::{ConnectionFormat, ConvertibilityMatrix};
pub use ids::{
    ConnectionId, ConverterId, CrossfaderId, DomainId, EntityKind, GatewayId, HandleId,
    MainConnectionId, SinkId, SourceId,
};
pub use persistence::{MemoryBackend, PersistenceBackend};
pub use routing::{EdgeKey, Route, RoutingElement};
pub use session::Session;
pub use topology::{
    Availability, AvailabilityStatus, Connection, ConnectionState, Converter, ConverterData,
    Crossfader, CrossfaderData, Domain, DomainData, DomainState, Gateway, GatewayData, HotSink,
    MainConnection, MainConnectionState, MuteState, NotificationConfiguration, NotificationStatus,
    Sink, SinkData, SoundProperty, Source, SourceData, SourceState, TopologySnapshot,
    TopologyStore, VolumeRamp, DELAY_UNKNOWN,
};
