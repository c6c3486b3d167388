//! Running-router session management.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::adapter::VolumeTarget;
use crate::error::RoutingError;
use crate::ids::{
    ConnectionId, ConverterId, CrossfaderId, DomainId, GatewayId, MainConnectionId, SinkId,
    SourceId,
};
use crate::reactor::{Command, ReplyTx};
use crate::routing::Route;
use crate::topology::{
    Availability, Connection, Converter, ConverterData, Crossfader, CrossfaderData, Domain,
    DomainData, DomainState, Gateway, GatewayData, HotSink, MainConnection, MuteState,
    NotificationConfiguration, Sink, SinkData, SoundProperty, Source, SourceData, SourceState,
    TopologySnapshot, VolumeRamp,
};

/// Handle to a running router.
///
/// The `Session` is returned by [`AudioRouterBuilder::start()`] and is the
/// only way to talk to the reactor task: every method sends one command
/// over the internal channel and awaits its reply. Methods whose action
/// involves a domain (volumes, states, connects) resolve when the domain
/// acknowledges - or fail with [`RoutingError::Timeout`] when it does not.
///
/// # Lifecycle
///
/// 1. Created by [`AudioRouterBuilder::start()`]
/// 2. The reactor runs in the background
/// 3. Call [`stop()`](Session::stop) for graceful shutdown (snapshots
///    topology into the persistence backend)
/// 4. Dropping the `Session` also stops the reactor, without snapshotting
///    guarantees (prefer explicit `stop()`)
///
/// [`AudioRouterBuilder::start()`]: crate::AudioRouterBuilder::start
pub struct Session {
    commands: mpsc::Sender<Command>,
    reactor: Option<JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(commands: mpsc::Sender<Command>, reactor: JoinHandle<()>) -> Self {
        Self {
            commands,
            reactor: Some(reactor),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(ReplyTx<T>) -> Command,
    ) -> Result<T, RoutingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| RoutingError::Shutdown)?;
        rx.await.map_err(|_| RoutingError::Shutdown)?
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a domain.
    pub async fn register_domain(&self, data: DomainData) -> Result<DomainId, RoutingError> {
        self.request(|reply| Command::RegisterDomain { data, reply }).await
    }

    /// Deregisters a domain.
    ///
    /// With `cascade`, everything the domain owns (and every connection
    /// routed through it) is removed too; without it, dependents cause
    /// [`RoutingError::Conflict`].
    pub async fn deregister_domain(
        &self,
        id: DomainId,
        cascade: bool,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::DeregisterDomain { id, cascade, reply })
            .await
    }

    /// Updates a domain's lifecycle state.
    pub async fn set_domain_state(
        &self,
        id: DomainId,
        state: DomainState,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetDomainState { id, state, reply })
            .await
    }

    /// Marks a domain's entity registration as complete.
    ///
    /// Domains announce this after registering their last source, sink,
    /// gateway and converter; until then the controller policy may treat
    /// the domain's topology as partial.
    pub async fn set_domain_complete(&self, id: DomainId) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetDomainComplete { id, reply })
            .await
    }

    /// Registers a source.
    pub async fn register_source(&self, data: SourceData) -> Result<SourceId, RoutingError> {
        self.request(|reply| Command::RegisterSource { data, reply }).await
    }

    /// Deregisters a source.
    pub async fn deregister_source(
        &self,
        id: SourceId,
        cascade: bool,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::DeregisterSource { id, cascade, reply })
            .await
    }

    /// Registers a sink.
    pub async fn register_sink(&self, data: SinkData) -> Result<SinkId, RoutingError> {
        self.request(|reply| Command::RegisterSink { data, reply }).await
    }

    /// Deregisters a sink.
    pub async fn deregister_sink(&self, id: SinkId, cascade: bool) -> Result<(), RoutingError> {
        self.request(|reply| Command::DeregisterSink { id, cascade, reply })
            .await
    }

    /// Registers a gateway.
    pub async fn register_gateway(&self, data: GatewayData) -> Result<GatewayId, RoutingError> {
        self.request(|reply| Command::RegisterGateway { data, reply }).await
    }

    /// Deregisters a gateway.
    pub async fn deregister_gateway(&self, id: GatewayId) -> Result<(), RoutingError> {
        self.request(|reply| Command::DeregisterGateway { id, reply }).await
    }

    /// Registers a converter.
    pub async fn register_converter(
        &self,
        data: ConverterData,
    ) -> Result<ConverterId, RoutingError> {
        self.request(|reply| Command::RegisterConverter { data, reply }).await
    }

    /// Deregisters a converter.
    pub async fn deregister_converter(&self, id: ConverterId) -> Result<(), RoutingError> {
        self.request(|reply| Command::DeregisterConverter { id, reply }).await
    }

    /// Registers a crossfader.
    pub async fn register_crossfader(
        &self,
        data: CrossfaderData,
    ) -> Result<CrossfaderId, RoutingError> {
        self.request(|reply| Command::RegisterCrossfader { data, reply }).await
    }

    /// Deregisters a crossfader.
    pub async fn deregister_crossfader(&self, id: CrossfaderId) -> Result<(), RoutingError> {
        self.request(|reply| Command::DeregisterCrossfader { id, reply }).await
    }

    /// Records an availability change reported by a source's domain.
    pub async fn update_source_availability(
        &self,
        id: SourceId,
        availability: Availability,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::UpdateSourceAvailability {
            id,
            availability,
            reply,
        })
        .await
    }

    /// Records an availability change reported by a sink's domain.
    pub async fn update_sink_availability(
        &self,
        id: SinkId,
        availability: Availability,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::UpdateSinkAvailability {
            id,
            availability,
            reply,
        })
        .await
    }

    /// Records a mute state change decided by the controller policy.
    pub async fn update_sink_mute_state(
        &self,
        id: SinkId,
        mute_state: MuteState,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::UpdateSinkMuteState {
            id,
            mute_state,
            reply,
        })
        .await
    }

    /// Records timing information reported by a connection's domain.
    pub async fn update_connection_delay(
        &self,
        id: ConnectionId,
        delay_ms: i16,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::UpdateConnectionDelay {
            id,
            delay_ms,
            reply,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Plans candidate routes between a source and a sink, best first.
    ///
    /// Fails with [`RoutingError::NoRoute`] when no format-feasible path
    /// exists and [`RoutingError::InvalidEndpoint`] for unknown or
    /// unavailable endpoints. Planning commits nothing.
    pub async fn plan(
        &self,
        source: SourceId,
        sink: SinkId,
    ) -> Result<Vec<Route>, RoutingError> {
        self.request(|reply| Command::Plan {
            source,
            sink,
            reply,
        })
        .await
    }

    /// Plans and commits the best route from `source` to `sink`.
    ///
    /// Hops are dispatched strictly left-to-right; a later hop goes out
    /// only after the prior hop's domain acknowledged. On a hop failure
    /// the established hops are unwound and the commit is re-planned
    /// around the failed transition (bounded by
    /// [`RouterConfig::replan_attempts`](crate::RouterConfig::replan_attempts));
    /// if everything fails, the topology is back in its pre-call shape and
    /// the original failure is returned.
    pub async fn connect(
        &self,
        source: SourceId,
        sink: SinkId,
    ) -> Result<MainConnectionId, RoutingError> {
        self.request(|reply| Command::Connect {
            source,
            sink,
            reply,
        })
        .await
    }

    /// Cancels an in-progress [`connect`](Session::connect).
    ///
    /// The hop already in flight runs to completion (or timeout); anything
    /// established is then unwound and the pending `connect` call returns
    /// [`RoutingError::Aborted`].
    pub async fn cancel_connect(&self, id: MainConnectionId) -> Result<(), RoutingError> {
        self.request(|reply| Command::CancelConnect { id, reply }).await
    }

    /// Tears down a main connection, most recent hop first.
    ///
    /// Teardown is best-effort: every constituent is attempted even when
    /// one fails, records are removed regardless, and the first hop
    /// failure (if any) is reported once teardown finished.
    pub async fn disconnect(&self, id: MainConnectionId) -> Result<(), RoutingError> {
        self.request(|reply| Command::Disconnect { id, reply }).await
    }

    // -----------------------------------------------------------------------
    // Control actions
    // -----------------------------------------------------------------------

    /// Asks a source's domain to change the source's runtime state.
    pub async fn set_source_state(
        &self,
        source: SourceId,
        state: SourceState,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetSourceState {
            source,
            state,
            reply,
        })
        .await
    }

    /// Asks a sink's domain to ramp the sink to a volume.
    pub async fn set_sink_volume(
        &self,
        sink: SinkId,
        volume: i16,
        ramp: VolumeRamp,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetSinkVolume {
            sink,
            volume,
            ramp,
            reply,
        })
        .await
    }

    /// Asks a source's domain to ramp the source to a volume.
    pub async fn set_source_volume(
        &self,
        source: SourceId,
        volume: i16,
        ramp: VolumeRamp,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetSourceVolume {
            source,
            volume,
            ramp,
            reply,
        })
        .await
    }

    /// Asks a sink's domain to change a sound property.
    pub async fn set_sink_sound_property(
        &self,
        sink: SinkId,
        property: SoundProperty,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetSinkSoundProperty {
            sink,
            property,
            reply,
        })
        .await
    }

    /// Asks a source's domain to change a sound property.
    pub async fn set_source_sound_property(
        &self,
        source: SourceId,
        property: SoundProperty,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetSourceSoundProperty {
            source,
            property,
            reply,
        })
        .await
    }

    /// Configures value reporting on a sink.
    pub async fn set_sink_notification(
        &self,
        sink: SinkId,
        configuration: NotificationConfiguration,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetSinkNotification {
            sink,
            configuration,
            reply,
        })
        .await
    }

    /// Configures value reporting on a source.
    pub async fn set_source_notification(
        &self,
        source: SourceId,
        configuration: NotificationConfiguration,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetSourceNotification {
            source,
            configuration,
            reply,
        })
        .await
    }

    /// Fades a crossfader to the given hot side.
    pub async fn crossfade(
        &self,
        crossfader: CrossfaderId,
        hot_sink: HotSink,
        ramp: VolumeRamp,
    ) -> Result<(), RoutingError> {
        self.request(|reply| Command::Crossfade {
            crossfader,
            hot_sink,
            ramp,
            reply,
        })
        .await
    }

    /// Asks one domain to apply several volume changes atomically.
    ///
    /// All targets must live in the same domain.
    pub async fn set_volumes(&self, volumes: Vec<VolumeTarget>) -> Result<(), RoutingError> {
        self.request(|reply| Command::SetVolumes { volumes, reply }).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// All registered domains.
    pub async fn domains(&self) -> Result<Vec<Domain>, RoutingError> {
        self.request(|reply| Command::ListDomains { reply }).await
    }

    /// All registered sources.
    pub async fn sources(&self) -> Result<Vec<Source>, RoutingError> {
        self.request(|reply| Command::ListSources { reply }).await
    }

    /// All registered sinks.
    pub async fn sinks(&self) -> Result<Vec<Sink>, RoutingError> {
        self.request(|reply| Command::ListSinks { reply }).await
    }

    /// All registered gateways.
    pub async fn gateways(&self) -> Result<Vec<Gateway>, RoutingError> {
        self.request(|reply| Command::ListGateways { reply }).await
    }

    /// All registered converters.
    pub async fn converters(&self) -> Result<Vec<Converter>, RoutingError> {
        self.request(|reply| Command::ListConverters { reply }).await
    }

    /// All registered crossfaders.
    pub async fn crossfaders(&self) -> Result<Vec<Crossfader>, RoutingError> {
        self.request(|reply| Command::ListCrossfaders { reply }).await
    }

    /// All live connections.
    pub async fn connections(&self) -> Result<Vec<Connection>, RoutingError> {
        self.request(|reply| Command::ListConnections { reply }).await
    }

    /// All live main connections.
    pub async fn main_connections(&self) -> Result<Vec<MainConnection>, RoutingError> {
        self.request(|reply| Command::ListMainConnections { reply }).await
    }

    /// One main connection by id.
    pub async fn main_connection(
        &self,
        id: MainConnectionId,
    ) -> Result<MainConnection, RoutingError> {
        self.request(|reply| Command::GetMainConnection { id, reply }).await
    }

    /// The durable topology, as the persistence backend would receive it.
    pub async fn snapshot(&self) -> Result<TopologySnapshot, RoutingError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Gracefully stops the router.
    ///
    /// Pending actions and commits fail with [`RoutingError::Aborted`],
    /// adapters get their rundown call, and the topology is snapshotted
    /// into the persistence backend. A persistence failure is reported
    /// here but the router still stops.
    pub async fn stop(mut self) -> Result<(), RoutingError> {
        let result = self.request(|reply| Command::Stop { reply }).await;
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.await;
        }
        result
    }
}

// No Drop impl is needed: dropping the Session drops the command sender,
// the reactor sees the closed channel and shuts itself down.
