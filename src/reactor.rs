//! The reactor task: the only writer of topology state.
//!
//! One spawned task owns the [`TopologyStore`], the [`RoutePlanner`] and
//! the pending-handle table, and drives everything from a single
//! `select!` loop over three lanes:
//!
//! 1. commands from the [`Session`](crate::Session),
//! 2. completion reports marshaled in from adapter threads,
//! 3. the earliest pending-handle deadline.
//!
//! Store mutations and handle transitions happen nowhere else, which is
//! the entire concurrency discipline - no locks, no stale reads. Handlers
//! never block: adapter `dispatch` only queues work, long operations live
//! behind further handles.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};

use crate::adapter::{
    ActionOutcome, Completion, DomainAction, DomainAdapter, VolumeEntity, VolumeTarget,
};
use crate::config::RouterConfig;
use crate::dispatch::{BusyTarget, CompletionAction, Dispatcher, Handle, HandleKind};
use crate::error::RoutingError;
use crate::ids::{
    ConnectionId, ConverterId, CrossfaderId, DomainId, EntityKind, GatewayId, MainConnectionId,
    SinkId, SourceId,
};
use crate::persistence::PersistenceBackend;
use crate::routing::{EdgeKey, Route, RoutePlanner};
use crate::topology::{
    Availability, Connection, ConnectionState, Converter, ConverterData, Crossfader,
    CrossfaderData, Domain, DomainData, DomainState, Gateway, GatewayData, HotSink,
    MainConnection, MuteState, NotificationConfiguration, Sink, SinkData, SoundProperty, Source,
    SourceData, SourceState, TopologySnapshot, TopologyStore, VolumeRamp,
};

pub(crate) type ReplyTx<T> = oneshot::Sender<Result<T, RoutingError>>;

/// Requests from the session to the reactor.
pub(crate) enum Command {
    RegisterDomain {
        data: DomainData,
        reply: ReplyTx<DomainId>,
    },
    DeregisterDomain {
        id: DomainId,
        cascade: bool,
        reply: ReplyTx<()>,
    },
    SetDomainState {
        id: DomainId,
        state: DomainState,
        reply: ReplyTx<()>,
    },
    SetDomainComplete {
        id: DomainId,
        reply: ReplyTx<()>,
    },
    RegisterSource {
        data: SourceData,
        reply: ReplyTx<SourceId>,
    },
    DeregisterSource {
        id: SourceId,
        cascade: bool,
        reply: ReplyTx<()>,
    },
    RegisterSink {
        data: SinkData,
        reply: ReplyTx<SinkId>,
    },
    DeregisterSink {
        id: SinkId,
        cascade: bool,
        reply: ReplyTx<()>,
    },
    RegisterGateway {
        data: GatewayData,
        reply: ReplyTx<GatewayId>,
    },
    DeregisterGateway {
        id: GatewayId,
        reply: ReplyTx<()>,
    },
    RegisterConverter {
        data: ConverterData,
        reply: ReplyTx<ConverterId>,
    },
    DeregisterConverter {
        id: ConverterId,
        reply: ReplyTx<()>,
    },
    RegisterCrossfader {
        data: CrossfaderData,
        reply: ReplyTx<CrossfaderId>,
    },
    DeregisterCrossfader {
        id: CrossfaderId,
        reply: ReplyTx<()>,
    },
    UpdateSourceAvailability {
        id: SourceId,
        availability: Availability,
        reply: ReplyTx<()>,
    },
    UpdateSinkAvailability {
        id: SinkId,
        availability: Availability,
        reply: ReplyTx<()>,
    },
    UpdateSinkMuteState {
        id: SinkId,
        mute_state: MuteState,
        reply: ReplyTx<()>,
    },
    UpdateConnectionDelay {
        id: ConnectionId,
        delay_ms: i16,
        reply: ReplyTx<()>,
    },

    Plan {
        source: SourceId,
        sink: SinkId,
        reply: ReplyTx<Vec<Route>>,
    },
    Connect {
        source: SourceId,
        sink: SinkId,
        reply: ReplyTx<MainConnectionId>,
    },
    CancelConnect {
        id: MainConnectionId,
        reply: ReplyTx<()>,
    },
    Disconnect {
        id: MainConnectionId,
        reply: ReplyTx<()>,
    },

    SetSourceState {
        source: SourceId,
        state: SourceState,
        reply: ReplyTx<()>,
    },
    SetSinkVolume {
        sink: SinkId,
        volume: i16,
        ramp: VolumeRamp,
        reply: ReplyTx<()>,
    },
    SetSourceVolume {
        source: SourceId,
        volume: i16,
        ramp: VolumeRamp,
        reply: ReplyTx<()>,
    },
    SetSinkSoundProperty {
        sink: SinkId,
        property: SoundProperty,
        reply: ReplyTx<()>,
    },
    SetSourceSoundProperty {
        source: SourceId,
        property: SoundProperty,
        reply: ReplyTx<()>,
    },
    SetSinkNotification {
        sink: SinkId,
        configuration: NotificationConfiguration,
        reply: ReplyTx<()>,
    },
    SetSourceNotification {
        source: SourceId,
        configuration: NotificationConfiguration,
        reply: ReplyTx<()>,
    },
    Crossfade {
        crossfader: CrossfaderId,
        hot_sink: HotSink,
        ramp: VolumeRamp,
        reply: ReplyTx<()>,
    },
    SetVolumes {
        volumes: Vec<VolumeTarget>,
        reply: ReplyTx<()>,
    },

    ListDomains {
        reply: ReplyTx<Vec<Domain>>,
    },
    ListSources {
        reply: ReplyTx<Vec<Source>>,
    },
    ListSinks {
        reply: ReplyTx<Vec<Sink>>,
    },
    ListGateways {
        reply: ReplyTx<Vec<Gateway>>,
    },
    ListConverters {
        reply: ReplyTx<Vec<Converter>>,
    },
    ListCrossfaders {
        reply: ReplyTx<Vec<Crossfader>>,
    },
    ListConnections {
        reply: ReplyTx<Vec<Connection>>,
    },
    ListMainConnections {
        reply: ReplyTx<Vec<MainConnection>>,
    },
    GetMainConnection {
        id: MainConnectionId,
        reply: ReplyTx<MainConnection>,
    },
    Snapshot {
        reply: ReplyTx<TopologySnapshot>,
    },

    Stop {
        reply: ReplyTx<()>,
    },
}

enum CommitPhase {
    Connecting,
    Unwinding,
}

/// One in-progress multi-hop connect.
struct CommitSeq {
    mc: MainConnectionId,
    source: SourceId,
    sink: SinkId,
    route: Route,
    /// Index of the element currently (or next) in flight.
    hop: usize,
    /// Established hops as (connection, executing domain), in path order.
    established: Vec<(ConnectionId, DomainId)>,
    /// The in-flight connect or unwind-disconnect.
    current: Option<(ConnectionId, Handle)>,
    phase: CommitPhase,
    excluded: Vec<EdgeKey>,
    failed_edge: Option<EdgeKey>,
    attempts_left: usize,
    canceled: bool,
    failure: Option<RoutingError>,
    reply: Option<ReplyTx<MainConnectionId>>,
}

/// One in-progress user-requested teardown.
struct TeardownSeq {
    mc: MainConnectionId,
    /// Constituents still to disconnect, source-to-sink order; popped from
    /// the back (most recent hop first).
    remaining: Vec<(ConnectionId, DomainId)>,
    current: Option<(ConnectionId, Handle)>,
    first_failure: Option<RoutingError>,
    reply: Option<ReplyTx<()>>,
}

pub(crate) struct Reactor {
    store: TopologyStore,
    planner: RoutePlanner,
    dispatcher: Dispatcher,
    adapters: HashMap<String, Arc<dyn DomainAdapter>>,
    commands: mpsc::Receiver<Command>,
    completions: mpsc::Receiver<Completion>,
    /// Keeps the completion channel open even with no adapters attached.
    _completion_tx: mpsc::Sender<Completion>,
    /// Reply slots for single in-flight actions.
    waiters: HashMap<Handle, ReplyTx<()>>,
    commits: Vec<CommitSeq>,
    teardowns: Vec<TeardownSeq>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    config: RouterConfig,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: TopologyStore,
        planner: RoutePlanner,
        adapters: HashMap<String, Arc<dyn DomainAdapter>>,
        commands: mpsc::Receiver<Command>,
        completions: mpsc::Receiver<Completion>,
        completion_tx: mpsc::Sender<Completion>,
        persistence: Option<Arc<dyn PersistenceBackend>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            planner,
            dispatcher: Dispatcher::new(config.handle_timeout),
            adapters,
            commands,
            completions,
            _completion_tx: completion_tx,
            waiters: HashMap::new(),
            commits: Vec::new(),
            teardowns: Vec::new(),
            persistence,
            config,
        }
    }

    /// Runs the loop until `Stop` arrives or every session handle is gone.
    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.dispatcher.next_deadline();
            let sleep_to = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                biased;
                Some(completion) = self.completions.recv() => {
                    self.on_completion(completion).await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Stop { reply }) => {
                            let result = self.shutdown().await;
                            let _ = reply.send(result);
                            return;
                        }
                        Some(command) => self.on_command(command).await,
                        None => {
                            // Session dropped without stop(); shut down anyway.
                            let _ = self.shutdown().await;
                            return;
                        }
                    }
                }
                () = sleep_until(sleep_to), if deadline.is_some() => {
                    self.on_deadline().await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Command lane
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::RegisterDomain { data, reply } => {
                let result = self.store.register_domain(data);
                if let Ok(id) = &result {
                    self.planner.add_domain(*id);
                }
                let _ = reply.send(result);
            }
            Command::DeregisterDomain { id, cascade, reply } => {
                let result = self.store.deregister_domain(id, cascade);
                if result.is_ok() {
                    // Cascades can take gateways and converters with them;
                    // a rebuild is always correct.
                    self.planner.rebuild(&self.store);
                    self.fail_orphaned_sequences();
                }
                let _ = reply.send(result);
            }
            Command::SetDomainState { id, state, reply } => {
                let _ = reply.send(self.store.set_domain_state(id, state));
            }
            Command::SetDomainComplete { id, reply } => {
                let _ = reply.send(self.store.set_domain_complete(id));
            }
            Command::RegisterSource { data, reply } => {
                let _ = reply.send(self.store.register_source(data));
            }
            Command::DeregisterSource { id, cascade, reply } => {
                let result = self.store.deregister_source(id, cascade);
                if result.is_ok() {
                    self.planner.rebuild(&self.store);
                    self.fail_orphaned_sequences();
                }
                let _ = reply.send(result);
            }
            Command::RegisterSink { data, reply } => {
                let _ = reply.send(self.store.register_sink(data));
            }
            Command::DeregisterSink { id, cascade, reply } => {
                let result = self.store.deregister_sink(id, cascade);
                if result.is_ok() {
                    self.planner.rebuild(&self.store);
                    self.fail_orphaned_sequences();
                }
                let _ = reply.send(result);
            }
            Command::RegisterGateway { data, reply } => {
                let result = self.store.register_gateway(data);
                if let Ok(id) = &result {
                    if let Some(gateway) = self.store.gateway(*id) {
                        self.planner.add_gateway(gateway);
                    }
                }
                let _ = reply.send(result);
            }
            Command::DeregisterGateway { id, reply } => {
                let result = self.store.deregister_gateway(id);
                if result.is_ok() {
                    self.planner.remove_gateway(id);
                }
                let _ = reply.send(result);
            }
            Command::RegisterConverter { data, reply } => {
                let result = self.store.register_converter(data);
                if let Ok(id) = &result {
                    if let Some(converter) = self.store.converter(*id) {
                        self.planner.add_converter(converter);
                    }
                }
                let _ = reply.send(result);
            }
            Command::DeregisterConverter { id, reply } => {
                let result = self.store.deregister_converter(id);
                if result.is_ok() {
                    self.planner.remove_converter(id);
                }
                let _ = reply.send(result);
            }
            Command::RegisterCrossfader { data, reply } => {
                let _ = reply.send(self.store.register_crossfader(data));
            }
            Command::DeregisterCrossfader { id, reply } => {
                let _ = reply.send(self.store.deregister_crossfader(id));
            }
            Command::UpdateSourceAvailability {
                id,
                availability,
                reply,
            } => {
                let _ = reply.send(self.store.set_source_availability(id, availability));
            }
            Command::UpdateSinkAvailability {
                id,
                availability,
                reply,
            } => {
                let _ = reply.send(self.store.set_sink_availability(id, availability));
            }
            Command::UpdateSinkMuteState {
                id,
                mute_state,
                reply,
            } => {
                let _ = reply.send(self.store.set_sink_mute_state(id, mute_state));
            }
            Command::UpdateConnectionDelay {
                id,
                delay_ms,
                reply,
            } => {
                let _ = reply.send(self.store.set_connection_delay(id, delay_ms));
            }

            Command::Plan {
                source,
                sink,
                reply,
            } => {
                let _ = reply.send(self.planner.plan(&self.store, source, sink));
            }
            Command::Connect {
                source,
                sink,
                reply,
            } => {
                if let Err(err) = self.start_connect(source, sink, reply).await {
                    tracing::debug!(%source, %sink, %err, "connect rejected");
                }
            }
            Command::CancelConnect { id, reply } => {
                let _ = reply.send(self.cancel_connect(id));
            }
            Command::Disconnect { id, reply } => {
                self.start_disconnect(id, reply).await;
            }

            Command::SetSourceState {
                source,
                state,
                reply,
            } => {
                let Some(domain) = self.store.source(source).map(|s| s.domain) else {
                    let _ = reply.send(Err(not_found(EntityKind::Source, source.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::SetSourceState,
                    vec![BusyTarget::Source(source)],
                    CompletionAction::SourceStateSet { source, state },
                    |handle| DomainAction::SetSourceState {
                        handle,
                        source,
                        state,
                    },
                    reply,
                )
                .await;
            }
            Command::SetSinkVolume {
                sink,
                volume,
                ramp,
                reply,
            } => {
                let Some(domain) = self.store.sink(sink).map(|s| s.domain) else {
                    let _ = reply.send(Err(not_found(EntityKind::Sink, sink.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::SetSinkVolume,
                    vec![BusyTarget::Sink(sink)],
                    CompletionAction::SinkVolumeSet { sink, volume },
                    |handle| DomainAction::SetSinkVolume {
                        handle,
                        sink,
                        volume,
                        ramp,
                    },
                    reply,
                )
                .await;
            }
            Command::SetSourceVolume {
                source,
                volume,
                ramp,
                reply,
            } => {
                let Some(domain) = self.store.source(source).map(|s| s.domain) else {
                    let _ = reply.send(Err(not_found(EntityKind::Source, source.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::SetSourceVolume,
                    vec![BusyTarget::Source(source)],
                    CompletionAction::SourceVolumeSet { source, volume },
                    |handle| DomainAction::SetSourceVolume {
                        handle,
                        source,
                        volume,
                        ramp,
                    },
                    reply,
                )
                .await;
            }
            Command::SetSinkSoundProperty {
                sink,
                property,
                reply,
            } => {
                let Some(domain) = self.store.sink(sink).map(|s| s.domain) else {
                    let _ = reply.send(Err(not_found(EntityKind::Sink, sink.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::SetSinkSoundProperty,
                    vec![BusyTarget::Sink(sink)],
                    CompletionAction::SinkSoundPropertySet { sink, property },
                    |handle| DomainAction::SetSinkSoundProperty {
                        handle,
                        sink,
                        property,
                    },
                    reply,
                )
                .await;
            }
            Command::SetSourceSoundProperty {
                source,
                property,
                reply,
            } => {
                let Some(domain) = self.store.source(source).map(|s| s.domain) else {
                    let _ = reply.send(Err(not_found(EntityKind::Source, source.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::SetSourceSoundProperty,
                    vec![BusyTarget::Source(source)],
                    CompletionAction::SourceSoundPropertySet { source, property },
                    |handle| DomainAction::SetSourceSoundProperty {
                        handle,
                        source,
                        property,
                    },
                    reply,
                )
                .await;
            }
            Command::SetSinkNotification {
                sink,
                configuration,
                reply,
            } => {
                let Some(domain) = self.store.sink(sink).map(|s| s.domain) else {
                    let _ = reply.send(Err(not_found(EntityKind::Sink, sink.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::SetSinkNotification,
                    vec![BusyTarget::Sink(sink)],
                    CompletionAction::SinkNotificationSet {
                        sink,
                        configuration,
                    },
                    |handle| DomainAction::SetSinkNotification {
                        handle,
                        sink,
                        configuration,
                    },
                    reply,
                )
                .await;
            }
            Command::SetSourceNotification {
                source,
                configuration,
                reply,
            } => {
                let Some(domain) = self.store.source(source).map(|s| s.domain) else {
                    let _ = reply.send(Err(not_found(EntityKind::Source, source.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::SetSourceNotification,
                    vec![BusyTarget::Source(source)],
                    CompletionAction::SourceNotificationSet {
                        source,
                        configuration,
                    },
                    |handle| DomainAction::SetSourceNotification {
                        handle,
                        source,
                        configuration,
                    },
                    reply,
                )
                .await;
            }
            Command::Crossfade {
                crossfader,
                hot_sink,
                ramp,
                reply,
            } => {
                // The crossfade runs in the domain of the hot sinks.
                let Some(domain) = self
                    .store
                    .crossfader(crossfader)
                    .and_then(|c| self.store.sink(c.sink_a))
                    .map(|s| s.domain)
                else {
                    let _ = reply.send(Err(not_found(EntityKind::Crossfader, crossfader.raw())));
                    return;
                };
                self.dispatch_single(
                    domain,
                    HandleKind::Crossfade,
                    vec![BusyTarget::Crossfader(crossfader)],
                    CompletionAction::CrossfadeDone {
                        crossfader,
                        hot_sink,
                    },
                    |handle| DomainAction::Crossfade {
                        handle,
                        crossfader,
                        hot_sink,
                        ramp,
                    },
                    reply,
                )
                .await;
            }
            Command::SetVolumes { volumes, reply } => {
                self.dispatch_set_volumes(volumes, reply).await;
            }

            Command::ListDomains { reply } => {
                let _ = reply.send(Ok(self.store.domains().cloned().collect()));
            }
            Command::ListSources { reply } => {
                let _ = reply.send(Ok(self.store.sources().cloned().collect()));
            }
            Command::ListSinks { reply } => {
                let _ = reply.send(Ok(self.store.sinks().cloned().collect()));
            }
            Command::ListGateways { reply } => {
                let _ = reply.send(Ok(self.store.gateways().cloned().collect()));
            }
            Command::ListConverters { reply } => {
                let _ = reply.send(Ok(self.store.converters().cloned().collect()));
            }
            Command::ListCrossfaders { reply } => {
                let _ = reply.send(Ok(self.store.crossfaders().cloned().collect()));
            }
            Command::ListConnections { reply } => {
                let _ = reply.send(Ok(self.store.connections().cloned().collect()));
            }
            Command::ListMainConnections { reply } => {
                let _ = reply.send(Ok(self.store.main_connections().cloned().collect()));
            }
            Command::GetMainConnection { id, reply } => {
                let result = self
                    .store
                    .main_connection(id)
                    .cloned()
                    .ok_or(not_found(EntityKind::MainConnection, id.raw()));
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.store.snapshot()));
            }
            Command::Stop { reply } => {
                // Handled in run(); answering here keeps the caller unblocked
                // if control flow ever changes.
                let _ = reply.send(Ok(()));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Single actions
    // -----------------------------------------------------------------------

    fn adapter_for(&self, domain: DomainId) -> Result<Arc<dyn DomainAdapter>, RoutingError> {
        let bus_name = self
            .store
            .domain(domain)
            .map(|d| d.bus_name.clone())
            .ok_or(not_found(EntityKind::Domain, domain.raw()))?;
        self.adapters
            .get(&bus_name)
            .cloned()
            .ok_or(RoutingError::ActionFailed { code: 0 })
    }

    /// Claims targets, dispatches one action, and parks the reply until
    /// the completion (or deadline) resolves it.
    async fn dispatch_single(
        &mut self,
        domain: DomainId,
        kind: HandleKind,
        targets: Vec<BusyTarget>,
        on_success: CompletionAction,
        make_action: impl FnOnce(Handle) -> DomainAction,
        reply: ReplyTx<()>,
    ) {
        let adapter = match self.adapter_for(domain) {
            Ok(adapter) => adapter,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let handle = match self.dispatcher.begin(kind, targets, on_success) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if let Err(err) = adapter.dispatch(make_action(handle)).await {
            tracing::warn!(%handle, %err, "adapter refused dispatch");
            self.dispatcher.finish(handle);
            let _ = reply.send(Err(RoutingError::ActionFailed { code: err.code() }));
            return;
        }
        self.waiters.insert(handle, reply);
    }

    async fn dispatch_set_volumes(&mut self, volumes: Vec<VolumeTarget>, reply: ReplyTx<()>) {
        if volumes.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        // All entries must live in one domain; batched ramps are executed
        // by a single domain controller.
        let mut domain: Option<DomainId> = None;
        let mut targets = Vec::with_capacity(volumes.len());
        for entry in &volumes {
            let entity_domain = match entry.entity {
                VolumeEntity::Source(id) => {
                    targets.push(BusyTarget::Source(id));
                    self.store.source(id).map(|s| s.domain).ok_or(not_found(
                        EntityKind::Source,
                        id.raw(),
                    ))
                }
                VolumeEntity::Sink(id) => {
                    targets.push(BusyTarget::Sink(id));
                    self.store
                        .sink(id)
                        .map(|s| s.domain)
                        .ok_or(not_found(EntityKind::Sink, id.raw()))
                }
            };
            let entity_domain = match entity_domain {
                Ok(d) => d,
                Err(err) => {
                    let _ = reply.send(Err(err));
                    return;
                }
            };
            match domain {
                None => domain = Some(entity_domain),
                Some(existing) if existing == entity_domain => {}
                Some(_) => {
                    let (kind, id) = targets
                        .last()
                        .map(|t| t.describe())
                        .unwrap_or((EntityKind::Domain, 0));
                    let _ = reply.send(Err(RoutingError::Conflict {
                        kind,
                        id,
                        dependents: 0,
                    }));
                    return;
                }
            }
        }
        let Some(domain) = domain else {
            let _ = reply.send(Ok(()));
            return;
        };
        let action_volumes = volumes.clone();
        self.dispatch_single(
            domain,
            HandleKind::SetVolumes,
            targets,
            CompletionAction::VolumesSet { volumes },
            move |handle| DomainAction::SetVolumes {
                handle,
                volumes: action_volumes,
            },
            reply,
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Connect (multi-hop commit)
    // -----------------------------------------------------------------------

    async fn start_connect(
        &mut self,
        source: SourceId,
        sink: SinkId,
        reply: ReplyTx<MainConnectionId>,
    ) -> Result<(), RoutingError> {
        // One commit at a time per endpoint.
        if self
            .commits
            .iter()
            .any(|c| c.source == source || c.sink == sink)
        {
            let err = RoutingError::Busy {
                kind: EntityKind::Source,
                id: source.raw(),
            };
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        }
        let routes = match self.planner.plan(&self.store, source, sink) {
            Ok(routes) => routes,
            Err(err) => {
                let _ = reply.send(Err(err.clone()));
                return Err(err);
            }
        };
        let Some(route) = routes.into_iter().next() else {
            let err = RoutingError::NoRoute { source, sink };
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        };
        let mc = match self.store.insert_main_connection(source, sink, Vec::new()) {
            Ok(mc) => mc,
            Err(err) => {
                let _ = reply.send(Err(err.clone()));
                return Err(err);
            }
        };
        let seq = CommitSeq {
            mc,
            source,
            sink,
            route,
            hop: 0,
            established: Vec::new(),
            current: None,
            phase: CommitPhase::Connecting,
            excluded: Vec::new(),
            failed_edge: None,
            attempts_left: self.config.replan_attempts,
            canceled: false,
            failure: None,
            reply: Some(reply),
        };
        self.commits.push(seq);
        let index = self.commits.len() - 1;
        self.start_hop(index).await;
        Ok(())
    }

    /// Dispatches the connect for the current hop of a commit.
    async fn start_hop(&mut self, index: usize) {
        let (mc, hop, element, established) = {
            let seq = &self.commits[index];
            (
                seq.mc,
                seq.hop,
                seq.route.elements[seq.hop].clone(),
                seq.established.iter().map(|(c, _)| *c).collect::<Vec<_>>(),
            )
        };
        let result: Result<(), RoutingError> = async {
            let connection = self
                .store
                .insert_connection(element.source, element.sink, element.format)?;
            let mut routed = established;
            routed.push(connection);
            self.store.set_main_connection_route(mc, routed)?;
            let adapter = match self.adapter_for(element.domain) {
                Ok(adapter) => adapter,
                Err(err) => {
                    self.rollback_hop_connection(mc, connection);
                    return Err(err);
                }
            };
            let handle = match self.dispatcher.begin(
                HandleKind::Connect,
                vec![
                    BusyTarget::Source(element.source),
                    BusyTarget::Sink(element.sink),
                ],
                CompletionAction::CommitConnectEstablished { connection },
            ) {
                Ok(handle) => handle,
                Err(err) => {
                    self.rollback_hop_connection(mc, connection);
                    return Err(err);
                }
            };
            if let Err(err) = adapter
                .dispatch(DomainAction::Connect {
                    handle,
                    connection,
                    source: element.source,
                    sink: element.sink,
                    format: element.format,
                })
                .await
            {
                tracing::warn!(%handle, %err, "adapter refused connect");
                self.dispatcher.finish(handle);
                self.rollback_hop_connection(mc, connection);
                return Err(RoutingError::ActionFailed { code: err.code() });
            }
            self.commits[index].current = Some((connection, handle));
            tracing::debug!(%mc, hop, %handle, "hop dispatched");
            Ok(())
        }
        .await;

        if let Err(err) = result {
            self.record_hop_failure(index, err);
            self.begin_unwind(index).await;
        }
    }

    /// Removes the connection record of a hop that never went in flight.
    fn rollback_hop_connection(&mut self, mc: MainConnectionId, connection: ConnectionId) {
        let established: Vec<ConnectionId> = self
            .commits
            .iter()
            .find(|c| c.mc == mc)
            .map(|c| c.established.iter().map(|(conn, _)| *conn).collect())
            .unwrap_or_default();
        if let Err(err) = self.store.set_main_connection_route(mc, established) {
            tracing::warn!(%mc, %err, "failed to trim main connection route");
        }
        if let Err(err) = self.store.remove_connection(connection) {
            tracing::warn!(%connection, %err, "failed to remove hop connection");
        }
    }

    fn record_hop_failure(&mut self, index: usize, error: RoutingError) {
        let seq = &mut self.commits[index];
        if seq.failure.is_none() {
            seq.failure = Some(error);
        }
        seq.failed_edge = if seq.hop > 0 {
            seq.route.edges.get(seq.hop - 1).copied()
        } else {
            None
        };
    }

    async fn begin_unwind(&mut self, index: usize) {
        self.commits[index].phase = CommitPhase::Unwinding;
        self.advance_unwind(index).await;
    }

    /// Disconnects established hops most-recent-first, then resolves the
    /// commit: re-plan around the failed edge or report the failure.
    async fn advance_unwind(&mut self, index: usize) {
        let (mc, last) = {
            let seq = &self.commits[index];
            (seq.mc, seq.established.last().copied())
        };
        if let Some((connection, domain)) = last {
            if let Err(err) = self
                .store
                .set_connection_state(connection, ConnectionState::Disconnecting)
            {
                tracing::warn!(%connection, %err, "unwind state change failed");
            }
            let dispatched: Result<Handle, RoutingError> = async {
                let adapter = self.adapter_for(domain)?;
                let handle = self.dispatcher.begin(
                    HandleKind::Disconnect,
                    vec![BusyTarget::Connection(connection)],
                    CompletionAction::DisconnectDone { connection },
                )?;
                if let Err(err) = adapter
                    .dispatch(DomainAction::Disconnect { handle, connection })
                    .await
                {
                    self.dispatcher.finish(handle);
                    return Err(RoutingError::ActionFailed { code: err.code() });
                }
                Ok(handle)
            }
            .await;
            match dispatched {
                Ok(handle) => {
                    self.commits[index].current = Some((connection, handle));
                }
                Err(err) => {
                    // Cannot even ask the domain; drop the record and move on.
                    tracing::warn!(%mc, %connection, %err, "unwind dispatch failed");
                    self.discard_unwound_connection(index, connection);
                    Box::pin(self.advance_unwind(index)).await;
                }
            }
            return;
        }

        // Everything unwound. Either re-plan or give up.
        let (canceled, attempts_left, failed_edge) = {
            let seq = &self.commits[index];
            (seq.canceled, seq.attempts_left, seq.failed_edge)
        };
        if !canceled && attempts_left > 0 {
            if let Some(edge) = failed_edge {
                let (source, sink, mut excluded) = {
                    let seq = &self.commits[index];
                    (seq.source, seq.sink, seq.excluded.clone())
                };
                excluded.push(edge);
                match self.planner.plan_avoiding(&self.store, source, sink, &excluded) {
                    Ok(mut routes) => {
                        let seq = &mut self.commits[index];
                        seq.route = routes.remove(0);
                        seq.excluded = excluded;
                        seq.attempts_left -= 1;
                        seq.hop = 0;
                        seq.phase = CommitPhase::Connecting;
                        seq.failure = None;
                        seq.failed_edge = None;
                        tracing::info!(mc = %seq.mc, "re-planning around failed transition");
                        Box::pin(self.start_hop(index)).await;
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(%err, "no alternative route");
                    }
                }
            }
        }
        self.finish_commit_failed(index);
    }

    /// Drops a constituent whose unwind ack (or dispatch) concluded.
    fn discard_unwound_connection(&mut self, index: usize, connection: ConnectionId) {
        let seq = &mut self.commits[index];
        seq.established.retain(|(c, _)| *c != connection);
        let remaining: Vec<ConnectionId> = seq.established.iter().map(|(c, _)| *c).collect();
        let mc = seq.mc;
        if let Err(err) = self.store.set_main_connection_route(mc, remaining) {
            tracing::warn!(%mc, %err, "failed to trim main connection route");
        }
        if let Err(err) = self.store.remove_connection(connection) {
            tracing::warn!(%connection, %err, "failed to remove unwound connection");
        }
    }

    /// Removes the main connection and reports the recorded failure.
    fn finish_commit_failed(&mut self, index: usize) {
        let mut seq = self.commits.remove(index);
        if let Err(err) = self.store.remove_main_connection(seq.mc) {
            tracing::warn!(mc = %seq.mc, %err, "failed to remove main connection");
        }
        let error = seq.failure.take().unwrap_or(RoutingError::Aborted);
        tracing::warn!(mc = %seq.mc, %error, "commit failed");
        if let Some(reply) = seq.reply.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn cancel_connect(&mut self, id: MainConnectionId) -> Result<(), RoutingError> {
        match self.commits.iter_mut().find(|c| c.mc == id) {
            Some(seq) => {
                seq.canceled = true;
                if seq.failure.is_none() {
                    seq.failure = Some(RoutingError::Aborted);
                }
                Ok(())
            }
            None => Err(not_found(EntityKind::MainConnection, id.raw())),
        }
    }

    // -----------------------------------------------------------------------
    // Disconnect (teardown)
    // -----------------------------------------------------------------------

    async fn start_disconnect(&mut self, id: MainConnectionId, reply: ReplyTx<()>) {
        if self.commits.iter().any(|c| c.mc == id)
            || self.teardowns.iter().any(|t| t.mc == id)
        {
            let _ = reply.send(Err(RoutingError::Busy {
                kind: EntityKind::MainConnection,
                id: id.raw(),
            }));
            return;
        }
        let Some(mc) = self.store.main_connection(id).cloned() else {
            let _ = reply.send(Err(not_found(EntityKind::MainConnection, id.raw())));
            return;
        };
        let mut remaining = Vec::with_capacity(mc.connections.len());
        for connection in &mc.connections {
            let domain = self
                .store
                .connection(*connection)
                .and_then(|c| self.store.sink(c.sink))
                .map(|s| s.domain);
            match domain {
                Some(domain) => remaining.push((*connection, domain)),
                None => {
                    tracing::warn!(%connection, "constituent without resolvable domain");
                    remaining.push((*connection, DomainId(0)));
                }
            }
        }
        self.teardowns.push(TeardownSeq {
            mc: id,
            remaining,
            current: None,
            first_failure: None,
            reply: Some(reply),
        });
        let index = self.teardowns.len() - 1;
        self.advance_teardown(index).await;
    }

    async fn advance_teardown(&mut self, index: usize) {
        let last = self.teardowns[index].remaining.last().copied();
        if let Some((connection, domain)) = last {
            if let Err(err) = self
                .store
                .set_connection_state(connection, ConnectionState::Disconnecting)
            {
                tracing::warn!(%connection, %err, "teardown state change failed");
            }
            let dispatched: Result<Handle, RoutingError> = async {
                let adapter = self.adapter_for(domain)?;
                let handle = self.dispatcher.begin(
                    HandleKind::Disconnect,
                    vec![BusyTarget::Connection(connection)],
                    CompletionAction::DisconnectDone { connection },
                )?;
                if let Err(err) = adapter
                    .dispatch(DomainAction::Disconnect { handle, connection })
                    .await
                {
                    self.dispatcher.finish(handle);
                    return Err(RoutingError::ActionFailed { code: err.code() });
                }
                Ok(handle)
            }
            .await;
            match dispatched {
                Ok(handle) => {
                    self.teardowns[index].current = Some((connection, handle));
                }
                Err(err) => {
                    let seq = &mut self.teardowns[index];
                    if seq.first_failure.is_none() {
                        seq.first_failure = Some(err);
                    }
                    self.discard_teardown_connection(index, connection);
                    Box::pin(self.advance_teardown(index)).await;
                }
            }
            return;
        }

        // All constituents gone; drop the main connection and answer.
        let mut seq = self.teardowns.remove(index);
        if let Err(err) = self.store.remove_main_connection(seq.mc) {
            tracing::warn!(mc = %seq.mc, %err, "failed to remove main connection");
        }
        if let Some(reply) = seq.reply.take() {
            let _ = reply.send(match seq.first_failure.take() {
                Some(err) => Err(err),
                None => Ok(()),
            });
        }
    }

    fn discard_teardown_connection(&mut self, index: usize, connection: ConnectionId) {
        let seq = &mut self.teardowns[index];
        seq.remaining.retain(|(c, _)| *c != connection);
        let remaining: Vec<ConnectionId> = seq.remaining.iter().map(|(c, _)| *c).collect();
        let mc = seq.mc;
        if let Err(err) = self.store.set_main_connection_route(mc, remaining) {
            tracing::warn!(%mc, %err, "failed to trim main connection route");
        }
        if let Err(err) = self.store.remove_connection(connection) {
            tracing::warn!(%connection, %err, "failed to remove torn-down connection");
        }
    }

    // -----------------------------------------------------------------------
    // Completion and timer lanes
    // -----------------------------------------------------------------------

    async fn on_completion(&mut self, completion: Completion) {
        let Completion { handle, outcome } = completion;
        let Some(action) = self.dispatcher.finish(handle) else {
            // Late ack after timeout, double ack, or a handle that never
            // existed. Discard without touching other bookkeeping.
            tracing::warn!(%handle, ?outcome, "discarding spurious completion");
            return;
        };
        match outcome {
            ActionOutcome::Success => {
                self.apply_completion(&action);
                self.resolve(handle, Ok(())).await;
            }
            ActionOutcome::Failure { code } => {
                tracing::debug!(%handle, code, "action failed");
                self.resolve(handle, Err(RoutingError::ActionFailed { code }))
                    .await;
            }
        }
    }

    async fn on_deadline(&mut self) {
        let expired = self.dispatcher.take_expired(Instant::now());
        for (handle, _action) in expired {
            tracing::warn!(%handle, "action timed out");
            self.resolve(handle, Err(RoutingError::Timeout { handle }))
                .await;
        }
    }

    /// Writes the store mutation a successful completion earned.
    ///
    /// Entities can legitimately vanish while an action is in flight
    /// (cascade removal); failures here are logged, not escalated.
    fn apply_completion(&mut self, action: &CompletionAction) {
        let result = match action {
            CompletionAction::ConnectEstablished { connection }
            | CompletionAction::CommitConnectEstablished { connection } => self
                .store
                .set_connection_state(*connection, ConnectionState::Connected),
            CompletionAction::DisconnectDone { connection } => self
                .store
                .set_connection_state(*connection, ConnectionState::Disconnected),
            CompletionAction::SourceStateSet { source, state } => {
                self.store.set_source_state(*source, *state)
            }
            CompletionAction::SinkVolumeSet { sink, volume } => {
                self.store.set_sink_volume(*sink, *volume)
            }
            CompletionAction::SourceVolumeSet { source, volume } => {
                self.store.set_source_volume(*source, *volume)
            }
            CompletionAction::SinkSoundPropertySet { sink, property } => {
                self.store.set_sink_sound_property(*sink, *property)
            }
            CompletionAction::SourceSoundPropertySet { source, property } => {
                self.store.set_source_sound_property(*source, *property)
            }
            CompletionAction::CrossfadeDone {
                crossfader,
                hot_sink,
            } => self.store.set_crossfader_hot_sink(*crossfader, *hot_sink),
            CompletionAction::VolumesSet { volumes } => {
                let mut result = Ok(());
                for entry in volumes {
                    let applied = match entry.entity {
                        VolumeEntity::Source(id) => {
                            self.store.set_source_volume(id, entry.volume)
                        }
                        VolumeEntity::Sink(id) => self.store.set_sink_volume(id, entry.volume),
                    };
                    if let Err(err) = applied {
                        result = Err(err);
                    }
                }
                result
            }
            CompletionAction::SinkNotificationSet {
                sink,
                configuration,
            } => self.store.set_sink_notification(*sink, *configuration),
            CompletionAction::SourceNotificationSet {
                source,
                configuration,
            } => self.store.set_source_notification(*source, *configuration),
        };
        if let Err(err) = result {
            tracing::warn!(%err, "completion write skipped");
        }
    }

    /// Routes a terminal handle result to whoever was waiting on it.
    async fn resolve(&mut self, handle: Handle, result: Result<(), RoutingError>) {
        if let Some(reply) = self.waiters.remove(&handle) {
            let _ = reply.send(result);
            return;
        }
        if let Some(index) = self
            .commits
            .iter()
            .position(|c| c.current.is_some_and(|(_, h)| h == handle))
        {
            self.advance_commit(index, result).await;
            return;
        }
        if let Some(index) = self
            .teardowns
            .iter()
            .position(|t| t.current.is_some_and(|(_, h)| h == handle))
        {
            self.advance_teardown_ack(index, result).await;
            return;
        }
        tracing::debug!(%handle, "terminal handle had no waiter");
    }

    async fn advance_commit(&mut self, index: usize, result: Result<(), RoutingError>) {
        let phase_connecting = matches!(self.commits[index].phase, CommitPhase::Connecting);
        let Some((connection, _)) = self.commits[index].current.take() else {
            return;
        };
        if phase_connecting {
            match result {
                Ok(()) => {
                    {
                        let seq = &mut self.commits[index];
                        let domain = seq.route.elements[seq.hop].domain;
                        seq.established.push((connection, domain));
                    }
                    let seq = &self.commits[index];
                    if seq.canceled {
                        self.begin_unwind(index).await;
                    } else if seq.hop + 1 < seq.route.elements.len() {
                        self.commits[index].hop += 1;
                        self.start_hop(index).await;
                    } else {
                        // Whole route is up.
                        let mut seq = self.commits.remove(index);
                        tracing::info!(mc = %seq.mc, hops = seq.route.elements.len(), "route committed");
                        if let Some(reply) = seq.reply.take() {
                            let _ = reply.send(Ok(seq.mc));
                        }
                    }
                }
                Err(error) => {
                    // Failed hop: drop its record, then unwind what stands.
                    let mc = self.commits[index].mc;
                    self.record_hop_failure(index, error);
                    self.rollback_hop_connection(mc, connection);
                    self.begin_unwind(index).await;
                }
            }
        } else {
            // Unwind disconnect ack; failures are logged and the unwind
            // keeps going - state is removed either way.
            if let Err(err) = result {
                tracing::warn!(%connection, %err, "unwind disconnect failed");
            }
            self.discard_unwound_connection(index, connection);
            self.advance_unwind(index).await;
        }
    }

    async fn advance_teardown_ack(&mut self, index: usize, result: Result<(), RoutingError>) {
        let Some((connection, _)) = self.teardowns[index].current.take() else {
            return;
        };
        if let Err(err) = result {
            let seq = &mut self.teardowns[index];
            if seq.first_failure.is_none() {
                seq.first_failure = Some(err);
            }
        }
        self.discard_teardown_connection(index, connection);
        self.advance_teardown(index).await;
    }

    /// Fails sequences whose main connection was cascade-removed.
    fn fail_orphaned_sequences(&mut self) {
        let mut index = 0;
        while index < self.commits.len() {
            if self.store.main_connection(self.commits[index].mc).is_none() {
                let mut seq = self.commits.remove(index);
                tracing::warn!(mc = %seq.mc, "commit orphaned by topology removal");
                if let Some(reply) = seq.reply.take() {
                    let _ = reply.send(Err(RoutingError::Aborted));
                }
            } else {
                index += 1;
            }
        }
        let mut index = 0;
        while index < self.teardowns.len() {
            if self
                .store
                .main_connection(self.teardowns[index].mc)
                .is_none()
            {
                let mut seq = self.teardowns.remove(index);
                tracing::warn!(mc = %seq.mc, "teardown orphaned by topology removal");
                if let Some(reply) = seq.reply.take() {
                    let _ = reply.send(Ok(()));
                }
            } else {
                index += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    async fn shutdown(&mut self) -> Result<(), RoutingError> {
        tracing::info!(
            pending = self.dispatcher.pending_count(),
            commits = self.commits.len(),
            "router shutting down"
        );
        for mut seq in self.commits.drain(..) {
            if let Some(reply) = seq.reply.take() {
                let _ = reply.send(Err(RoutingError::Aborted));
            }
        }
        for mut seq in self.teardowns.drain(..) {
            if let Some(reply) = seq.reply.take() {
                let _ = reply.send(Err(RoutingError::Aborted));
            }
        }
        for (_, reply) in self.waiters.drain() {
            let _ = reply.send(Err(RoutingError::Aborted));
        }
        self.dispatcher.drain();

        let rundowns = self.adapters.values().map(|a| a.on_rundown());
        futures::future::join_all(rundowns).await;

        if let Some(backend) = &self.persistence {
            let snapshot = self.store.snapshot();
            if let Err(err) = backend.snapshot(&snapshot).await {
                tracing::error!(%err, "failed to persist topology");
                return Err(RoutingError::Persistence(err));
            }
        }
        Ok(())
    }
}

fn not_found(kind: EntityKind, id: u16) -> RoutingError {
    RoutingError::NotFound { kind, id }
}
