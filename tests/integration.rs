//! Integration tests for route-audio.
//!
//! Every test drives the public API against [`MockDomainAdapter`]s; no
//! real domains are involved. Scenarios follow the daemon's contract:
//! format-pruned planning, hop-by-hop commits with unwind, the busy
//! discipline, per-handle timeouts, cascade removal, and persistence.

use std::sync::Arc;
use std::time::Duration;

use route_audio::{
    channel_events, ActionOutcome, AdapterError, AudioRouter, ConnectionFormat,
    ConvertibilityMatrix, DomainData, DomainId, EntityKind, GatewayData, GatewayId, HandleKind,
    MainConnectionState, MemoryBackend, MockBehavior, MockDomainAdapter, RouterConfig,
    RoutingError, Session, SinkData, SinkId, SourceData, SourceId, SourceState, TopologyEvent,
};

fn stereo() -> Vec<ConnectionFormat> {
    vec![ConnectionFormat::STEREO]
}

/// Polls until `probe` returns true, yielding to the reactor in between.
async fn wait_for(probe: impl Fn() -> bool) {
    for _ in 0..500 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

/// Two-domain topology: cabin (radio, gateway-in) and amp (gateway-out,
/// speakers) joined by one stereo gateway.
struct TwoDomains {
    session: Session,
    cabin_adapter: MockDomainAdapter,
    amp_adapter: MockDomainAdapter,
    cabin: DomainId,
    amp: DomainId,
    radio: SourceId,
    speakers: SinkId,
    gw_in: SinkId,
    gw_out: SourceId,
    gateway: GatewayId,
    backend: MemoryBackend,
}

impl TwoDomains {
    async fn start() -> Self {
        Self::start_with_config(RouterConfig::default()).await
    }

    async fn start_with_config(config: RouterConfig) -> Self {
        let cabin_adapter = MockDomainAdapter::new("bus.cabin");
        let amp_adapter = MockDomainAdapter::new("bus.amp");
        let backend = MemoryBackend::new();
        let session = AudioRouter::builder()
            .with_config(config)
            .add_adapter(cabin_adapter.clone())
            .add_adapter(amp_adapter.clone())
            .with_persistence(backend.clone())
            .start()
            .await
            .unwrap();

        let cabin = session
            .register_domain(DomainData::new("cabin", "bus.cabin"))
            .await
            .unwrap();
        let amp = session
            .register_domain(DomainData::new("amp", "bus.amp"))
            .await
            .unwrap();
        let radio = session
            .register_source(SourceData::new(cabin, "radio", stereo()))
            .await
            .unwrap();
        let speakers = session
            .register_sink(SinkData::new(amp, "speakers", stereo()))
            .await
            .unwrap();
        let gw_in = session
            .register_sink(SinkData::new(cabin, "gateway-in", stereo()))
            .await
            .unwrap();
        let gw_out = session
            .register_source(SourceData::new(amp, "gateway-out", stereo()))
            .await
            .unwrap();
        let gateway = session
            .register_gateway(GatewayData::new(
                "cabin-amp",
                gw_in,
                gw_out,
                cabin,
                amp,
                ConvertibilityMatrix::identity(stereo()),
            ))
            .await
            .unwrap();

        Self {
            session,
            cabin_adapter,
            amp_adapter,
            cabin,
            amp,
            radio,
            speakers,
            gw_in,
            gw_out,
            gateway,
            backend,
        }
    }

    /// Adds a second, heavier gateway between the same two domains.
    async fn add_backup_gateway(&self) -> GatewayId {
        let gw_in = self
            .session
            .register_sink(SinkData::new(self.cabin, "backup-in", stereo()))
            .await
            .unwrap();
        let gw_out = self
            .session
            .register_source(SourceData::new(self.amp, "backup-out", stereo()))
            .await
            .unwrap();
        let mut data = GatewayData::new(
            "cabin-amp-backup",
            gw_in,
            gw_out,
            self.cabin,
            self.amp,
            ConvertibilityMatrix::identity(stereo()),
        );
        data.weight = 5;
        self.session.register_gateway(data).await.unwrap()
    }
}

/// Unwraps a shared session once every clone is gone.
fn reclaim(session: Arc<Session>) -> Session {
    Arc::try_unwrap(session)
        .ok()
        .expect("session still shared")
}

#[tokio::test]
async fn test_two_domain_route_plan_shape() {
    let fx = TwoDomains::start().await;

    let routes = fx.session.plan(fx.radio, fx.speakers).await.unwrap();
    assert_eq!(routes.len(), 1);
    let route = &routes[0];
    assert_eq!(route.elements.len(), 2);

    assert_eq!(route.elements[0].source, fx.radio);
    assert_eq!(route.elements[0].sink, fx.gw_in);
    assert_eq!(route.elements[0].domain, fx.cabin);
    assert_eq!(route.elements[0].format, ConnectionFormat::STEREO);

    assert_eq!(route.elements[1].source, fx.gw_out);
    assert_eq!(route.elements[1].sink, fx.speakers);
    assert_eq!(route.elements[1].domain, fx.amp);
    assert_eq!(route.elements[1].format, ConnectionFormat::STEREO);

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_commit_produces_connected_main_connection() {
    let fx = TwoDomains::start().await;

    let mc = fx.session.connect(fx.radio, fx.speakers).await.unwrap();

    let main = fx.session.main_connection(mc).await.unwrap();
    assert_eq!(main.state, MainConnectionState::Connected);
    assert_eq!(main.connections.len(), 2);

    // One connect per hop, dispatched to the hop's domain.
    let cabin_handles = fx.cabin_adapter.handles();
    let amp_handles = fx.amp_adapter.handles();
    assert_eq!(cabin_handles.len(), 1);
    assert_eq!(amp_handles.len(), 1);
    assert_eq!(cabin_handles[0].kind, HandleKind::Connect);
    assert_eq!(amp_handles[0].kind, HandleKind::Connect);

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_denied_matrix_means_no_route() {
    let fx = TwoDomains::start().await;

    // Replace the permissive gateway with one that denies stereo->stereo.
    fx.session.deregister_gateway(fx.gateway).await.unwrap();
    fx.session
        .register_gateway(GatewayData::new(
            "cabin-amp-denying",
            fx.gw_in,
            fx.gw_out,
            fx.cabin,
            fx.amp,
            ConvertibilityMatrix::from_fn(stereo(), stereo(), |_, _| false),
        ))
        .await
        .unwrap();

    assert!(matches!(
        fx.session.plan(fx.radio, fx.speakers).await.unwrap_err(),
        RoutingError::NoRoute { .. }
    ));
    assert!(matches!(
        fx.session.connect(fx.radio, fx.speakers).await.unwrap_err(),
        RoutingError::NoRoute { .. }
    ));
    assert!(fx.cabin_adapter.handles().is_empty());

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_second_hop_unwinds_first() {
    let fx = TwoDomains::start().await;

    let before = fx.session.snapshot().await.unwrap();
    // Second hop runs in the amp domain; make it fail.
    fx.amp_adapter
        .script_outcome(ActionOutcome::Failure { code: 7 });

    let err = fx.session.connect(fx.radio, fx.speakers).await.unwrap_err();
    assert!(matches!(err, RoutingError::ActionFailed { code: 7 }));

    // The cabin hop succeeded first and must have been unwound.
    let cabin_kinds: Vec<HandleKind> = fx
        .cabin_adapter
        .handles()
        .iter()
        .map(|h| h.kind)
        .collect();
    assert_eq!(cabin_kinds, vec![HandleKind::Connect, HandleKind::Disconnect]);

    // Store is back in its pre-commit shape.
    let after = fx.session.snapshot().await.unwrap();
    assert_eq!(before, after);
    assert!(fx.session.connections().await.unwrap().is_empty());
    assert!(fx.session.main_connections().await.unwrap().is_empty());

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_replan_around_failed_gateway() {
    let fx = TwoDomains::start().await;
    fx.add_backup_gateway().await;

    // First amp-side connect (through the primary gateway) fails once.
    fx.amp_adapter
        .script_outcome(ActionOutcome::Failure { code: 9 });

    let mc = fx.session.connect(fx.radio, fx.speakers).await.unwrap();
    let main = fx.session.main_connection(mc).await.unwrap();
    assert_eq!(main.state, MainConnectionState::Connected);

    // Cabin saw: connect (primary), unwind disconnect, connect (backup).
    let cabin_kinds: Vec<HandleKind> = fx
        .cabin_adapter
        .handles()
        .iter()
        .map(|h| h.kind)
        .collect();
    assert_eq!(
        cabin_kinds,
        vec![
            HandleKind::Connect,
            HandleKind::Disconnect,
            HandleKind::Connect
        ]
    );
    // Amp saw the failed primary connect and the successful backup one.
    assert_eq!(fx.amp_adapter.handles().len(), 2);

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_tears_down_most_recent_first() {
    let fx = TwoDomains::start().await;

    let mc = fx.session.connect(fx.radio, fx.speakers).await.unwrap();
    fx.session.disconnect(mc).await.unwrap();

    assert!(fx.session.connections().await.unwrap().is_empty());
    assert!(fx.session.main_connections().await.unwrap().is_empty());

    let amp_kinds: Vec<HandleKind> = fx.amp_adapter.handles().iter().map(|h| h.kind).collect();
    assert_eq!(amp_kinds, vec![HandleKind::Connect, HandleKind::Disconnect]);
    let cabin_kinds: Vec<HandleKind> = fx
        .cabin_adapter
        .handles()
        .iter()
        .map(|h| h.kind)
        .collect();
    assert_eq!(cabin_kinds, vec![HandleKind::Connect, HandleKind::Disconnect]);

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_busy_while_action_pending_then_success() {
    let fx = TwoDomains::start().await;
    fx.amp_adapter.set_behavior(MockBehavior::Manual);
    let speakers = fx.speakers;
    let session = Arc::new(fx.session);

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .set_sink_volume(speakers, -100, Default::default())
                .await
        })
    };

    let amp = fx.amp_adapter.clone();
    wait_for(move || amp.handles().len() == 1).await;

    // Same sink, action still pending: Busy.
    let err = session
        .set_sink_volume(speakers, -200, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RoutingError::Busy {
            kind: EntityKind::Sink,
            ..
        }
    ));

    // Complete the first action; the volume lands in the store.
    let handle = fx.amp_adapter.handles()[0];
    assert!(fx.amp_adapter.complete(handle, ActionOutcome::Success));
    first.await.unwrap().unwrap();

    let sinks = session.sinks().await.unwrap();
    let sink = sinks.iter().find(|s| s.id == speakers).unwrap();
    assert_eq!(sink.volume, -100);

    // And the sink accepts actions again.
    fx.amp_adapter.set_behavior(MockBehavior::Auto);
    session
        .set_sink_volume(speakers, -200, Default::default())
        .await
        .unwrap();

    reclaim(session).stop().await.unwrap();
}

#[tokio::test]
async fn test_handles_unique_under_concurrent_dispatch() {
    let fx = TwoDomains::start().await;
    fx.amp_adapter.set_behavior(MockBehavior::Manual);
    let session = Arc::new(fx.session);

    // Several unrelated sinks with concurrently pending actions.
    let mut tasks = Vec::new();
    for i in 0..5 {
        let sink = session
            .register_sink(SinkData::new(fx.amp, format!("aux-{i}"), stereo()))
            .await
            .unwrap();
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            session.set_sink_volume(sink, -50, Default::default()).await
        }));
    }

    let amp = fx.amp_adapter.clone();
    wait_for(move || amp.handles().len() == 5).await;

    let handles = fx.amp_adapter.handles();
    let mut ids: Vec<u16> = handles.iter().map(|h| h.id.raw()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5, "pending handle ids must be unique");

    for handle in handles {
        fx.amp_adapter.complete(handle, ActionOutcome::Success);
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    reclaim(session).stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_action_times_out() {
    let config = RouterConfig {
        handle_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let fx = TwoDomains::start_with_config(config).await;
    fx.amp_adapter.set_behavior(MockBehavior::Silent);

    let err = fx
        .session
        .set_sink_volume(fx.speakers, -100, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::Timeout { .. }));

    // The store saw no volume change.
    let sinks = fx.session.sinks().await.unwrap();
    let speakers = sinks.iter().find(|s| s.id == fx.speakers).unwrap();
    assert_eq!(speakers.volume, 0);

    // A late ack for the expired handle is discarded; the sink is usable.
    let expired = fx.amp_adapter.handles()[0];
    fx.amp_adapter.complete(expired, ActionOutcome::Success);
    fx.amp_adapter.set_behavior(MockBehavior::Auto);
    fx.session
        .set_sink_volume(fx.speakers, -300, Default::default())
        .await
        .unwrap();
    let sinks = fx.session.sinks().await.unwrap();
    let speakers = sinks.iter().find(|s| s.id == fx.speakers).unwrap();
    assert_eq!(speakers.volume, -300);

    fx.session.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_commit_unwinds() {
    let config = RouterConfig {
        handle_timeout: Duration::from_millis(200),
        replan_attempts: 0,
        ..Default::default()
    };
    let fx = TwoDomains::start_with_config(config).await;
    // The amp hop never answers.
    fx.amp_adapter.set_behavior(MockBehavior::Silent);

    let err = fx.session.connect(fx.radio, fx.speakers).await.unwrap_err();
    assert!(matches!(err, RoutingError::Timeout { .. }));
    assert!(fx.session.connections().await.unwrap().is_empty());
    assert!(fx.session.main_connections().await.unwrap().is_empty());

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_unwinds_after_inflight_hop() {
    let fx = TwoDomains::start().await;
    fx.cabin_adapter.set_behavior(MockBehavior::Manual);
    let (radio, speakers) = (fx.radio, fx.speakers);
    let session = Arc::new(fx.session);

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(radio, speakers).await })
    };

    // Wait for the first hop to be in flight, then cancel.
    let cabin = fx.cabin_adapter.clone();
    wait_for(move || cabin.handles().len() == 1).await;
    let mcs = session.main_connections().await.unwrap();
    assert_eq!(mcs.len(), 1);
    session.cancel_connect(mcs[0].id).await.unwrap();

    // The in-flight hop completes successfully, then gets unwound.
    let handle = fx.cabin_adapter.handles()[0];
    fx.cabin_adapter.complete(handle, ActionOutcome::Success);
    let cabin = fx.cabin_adapter.clone();
    wait_for(move || cabin.handles().len() == 2).await;
    let unwind = fx.cabin_adapter.handles()[1];
    assert_eq!(unwind.kind, HandleKind::Disconnect);
    fx.cabin_adapter.complete(unwind, ActionOutcome::Success);

    assert!(matches!(
        connect.await.unwrap().unwrap_err(),
        RoutingError::Aborted
    ));
    assert!(session.main_connections().await.unwrap().is_empty());
    // The amp hop was never dispatched.
    assert!(fx.amp_adapter.handles().is_empty());

    reclaim(session).stop().await.unwrap();
}

#[tokio::test]
async fn test_domain_removal_cascades_with_events() {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(64);
    let cabin_adapter = MockDomainAdapter::new("bus.cabin");
    let amp_adapter = MockDomainAdapter::new("bus.amp");
    let session = AudioRouter::builder()
        .add_adapter(cabin_adapter)
        .add_adapter(amp_adapter)
        .subscribe(channel_events(event_tx))
        .start()
        .await
        .unwrap();

    let cabin = session
        .register_domain(DomainData::new("cabin", "bus.cabin"))
        .await
        .unwrap();
    let amp = session
        .register_domain(DomainData::new("amp", "bus.amp"))
        .await
        .unwrap();
    let radio = session
        .register_source(SourceData::new(cabin, "radio", stereo()))
        .await
        .unwrap();
    let speakers = session
        .register_sink(SinkData::new(amp, "speakers", stereo()))
        .await
        .unwrap();
    let gw_in = session
        .register_sink(SinkData::new(cabin, "gateway-in", stereo()))
        .await
        .unwrap();
    let gw_out = session
        .register_source(SourceData::new(amp, "gateway-out", stereo()))
        .await
        .unwrap();
    let gateway = session
        .register_gateway(GatewayData::new(
            "cabin-amp",
            gw_in,
            gw_out,
            cabin,
            amp,
            ConvertibilityMatrix::identity(stereo()),
        ))
        .await
        .unwrap();
    let mc = session.connect(radio, speakers).await.unwrap();

    // Without cascade the removal must be refused, and nothing changes.
    assert!(matches!(
        session.deregister_domain(cabin, false).await.unwrap_err(),
        RoutingError::Conflict { .. }
    ));
    assert!(session.domains().await.unwrap().iter().any(|d| d.id == cabin));

    session.deregister_domain(cabin, true).await.unwrap();

    // Everything the cabin owned (and the path through it) is gone.
    assert!(session.sources().await.unwrap().iter().all(|s| s.id != radio));
    assert!(session.sinks().await.unwrap().iter().all(|s| s.id != gw_in));
    assert!(session.gateways().await.unwrap().is_empty());
    assert!(session.connections().await.unwrap().is_empty());
    assert!(session.main_connections().await.unwrap().is_empty());
    // The amp side survives.
    assert!(session.domains().await.unwrap().iter().any(|d| d.id == amp));
    assert!(session
        .sinks()
        .await
        .unwrap()
        .iter()
        .any(|s| s.id == speakers));

    // One removal notification per removed entity.
    let mut removed = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        match event {
            TopologyEvent::DomainRemoved { .. }
            | TopologyEvent::SourceRemoved { .. }
            | TopologyEvent::SinkRemoved { .. }
            | TopologyEvent::GatewayRemoved { .. }
            | TopologyEvent::ConnectionRemoved { .. }
            | TopologyEvent::MainConnectionRemoved { .. } => removed.push(event.entity()),
            _ => {}
        }
    }
    assert!(removed.contains(&(EntityKind::Domain, cabin.raw())));
    assert!(removed.contains(&(EntityKind::Source, radio.raw())));
    assert!(removed.contains(&(EntityKind::Sink, gw_in.raw())));
    assert!(removed.contains(&(EntityKind::Gateway, gateway.raw())));
    assert!(removed.contains(&(EntityKind::MainConnection, mc.raw())));
    // Both constituent connections were reported, including the amp-side one.
    assert_eq!(
        removed
            .iter()
            .filter(|(kind, _)| *kind == EntityKind::Connection)
            .count(),
        2
    );

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_persistence_snapshot_and_restore() {
    let fx = TwoDomains::start().await;
    let backend = fx.backend.clone();
    let radio = fx.radio;

    fx.session
        .set_source_volume(radio, -77, Default::default())
        .await
        .unwrap();
    fx.session.stop().await.unwrap();

    let stored = backend.stored().expect("stop() must persist a snapshot");
    assert_eq!(stored.domains.len(), 2);
    let stored_radio = stored.sources.iter().find(|s| s.id == radio).unwrap();
    assert_eq!(stored_radio.volume, -77);

    // A new router restores the same topology.
    let session = AudioRouter::builder()
        .add_adapter(MockDomainAdapter::new("bus.cabin"))
        .add_adapter(MockDomainAdapter::new("bus.amp"))
        .with_persistence(backend)
        .start()
        .await
        .unwrap();
    let sources = session.sources().await.unwrap();
    let restored_radio = sources.iter().find(|s| s.id == radio).unwrap();
    assert_eq!(restored_radio.volume, -77);
    assert_eq!(session.snapshot().await.unwrap(), stored);

    session.stop().await.unwrap();
}

/// A minimal file-backed persistence backend with its own line format.
///
/// The core treats the stored format as opaque; this backend only keeps
/// domains and sources, which is enough to prove the restore path works
/// against a real file.
struct FileBackend {
    path: std::path::PathBuf,
}

#[async_trait::async_trait]
impl route_audio::PersistenceBackend for FileBackend {
    async fn restore(
        &self,
    ) -> Result<Option<route_audio::TopologySnapshot>, route_audio::PersistenceError> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Ok(None);
        };
        let mut snapshot = route_audio::TopologySnapshot::default();
        for line in text.lines() {
            let fields: Vec<&str> = line.split('|').collect();
            match fields.as_slice() {
                ["domain", id, name, bus_name] => snapshot.domains.push(route_audio::Domain {
                    id: DomainId::from(id.parse::<u16>().unwrap()),
                    name: (*name).to_string(),
                    bus_name: (*bus_name).to_string(),
                    node_name: String::new(),
                    early: false,
                    complete: false,
                    state: route_audio::DomainState::Controlled,
                }),
                ["source", id, domain, name, volume] => {
                    snapshot.sources.push(route_audio::Source {
                        id: SourceId::from(id.parse::<u16>().unwrap()),
                        domain: DomainId::from(domain.parse::<u16>().unwrap()),
                        class_id: 0,
                        name: (*name).to_string(),
                        volume: volume.parse().unwrap(),
                        visible: true,
                        availability: route_audio::Availability::available(),
                        state: SourceState::Off,
                        formats: stereo(),
                        sound_properties: Vec::new(),
                        notification_configurations: Vec::new(),
                    });
                }
                _ => {
                    return Err(route_audio::PersistenceError::Corrupt {
                        reason: format!("unexpected record: {line}"),
                    })
                }
            }
        }
        Ok(Some(snapshot))
    }

    async fn snapshot(
        &self,
        topology: &route_audio::TopologySnapshot,
    ) -> Result<(), route_audio::PersistenceError> {
        let mut text = String::new();
        for domain in &topology.domains {
            text.push_str(&format!(
                "domain|{}|{}|{}\n",
                domain.id, domain.name, domain.bus_name
            ));
        }
        for source in &topology.sources {
            text.push_str(&format!(
                "source|{}|{}|{}|{}\n",
                source.id, source.domain, source.name, source.volume
            ));
        }
        std::fs::write(&self.path, text).map_err(|err| route_audio::PersistenceError::Store {
            path: self.path.clone(),
            reason: err.to_string(),
        })
    }
}

#[tokio::test]
async fn test_file_backed_persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("topology.db");

    let session = AudioRouter::builder()
        .add_adapter(MockDomainAdapter::new("bus.cabin"))
        .with_persistence(FileBackend { path: path.clone() })
        .start()
        .await
        .unwrap();
    let cabin = session
        .register_domain(DomainData::new("cabin", "bus.cabin"))
        .await
        .unwrap();
    let radio = session
        .register_source(SourceData::new(cabin, "radio", stereo()))
        .await
        .unwrap();
    session
        .set_source_volume(radio, -42, Default::default())
        .await
        .unwrap();
    session.stop().await.unwrap();

    assert!(path.exists());

    let session = AudioRouter::builder()
        .add_adapter(MockDomainAdapter::new("bus.cabin"))
        .with_persistence(FileBackend { path })
        .start()
        .await
        .unwrap();
    let sources = session.sources().await.unwrap();
    let restored = sources.iter().find(|s| s.id == radio).unwrap();
    assert_eq!(restored.volume, -42);
    assert_eq!(restored.domain, cabin);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_adapter_rejection_surfaces_as_action_failure() {
    let fx = TwoDomains::start().await;
    fx.amp_adapter
        .script_rejection(AdapterError::Rejected { code: 21 });

    let err = fx
        .session
        .set_sink_volume(fx.speakers, -10, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::ActionFailed { code: 21 }));

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_source_state_round_trip() {
    let fx = TwoDomains::start().await;

    fx.session
        .set_source_state(fx.radio, SourceState::On)
        .await
        .unwrap();
    let sources = fx.session.sources().await.unwrap();
    let radio = sources.iter().find(|s| s.id == fx.radio).unwrap();
    assert_eq!(radio.state, SourceState::On);

    let kinds: Vec<HandleKind> = fx.cabin_adapter.handles().iter().map(|h| h.kind).collect();
    assert_eq!(kinds, vec![HandleKind::SetSourceState]);

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_endpoint_rejected_before_dispatch() {
    let fx = TwoDomains::start().await;

    let err = fx
        .session
        .connect(SourceId::from(999), fx.speakers)
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::InvalidEndpoint { .. }));
    assert!(fx.cabin_adapter.handles().is_empty());
    assert!(fx.amp_adapter.handles().is_empty());

    fx.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_gateway_removal_invalidates_route() {
    let fx = TwoDomains::start().await;

    fx.session.deregister_gateway(fx.gateway).await.unwrap();
    assert!(matches!(
        fx.session.plan(fx.radio, fx.speakers).await.unwrap_err(),
        RoutingError::NoRoute { .. }
    ));

    fx.session.stop().await.unwrap();
}
