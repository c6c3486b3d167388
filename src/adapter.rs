//! Domain adapter trait and implementations.
//!
//! A [`DomainAdapter`] is the routing core's view of one plugin: the party
//! that actually talks to an audio domain (over D-Bus, CommonAPI, a socket,
//! or in-process). The core dispatches [`DomainAction`]s at it; the adapter
//! queues them with its domain and reports each action's outcome exactly
//! once through the [`CompletionSender`] handed over at startup. Outcomes
//! may be reported from any thread; they are marshaled onto the reactor.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::dispatch::Handle;
use crate::error::AdapterError;
use crate::format::ConnectionFormat;
use crate::ids::{ConnectionId, CrossfaderId, SinkId, SourceId};
use crate::topology::{
    HotSink, NotificationConfiguration, SoundProperty, SourceState, VolumeRamp,
};

/// Target of one entry in a batched volume change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeEntity {
    /// A source volume.
    Source(SourceId),
    /// A sink volume.
    Sink(SinkId),
}

/// One entry of a batched volume change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeTarget {
    /// The endpoint whose volume changes.
    pub entity: VolumeEntity,
    /// The target volume.
    pub volume: i16,
    /// Ramp to apply.
    pub ramp: VolumeRamp,
}

/// An asynchronous action dispatched at a domain.
///
/// Every action carries the [`Handle`] that identifies it; the adapter must
/// echo that handle in its completion report.
#[derive(Debug, Clone)]
pub enum DomainAction {
    /// Establish a connection.
    Connect {
        /// Handle to ack with.
        handle: Handle,
        /// Connection record being established.
        connection: ConnectionId,
        /// Producing endpoint.
        source: SourceId,
        /// Consuming endpoint.
        sink: SinkId,
        /// Negotiated format.
        format: ConnectionFormat,
    },
    /// Tear a connection down.
    Disconnect {
        /// Handle to ack with.
        handle: Handle,
        /// Connection record being torn down.
        connection: ConnectionId,
    },
    /// Change a source's runtime state.
    SetSourceState {
        /// Handle to ack with.
        handle: Handle,
        /// Affected source.
        source: SourceId,
        /// Requested state.
        state: SourceState,
    },
    /// Change a sink's volume.
    SetSinkVolume {
        /// Handle to ack with.
        handle: Handle,
        /// Affected sink.
        sink: SinkId,
        /// Requested volume.
        volume: i16,
        /// Ramp to apply.
        ramp: VolumeRamp,
    },
    /// Change a source's volume.
    SetSourceVolume {
        /// Handle to ack with.
        handle: Handle,
        /// Affected source.
        source: SourceId,
        /// Requested volume.
        volume: i16,
        /// Ramp to apply.
        ramp: VolumeRamp,
    },
    /// Change a sound property on a sink.
    SetSinkSoundProperty {
        /// Handle to ack with.
        handle: Handle,
        /// Affected sink.
        sink: SinkId,
        /// Requested property value.
        property: SoundProperty,
    },
    /// Change a sound property on a source.
    SetSourceSoundProperty {
        /// Handle to ack with.
        handle: Handle,
        /// Affected source.
        source: SourceId,
        /// Requested property value.
        property: SoundProperty,
    },
    /// Fade between the two sinks of a crossfader.
    Crossfade {
        /// Handle to ack with.
        handle: Handle,
        /// Affected crossfader.
        crossfader: CrossfaderId,
        /// Side that should end up hot.
        hot_sink: HotSink,
        /// Ramp to apply.
        ramp: VolumeRamp,
    },
    /// Change several volumes atomically.
    SetVolumes {
        /// Handle to ack with.
        handle: Handle,
        /// Entries to apply.
        volumes: Vec<VolumeTarget>,
    },
    /// Configure value reporting on a sink.
    SetSinkNotification {
        /// Handle to ack with.
        handle: Handle,
        /// Affected sink.
        sink: SinkId,
        /// Requested configuration.
        configuration: NotificationConfiguration,
    },
    /// Configure value reporting on a source.
    SetSourceNotification {
        /// Handle to ack with.
        handle: Handle,
        /// Affected source.
        source: SourceId,
        /// Requested configuration.
        configuration: NotificationConfiguration,
    },
}

impl DomainAction {
    /// The handle identifying this action.
    #[must_use]
    pub fn handle(&self) -> Handle {
        match self {
            Self::Connect { handle, .. }
            | Self::Disconnect { handle, .. }
            | Self::SetSourceState { handle, .. }
            | Self::SetSinkVolume { handle, .. }
            | Self::SetSourceVolume { handle, .. }
            | Self::SetSinkSoundProperty { handle, .. }
            | Self::SetSourceSoundProperty { handle, .. }
            | Self::Crossfade { handle, .. }
            | Self::SetVolumes { handle, .. }
            | Self::SetSinkNotification { handle, .. }
            | Self::SetSourceNotification { handle, .. } => *handle,
        }
    }
}

/// How a dispatched action ended, from the domain's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The domain executed the action.
    Success,
    /// The domain failed with a domain-defined error code.
    Failure {
        /// Domain-defined error code.
        code: u16,
    },
}

/// A completion report for one dispatched handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The handle being acknowledged.
    pub handle: Handle,
    /// How the action ended.
    pub outcome: ActionOutcome,
}

/// Thread-safe channel into the reactor for completion reports.
///
/// Handed to every adapter at startup. `report` never blocks and may be
/// called from any thread - this is the marshaling point that keeps all
/// topology mutation on the reactor.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: tokio::sync::mpsc::Sender<Completion>,
}

impl CompletionSender {
    pub(crate) fn new(tx: tokio::sync::mpsc::Sender<Completion>) -> Self {
        Self { tx }
    }

    /// Reports the outcome of a dispatched handle.
    ///
    /// A report that cannot be queued (reactor gone, queue full) is logged
    /// and dropped; the corresponding handle then ends by timeout.
    pub fn report(&self, handle: Handle, outcome: ActionOutcome) {
        let completion = Completion { handle, outcome };
        if let Err(err) = self.tx.try_send(completion) {
            tracing::error!(%handle, ?err, "failed to queue completion report");
        }
    }
}

/// The routing core's view of one domain plugin.
///
/// # Implementation Notes
///
/// - Methods take `&self` - use interior mutability if needed
/// - `dispatch` must only *queue* the action and return promptly; the
///   actual work is acknowledged later through the [`CompletionSender`]
/// - Every accepted dispatch must be acknowledged exactly once, or the
///   core's per-handle timeout fires instead
/// - `on_startup` is called once before any dispatch; keep the given
///   sender for the lifetime of the adapter
///
/// # Example
///
/// ```
/// use route_audio::{ActionOutcome, CompletionSender, DomainAction, DomainAdapter};
/// use route_audio::AdapterError;
/// use async_trait::async_trait;
/// use parking_lot::Mutex;
///
/// struct LoopbackAdapter {
///     completions: Mutex<Option<CompletionSender>>,
/// }
///
/// #[async_trait]
/// impl DomainAdapter for LoopbackAdapter {
///     fn bus_name(&self) -> &str {
///         "bus.loopback"
///     }
///
///     async fn on_startup(&self, completions: CompletionSender) {
///         *self.completions.lock() = Some(completions);
///     }
///
///     async fn dispatch(&self, action: DomainAction) -> Result<(), AdapterError> {
///         // A real adapter would forward to its domain here.
///         if let Some(completions) = &*self.completions.lock() {
///             completions.report(action.handle(), ActionOutcome::Success);
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait DomainAdapter: Send + Sync {
    /// The bus name domains registered through this adapter answer on.
    fn bus_name(&self) -> &str;

    /// Called once before any dispatch.
    ///
    /// The adapter must keep the sender and use it for every completion
    /// report. Default implementation drops it (useful only for adapters
    /// that never accept actions).
    async fn on_startup(&self, completions: CompletionSender) {
        let _ = completions;
    }

    /// Called during graceful shutdown, after the last dispatch.
    async fn on_rundown(&self) {}

    /// Queues an action with the domain.
    ///
    /// Errors here mean the action could not even be queued; the core
    /// retires the handle immediately without waiting for a completion.
    async fn dispatch(&self, action: DomainAction) -> Result<(), AdapterError>;
}

/// How a [`MockDomainAdapter`] answers dispatched actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Acknowledge every action immediately (scripted outcomes first).
    Auto,
    /// Record actions but only acknowledge when the test calls
    /// [`MockDomainAdapter::complete`].
    Manual,
    /// Never acknowledge; dispatched handles run into their timeout.
    Silent,
}

struct MockState {
    completions: Mutex<Option<CompletionSender>>,
    actions: Mutex<Vec<DomainAction>>,
    scripted: Mutex<VecDeque<ActionOutcome>>,
    behavior: Mutex<MockBehavior>,
    rejections: Mutex<VecDeque<AdapterError>>,
}

/// A scriptable in-memory adapter for tests and examples.
///
/// Records every dispatched action and, in [`MockBehavior::Auto`] mode,
/// acknowledges each one immediately - with outcomes from the scripted
/// queue first, then `Success`. Clones share state, so keep one clone in
/// the test while the router owns the other.
///
/// # Example
///
/// ```
/// use route_audio::{ActionOutcome, MockDomainAdapter};
///
/// let adapter = MockDomainAdapter::new("bus.cabin");
/// let probe = adapter.clone();
/// // hand `adapter` to the router builder, drive it, then inspect:
/// assert!(probe.actions().is_empty());
/// ```
#[derive(Clone)]
pub struct MockDomainAdapter {
    bus_name: String,
    state: Arc<MockState>,
}

impl MockDomainAdapter {
    /// Creates an auto-acknowledging mock for the given bus name.
    #[must_use]
    pub fn new(bus_name: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            state: Arc::new(MockState {
                completions: Mutex::new(None),
                actions: Mutex::new(Vec::new()),
                scripted: Mutex::new(VecDeque::new()),
                behavior: Mutex::new(MockBehavior::Auto),
                rejections: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Switches the answering behavior.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Queues an outcome for the next auto-acknowledged action.
    pub fn script_outcome(&self, outcome: ActionOutcome) {
        self.state.scripted.lock().push_back(outcome);
    }

    /// Queues a synchronous rejection for the next dispatch.
    pub fn script_rejection(&self, error: AdapterError) {
        self.state.rejections.lock().push_back(error);
    }

    /// Everything dispatched so far, in order.
    #[must_use]
    pub fn actions(&self) -> Vec<DomainAction> {
        self.state.actions.lock().clone()
    }

    /// Handles of recorded actions, in dispatch order.
    #[must_use]
    pub fn handles(&self) -> Vec<Handle> {
        self.state.actions.lock().iter().map(DomainAction::handle).collect()
    }

    /// Acknowledges a handle from the test (manual mode).
    ///
    /// Returns `false` if the adapter was never started.
    pub fn complete(&self, handle: Handle, outcome: ActionOutcome) -> bool {
        match &*self.state.completions.lock() {
            Some(completions) => {
                completions.report(handle, outcome);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DomainAdapter for MockDomainAdapter {
    fn bus_name(&self) -> &str {
        &self.bus_name
    }

    async fn on_startup(&self, completions: CompletionSender) {
        *self.state.completions.lock() = Some(completions);
    }

    async fn dispatch(&self, action: DomainAction) -> Result<(), AdapterError> {
        if let Some(rejection) = self.state.rejections.lock().pop_front() {
            return Err(rejection);
        }
        let handle = action.handle();
        self.state.actions.lock().push(action);
        let behavior = *self.state.behavior.lock();
        if behavior == MockBehavior::Auto {
            let outcome = self
                .state
                .scripted
                .lock()
                .pop_front()
                .unwrap_or(ActionOutcome::Success);
            if let Some(completions) = &*self.state.completions.lock() {
                completions.report(handle, outcome);
            }
        }
        Ok(())
    }
}
