//! Asynchronous action dispatch bookkeeping.
//!
//! The [`Dispatcher`] owns the table of in-flight handles: allocation from
//! the rotating id space, the one-action-per-entity busy discipline, the
//! per-handle deadline, and the store mutation to apply when a handle
//! succeeds. It never touches the store itself - the reactor asks it what
//! to do and applies the result under the single-writer discipline.

mod handle;

pub use handle::{Handle, HandleKind};

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::adapter::VolumeTarget;
use crate::error::RoutingError;
use crate::ids::{
    ConnectionId, CrossfaderId, EntityKind, HandleId, SinkId, SourceId,
};
use crate::topology::{HotSink, NotificationConfiguration, SoundProperty, SourceState};

/// Handle ids rotate through `1..=HANDLE_ID_MAX` (the classic 10-bit handle
/// space).
const HANDLE_ID_MAX: u16 = 1023;

/// An entity that admits at most one in-flight action at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BusyTarget {
    Source(SourceId),
    Sink(SinkId),
    Connection(ConnectionId),
    Crossfader(CrossfaderId),
}

impl BusyTarget {
    pub(crate) fn describe(self) -> (EntityKind, u16) {
        match self {
            Self::Source(id) => (EntityKind::Source, id.raw()),
            Self::Sink(id) => (EntityKind::Sink, id.raw()),
            Self::Connection(id) => (EntityKind::Connection, id.raw()),
            Self::Crossfader(id) => (EntityKind::Crossfader, id.raw()),
        }
    }
}

/// The store mutation a successful completion earns.
///
/// Mirrors the dispatched action; failures and timeouts apply nothing.
#[derive(Debug, Clone)]
pub(crate) enum CompletionAction {
    ConnectEstablished {
        connection: ConnectionId,
    },
    DisconnectDone {
        connection: ConnectionId,
    },
    SourceStateSet {
        source: SourceId,
        state: SourceState,
    },
    SinkVolumeSet {
        sink: SinkId,
        volume: i16,
    },
    SourceVolumeSet {
        source: SourceId,
        volume: i16,
    },
    SinkSoundPropertySet {
        sink: SinkId,
        property: SoundProperty,
    },
    SourceSoundPropertySet {
        source: SourceId,
        property: SoundProperty,
    },
    CrossfadeDone {
        crossfader: CrossfaderId,
        hot_sink: HotSink,
    },
    VolumesSet {
        volumes: Vec<VolumeTarget>,
    },
    SinkNotificationSet {
        sink: SinkId,
        configuration: NotificationConfiguration,
    },
    SourceNotificationSet {
        source: SourceId,
        configuration: NotificationConfiguration,
    },
    /// A connect dispatched as part of a commit sequence; the reactor
    /// advances the sequence when it resolves.
    CommitConnectEstablished {
        connection: ConnectionId,
    },
}

struct Pending {
    handle: Handle,
    deadline: Instant,
    action: CompletionAction,
    targets: Vec<BusyTarget>,
}

/// Table of in-flight handles.
pub(crate) struct Dispatcher {
    pending: HashMap<HandleId, Pending>,
    busy: HashSet<BusyTarget>,
    counter: u16,
    timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            busy: HashSet::new(),
            counter: 0,
            timeout,
        }
    }

    /// Claims the targets and allocates a handle for a new action.
    ///
    /// Fails with `Busy` when any target already has an action in flight,
    /// naming the first busy target.
    pub(crate) fn begin(
        &mut self,
        kind: HandleKind,
        targets: Vec<BusyTarget>,
        action: CompletionAction,
    ) -> Result<Handle, RoutingError> {
        for target in &targets {
            if self.busy.contains(target) {
                let (kind, id) = target.describe();
                return Err(RoutingError::Busy { kind, id });
            }
        }
        let id = self.allocate_id()?;
        let handle = Handle::new(kind, id);
        for target in &targets {
            self.busy.insert(*target);
        }
        self.pending.insert(
            id,
            Pending {
                handle,
                deadline: Instant::now() + self.timeout,
                action,
                targets,
            },
        );
        if self.pending.len() % 100 == 0 {
            tracing::warn!(pending = self.pending.len(), "many handles in flight");
        }
        tracing::debug!(%handle, "handle created");
        Ok(handle)
    }

    /// Rotates through the id space, skipping ids still pending.
    fn allocate_id(&mut self) -> Result<HandleId, RoutingError> {
        for _ in 0..HANDLE_ID_MAX {
            self.counter = if self.counter >= HANDLE_ID_MAX {
                1
            } else {
                self.counter + 1
            };
            let id = HandleId(self.counter);
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(RoutingError::Busy {
            kind: EntityKind::Connection,
            id: 0,
        })
    }

    /// Retires a handle on completion, releasing its targets.
    ///
    /// Returns `None` for unknown handles and for id matches with the
    /// wrong kind - the caller logs and discards those without touching
    /// other pending entries.
    pub(crate) fn finish(&mut self, handle: Handle) -> Option<CompletionAction> {
        let entry = self.pending.get(&handle.id)?;
        if entry.handle != handle {
            return None;
        }
        let entry = self.pending.remove(&handle.id)?;
        for target in &entry.targets {
            self.busy.remove(target);
        }
        Some(entry.action)
    }

    /// The earliest pending deadline, if any handle is in flight.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Retires every handle whose deadline has passed.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(Handle, CompletionAction)> {
        let expired: Vec<HandleId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = self.pending.remove(&id) {
                for target in &entry.targets {
                    self.busy.remove(target);
                }
                out.push((entry.handle, entry.action));
            }
        }
        out
    }

    /// Retires every pending handle (shutdown path).
    pub(crate) fn drain(&mut self) -> Vec<Handle> {
        self.busy.clear();
        let handles = self.pending.values().map(|p| p.handle).collect();
        self.pending.clear();
        handles
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, handle: Handle) -> bool {
        self.pending
            .get(&handle.id)
            .is_some_and(|p| p.handle == handle)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Duration::from_secs(5))
    }

    fn noop_action() -> CompletionAction {
        CompletionAction::SinkVolumeSet {
            sink: SinkId(1),
            volume: 0,
        }
    }

    #[test]
    fn test_ids_rotate_and_start_at_one() {
        let mut d = dispatcher();
        let a = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();
        assert_eq!(a.id, HandleId(1));
        let b = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();
        assert_eq!(b.id, HandleId(2));
    }

    #[test]
    fn test_pending_ids_never_reused() {
        let mut d = dispatcher();
        let first = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();
        // Exhaust the rotation so the counter wraps past `first`.
        for _ in 0..HANDLE_ID_MAX - 1 {
            let h = d
                .begin(HandleKind::SetSinkVolume, vec![], noop_action())
                .unwrap();
            d.finish(h).unwrap();
        }
        let wrapped = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();
        // `first` is still pending; its id must be skipped.
        assert_ne!(wrapped.id, first.id);
        assert!(d.is_pending(first));
    }

    #[test]
    fn test_exhausted_handle_space() {
        let mut d = dispatcher();
        for _ in 0..HANDLE_ID_MAX {
            d.begin(HandleKind::SetSinkVolume, vec![], noop_action())
                .unwrap();
        }
        assert!(d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .is_err());
    }

    #[test]
    fn test_busy_target_rejected_until_finished() {
        let mut d = dispatcher();
        let target = BusyTarget::Sink(SinkId(7));
        let first = d
            .begin(HandleKind::SetSinkVolume, vec![target], noop_action())
            .unwrap();
        let err = d
            .begin(HandleKind::SetSinkVolume, vec![target], noop_action())
            .unwrap_err();
        assert!(matches!(
            err,
            RoutingError::Busy {
                kind: EntityKind::Sink,
                id: 7
            }
        ));
        d.finish(first).unwrap();
        assert!(d
            .begin(HandleKind::SetSinkVolume, vec![target], noop_action())
            .is_ok());
    }

    #[test]
    fn test_finish_requires_matching_kind() {
        let mut d = dispatcher();
        let handle = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();
        let forged = Handle::new(HandleKind::Connect, handle.id);
        assert!(d.finish(forged).is_none());
        // The real handle is untouched by the spurious completion.
        assert!(d.is_pending(handle));
        assert!(d.finish(handle).is_some());
    }

    #[test]
    fn test_unknown_handle_completion_discarded() {
        let mut d = dispatcher();
        let handle = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();
        assert!(d
            .finish(Handle::new(HandleKind::SetSinkVolume, HandleId(999)))
            .is_none());
        assert!(d.is_pending(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_expire_in_order() {
        let mut d = Dispatcher::new(Duration::from_secs(1));
        let early = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        let late = d
            .begin(HandleKind::SetSinkVolume, vec![], noop_action())
            .unwrap();

        tokio::time::advance(Duration::from_millis(600)).await;
        let expired = d.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, early);
        assert!(d.is_pending(late));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(d.take_expired(Instant::now()).len(), 1);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_expiry_releases_busy_targets() {
        let mut d = Dispatcher::new(Duration::from_secs(0));
        let target = BusyTarget::Connection(ConnectionId(3));
        d.begin(HandleKind::Disconnect, vec![target], noop_action())
            .unwrap();
        let _ = d.take_expired(Instant::now() + Duration::from_secs(1));
        assert!(d
            .begin(HandleKind::Disconnect, vec![target], noop_action())
            .is_ok());
    }
}
