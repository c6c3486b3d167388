//! Error types for route-audio.
//!
//! Errors are split into three categories:
//! - **Routing errors** ([`RoutingError`]): Returned by the public control
//!   surface; the taxonomy every caller matches on.
//! - **Adapter errors** ([`AdapterError`]): Raised inside a
//!   [`DomainAdapter`](crate::DomainAdapter) when a dispatch cannot even be
//!   queued; surfaced to callers as [`RoutingError::ActionFailed`].
//! - **Persistence errors** ([`PersistenceError`]): Raised by the snapshot
//!   backend; never affect routing behavior.

use std::path::PathBuf;

use crate::dispatch::Handle;
use crate::ids::{EntityKind, SinkId, SourceId};

/// Errors returned by the routing core.
///
/// Every fallible operation on [`Session`](crate::Session) resolves to one
/// of these. Integrity failures (`NotFound`, `AlreadyExists`, `Conflict`)
/// are fatal to the specific mutation only; the topology remains consistent
/// and operable afterwards.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoutingError {
    /// The referenced entity id is not registered.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of the missing entity.
        kind: EntityKind,
        /// The id that was looked up.
        id: u16,
    },

    /// A static id was registered twice.
    #[error("{kind} {id} already exists")]
    AlreadyExists {
        /// Kind of the duplicated entity.
        kind: EntityKind,
        /// The duplicated id.
        id: u16,
    },

    /// A removal was attempted while dependents still reference the entity.
    ///
    /// Cascading removal must be requested explicitly; it is never implied.
    #[error("{kind} {id} still referenced by {dependents} dependent(s)")]
    Conflict {
        /// Kind of the entity that could not be removed.
        kind: EntityKind,
        /// Id of the entity that could not be removed.
        id: u16,
        /// Number of entities still referencing it.
        dependents: usize,
    },

    /// A planning endpoint is unknown or not currently available.
    #[error("{kind} {id} is not a usable routing endpoint")]
    InvalidEndpoint {
        /// Kind of the endpoint (source or sink).
        kind: EntityKind,
        /// Id of the endpoint.
        id: u16,
    },

    /// No format-feasible path exists between the endpoints.
    ///
    /// Routing is deterministic over the current topology: retrying without
    /// a topology change would return the same result, so this is never
    /// retried automatically.
    #[error("no route from source {source} to sink {sink}")]
    NoRoute {
        /// The requested source.
        source: SourceId,
        /// The requested sink.
        sink: SinkId,
    },

    /// The target entity already has an action in flight.
    ///
    /// One in-flight action per connection, source, sink, or crossfader at
    /// a time; retry after the pending action completes.
    #[error("{kind} {id} has an action in flight")]
    Busy {
        /// Kind of the busy entity.
        kind: EntityKind,
        /// Id of the busy entity.
        id: u16,
    },

    /// The owning domain reported an error for a dispatched action.
    #[error("domain reported action failure (code {code})")]
    ActionFailed {
        /// Domain-defined error code.
        code: u16,
    },

    /// No response for a dispatched action within the configured deadline.
    ///
    /// Treated identically to [`ActionFailed`](Self::ActionFailed) for
    /// unwind purposes; the handle is retired and any later response for it
    /// is discarded.
    #[error("action {handle} timed out")]
    Timeout {
        /// The handle that expired.
        handle: Handle,
    },

    /// The operation was canceled before it completed.
    ///
    /// Reported for commits canceled by the caller and for work still
    /// pending when the router shuts down.
    #[error("operation aborted")]
    Aborted,

    /// The router task is no longer running.
    #[error("router has shut down")]
    Shutdown,

    /// The persistence backend failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Errors raised inside a [`DomainAdapter`](crate::DomainAdapter).
///
/// These cover the synchronous half of a dispatch only: the adapter could
/// not accept the action at all. Asynchronous failures are reported through
/// the completion channel instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The domain's control channel is gone (process died, bus dropped).
    #[error("domain unreachable: {reason}")]
    Unreachable {
        /// Why the domain cannot be reached.
        reason: String,
    },

    /// The adapter rejected the action with a domain-defined code.
    #[error("action rejected (code {code})")]
    Rejected {
        /// Domain-defined error code.
        code: u16,
    },
}

impl AdapterError {
    /// Returns the domain error code carried by this error, or `0` when the
    /// failure has no domain-defined code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Unreachable { .. } => 0,
            Self::Rejected { code } => *code,
        }
    }
}

/// Errors raised by a [`PersistenceBackend`](crate::PersistenceBackend).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    /// Reading or writing the backing store failed.
    #[error("store error: {path}: {reason}")]
    Store {
        /// Location of the backing store.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The stored snapshot could not be interpreted.
    #[error("corrupt snapshot: {reason}")]
    Corrupt {
        /// Description of what was wrong.
        reason: String,
    },

    /// Custom error for user-implemented backends.
    #[error("{0}")]
    Custom(String),
}

impl PersistenceError {
    /// Creates a custom persistence error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandleKind;
    use crate::ids::HandleId;

    #[test]
    fn test_routing_error_display() {
        let err = RoutingError::NotFound {
            kind: EntityKind::Source,
            id: 12,
        };
        assert_eq!(err.to_string(), "source 12 not found");
    }

    #[test]
    fn test_no_route_display() {
        let err = RoutingError::NoRoute {
            source: SourceId(1),
            sink: SinkId(4),
        };
        assert_eq!(err.to_string(), "no route from source 1 to sink 4");
    }

    #[test]
    fn test_timeout_display_names_handle() {
        let err = RoutingError::Timeout {
            handle: Handle::new(HandleKind::Connect, HandleId(9)),
        };
        assert!(err.to_string().contains("connect/9"));
    }

    #[test]
    fn test_adapter_error_code() {
        assert_eq!(AdapterError::Rejected { code: 42 }.code(), 42);
        let unreachable = AdapterError::Unreachable {
            reason: "bus gone".to_string(),
        };
        assert_eq!(unreachable.code(), 0);
    }

    #[test]
    fn test_persistence_error_into_routing_error() {
        let err: RoutingError = PersistenceError::custom("disk full").into();
        assert!(matches!(err, RoutingError::Persistence(_)));
    }
}
