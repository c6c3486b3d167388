//! Handles: tickets for in-flight asynchronous actions.

use crate::ids::HandleId;

/// The kind of asynchronous action a handle tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Establish a connection.
    Connect,
    /// Tear a connection down.
    Disconnect,
    /// Change a source's runtime state.
    SetSourceState,
    /// Change a sink's volume.
    SetSinkVolume,
    /// Change a source's volume.
    SetSourceVolume,
    /// Change a sound property on a sink.
    SetSinkSoundProperty,
    /// Change a sound property on a source.
    SetSourceSoundProperty,
    /// Fade between a crossfader's sinks.
    Crossfade,
    /// Change several volumes atomically.
    SetVolumes,
    /// Configure value reporting on a sink.
    SetSinkNotification,
    /// Configure value reporting on a source.
    SetSourceNotification,
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::SetSourceState => "set-source-state",
            Self::SetSinkVolume => "set-sink-volume",
            Self::SetSourceVolume => "set-source-volume",
            Self::SetSinkSoundProperty => "set-sink-sound-property",
            Self::SetSourceSoundProperty => "set-source-sound-property",
            Self::Crossfade => "crossfade",
            Self::SetVolumes => "set-volumes",
            Self::SetSinkNotification => "set-sink-notification",
            Self::SetSourceNotification => "set-source-notification",
        };
        f.write_str(name)
    }
}

/// Identifies exactly one in-flight asynchronous action.
///
/// Handle ids are drawn from a small rotating space and are never reused
/// while a handle with that id is pending. The kind is part of the
/// identity: a completion must match both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    /// What the action does.
    pub kind: HandleKind,
    /// Numeric id, unique among currently pending handles.
    pub id: HandleId,
}

impl Handle {
    /// Creates a handle.
    #[must_use]
    pub fn new(kind: HandleKind, id: HandleId) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}
