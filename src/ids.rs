//! Identifier types for routable entities.
//!
//! Every entity in the topology is addressed by a small integer id, unique
//! within its kind. Ids are either assigned dynamically by the topology
//! store or supplied statically by a domain at registration. `0` is never a
//! valid assigned id and is used as the "unset" sentinel in wire-facing
//! structs.

/// Declares a `u16` newtype id with the shared conversions and formatting.
macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u16);

        impl $name {
            /// Returns the raw integer value.
            #[must_use]
            pub fn raw(self) -> u16 {
                self.0
            }

            /// Returns `true` for the unset sentinel (`0`).
            #[must_use]
            pub fn is_unset(self) -> bool {
                self.0 == 0
            }
        }

        impl From<u16> for $name {
            fn from(raw: u16) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for u16 {
            fn from(id: $name) -> u16 {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id! {
    /// Identifies an audio domain (one independently controlled subsystem).
    DomainId
}
entity_id! {
    /// Identifies a logical audio source.
    SourceId
}
entity_id! {
    /// Identifies a logical audio sink.
    SinkId
}
entity_id! {
    /// Identifies a cross-domain gateway.
    GatewayId
}
entity_id! {
    /// Identifies an intra-domain format converter.
    ConverterId
}
entity_id! {
    /// Identifies a crossfader between two sinks.
    CrossfaderId
}
entity_id! {
    /// Identifies one realized source-to-sink connection.
    ConnectionId
}
entity_id! {
    /// Identifies an end-to-end logical connection (one or more hops).
    MainConnectionId
}
entity_id! {
    /// Identifies one in-flight asynchronous action.
    HandleId
}

/// The kinds of entity tracked by the topology store.
///
/// Used in error values and change notifications to say what an id refers
/// to without carrying the full record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// An audio domain.
    Domain,
    /// An audio source.
    Source,
    /// An audio sink.
    Sink,
    /// A cross-domain gateway.
    Gateway,
    /// An intra-domain converter.
    Converter,
    /// A crossfader.
    Crossfader,
    /// A single-hop connection.
    Connection,
    /// An end-to-end main connection.
    MainConnection,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Domain => "domain",
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Gateway => "gateway",
            Self::Converter => "converter",
            Self::Crossfader => "crossfader",
            Self::Connection => "connection",
            Self::MainConnection => "main connection",
        };
        f.write_str(name)
    }
}
