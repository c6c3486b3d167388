//! Connection formats and format convertibility.
//!
//! A connection format is the encoding/channel-layout contract a source
//! emits and a sink accepts. Gateways and converters declare which
//! (source-format, sink-format) pairs they can translate between via a
//! [`ConvertibilityMatrix`]; the path planner prunes every hop whose format
//! pair the matrix denies.

/// An audio connection format.
///
/// Formats are small negotiated integers. The well-known values are
/// provided as constants; domains may define further custom formats above
/// [`ConnectionFormat::CUSTOM_BASE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionFormat(pub u16);

impl ConnectionFormat {
    /// Unknown/unset format.
    pub const UNKNOWN: Self = Self(0);
    /// Single-channel PCM.
    pub const MONO: Self = Self(1);
    /// Two-channel PCM.
    pub const STEREO: Self = Self(2);
    /// Analog pass-through.
    pub const ANALOG: Self = Self(3);
    /// Format negotiated by the domains themselves.
    pub const AUTO: Self = Self(4);
    /// First value available for domain-defined formats.
    pub const CUSTOM_BASE: Self = Self(256);

    /// Creates a domain-defined format value.
    #[must_use]
    pub fn custom(value: u16) -> Self {
        Self(Self::CUSTOM_BASE.0 + value)
    }
}

impl std::fmt::Display for ConnectionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::UNKNOWN => f.write_str("unknown"),
            Self::MONO => f.write_str("mono"),
            Self::STEREO => f.write_str("stereo"),
            Self::ANALOG => f.write_str("analog"),
            Self::AUTO => f.write_str("auto"),
            Self(other) => write!(f, "format({other})"),
        }
    }
}

/// Which (source-format, sink-format) pairs a gateway or converter accepts.
///
/// The matrix is stored row-major with source formats as rows:
/// `matrix[source_index * sink_count + sink_index]`. Format lists are
/// ordered; the planner uses the declared order as the preference order
/// when assigning concrete formats to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertibilityMatrix {
    source_formats: Vec<ConnectionFormat>,
    sink_formats: Vec<ConnectionFormat>,
    matrix: Vec<bool>,
}

impl ConvertibilityMatrix {
    /// Builds a matrix by evaluating `allows(source_format, sink_format)`
    /// for every pair.
    pub fn from_fn(
        source_formats: Vec<ConnectionFormat>,
        sink_formats: Vec<ConnectionFormat>,
        allows: impl Fn(ConnectionFormat, ConnectionFormat) -> bool,
    ) -> Self {
        let mut matrix = Vec::with_capacity(source_formats.len() * sink_formats.len());
        for src in &source_formats {
            for snk in &sink_formats {
                matrix.push(allows(*src, *snk));
            }
        }
        Self {
            source_formats,
            sink_formats,
            matrix,
        }
    }

    /// Builds a matrix from raw row-major data.
    ///
    /// Returns `None` if the data length does not match
    /// `source_formats.len() * sink_formats.len()`.
    pub fn from_rows(
        source_formats: Vec<ConnectionFormat>,
        sink_formats: Vec<ConnectionFormat>,
        matrix: Vec<bool>,
    ) -> Option<Self> {
        if matrix.len() != source_formats.len() * sink_formats.len() {
            return None;
        }
        Some(Self {
            source_formats,
            sink_formats,
            matrix,
        })
    }

    /// A matrix that converts every source format to every sink format.
    pub fn any(source_formats: Vec<ConnectionFormat>, sink_formats: Vec<ConnectionFormat>) -> Self {
        Self::from_fn(source_formats, sink_formats, |_, _| true)
    }

    /// A matrix that only passes a format through unchanged.
    pub fn identity(formats: Vec<ConnectionFormat>) -> Self {
        Self::from_fn(formats.clone(), formats, |src, snk| src == snk)
    }

    /// The source-side formats, in declared order.
    pub fn source_formats(&self) -> &[ConnectionFormat] {
        &self.source_formats
    }

    /// The sink-side formats, in declared order.
    pub fn sink_formats(&self) -> &[ConnectionFormat] {
        &self.sink_formats
    }

    /// Returns `true` if the matrix allows converting `source` to `sink`.
    ///
    /// Formats absent from the respective format list are denied.
    pub fn allows(&self, source: ConnectionFormat, sink: ConnectionFormat) -> bool {
        let (Some(src_idx), Some(snk_idx)) = (
            self.source_formats.iter().position(|f| *f == source),
            self.sink_formats.iter().position(|f| *f == sink),
        ) else {
            return false;
        };
        self.matrix[src_idx * self.sink_formats.len() + snk_idx]
    }

    /// Sink-side formats reachable from any of the given source-side
    /// formats, in declared sink-format order.
    ///
    /// An empty result means a hop through this matrix is infeasible for
    /// the given inputs; the planner prunes such branches outright.
    pub fn outputs_for(&self, inputs: &[ConnectionFormat]) -> Vec<ConnectionFormat> {
        self.sink_formats
            .iter()
            .copied()
            .filter(|snk| inputs.iter().any(|src| self.allows(*src, *snk)))
            .collect()
    }

    /// Source-side formats convertible into the given sink-side format, in
    /// declared source-format order.
    pub fn inputs_for(&self, output: ConnectionFormat) -> Vec<ConnectionFormat> {
        self.source_formats
            .iter()
            .copied()
            .filter(|src| self.allows(*src, output))
            .collect()
    }
}
