//! Configuration for the routing core.

use std::time::Duration;

/// Configuration for router behavior.
///
/// Use [`RouterConfig::default()`] for sensible defaults, or customize as
/// needed.
///
/// # Example
///
/// ```
/// use route_audio::RouterConfig;
/// use std::time::Duration;
///
/// let config = RouterConfig {
///     handle_timeout: Duration::from_secs(2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline for a domain to acknowledge a dispatched action.
    ///
    /// Expiry retires the handle as failed; a later acknowledgment for it
    /// is discarded. Default: 5s
    pub handle_timeout: Duration,

    /// Maximum number of hops (gateway/converter traversals) the path
    /// search will explore.
    ///
    /// Bounds planning time on pathological topologies. Default: 8
    pub max_path_hops: usize,

    /// How many times a failed multi-hop connect is re-planned around the
    /// failed edge before the failure is reported.
    ///
    /// Default: 2
    pub replan_attempts: usize,

    /// Capacity of the session-to-reactor command channel.
    ///
    /// Default: 64
    pub command_capacity: usize,

    /// Capacity of the adapter completion channel.
    ///
    /// Sized for the worst-case number of simultaneously pending handles.
    /// Default: 1024
    pub completion_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handle_timeout: Duration::from_secs(5),
            max_path_hops: 8,
            replan_attempts: 2,
            command_capacity: 64,
            completion_capacity: 1024,
        }
    }
}
