//! Topology configuration.

use std::time::Duration;

/// Settings shared by every object in a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Packets available to conditions at once.
    pub packet_pool_capacity: usize,
    /// Interval of the enclosure's slot poll while READY.
    pub slot_poll_interval: Duration,
    /// Interval of the discovery-edge poll while READY.
    pub discovery_poll_interval: Duration,
    /// Minimum spacing of repeated corrective requests.
    pub corrective_retry: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            packet_pool_capacity: 64,
            slot_poll_interval: Duration::from_secs(1),
            discovery_poll_interval: Duration::from_secs(3),
            corrective_retry: Duration::from_secs(3),
        }
    }
}
