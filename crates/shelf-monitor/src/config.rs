//! Monitor configuration.
//!
//! Values come from a JSON file or from `SHELF_*` environment variables
//! layered over the defaults.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use shelf_topology::TopologyConfig;

use crate::error::{MonitorError, Result};
use crate::scenario::Scenario;

/// Configuration for the monitor service.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Packets available to conditions at once.
    #[serde(default = "MonitorConfig::default_pool_capacity")]
    pub packet_pool_capacity: usize,

    /// Enclosure slot poll interval in milliseconds.
    #[serde(default = "MonitorConfig::default_slot_poll")]
    pub slot_poll_interval_ms: u64,

    /// Discovery edge poll interval in milliseconds.
    #[serde(default = "MonitorConfig::default_discovery_poll")]
    pub discovery_poll_interval_ms: u64,

    /// Minimum spacing of repeated corrective requests in milliseconds.
    #[serde(default = "MonitorConfig::default_corrective_retry")]
    pub corrective_retry_ms: u64,

    /// How long the simulated shelf runs.
    #[serde(default = "MonitorConfig::default_run_seconds")]
    pub run_seconds: u64,

    /// Slot population and the changes to play.
    #[serde(default)]
    pub scenario: Scenario,
}

impl MonitorConfig {
    const fn default_pool_capacity() -> usize {
        64
    }

    const fn default_slot_poll() -> u64 {
        1000
    }

    const fn default_discovery_poll() -> u64 {
        3000
    }

    const fn default_corrective_retry() -> u64 {
        3000
    }

    const fn default_run_seconds() -> u64 {
        10
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `Parse` if it is not
    /// valid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Defaults overlaid with the `SHELF_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEnv` if a variable is set but does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEnv` if a value is present but does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "SHELF_POOL_CAPACITY")? {
            config.packet_pool_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "SHELF_SLOT_POLL_MS")? {
            config.slot_poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "SHELF_DISCOVERY_POLL_MS")? {
            config.discovery_poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "SHELF_RUN_SECONDS")? {
            config.run_seconds = v;
        }
        Ok(config)
    }

    /// Get the slot poll interval as a `Duration`.
    #[must_use]
    pub fn slot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slot_poll_interval_ms)
    }

    /// Get the discovery poll interval as a `Duration`.
    #[must_use]
    pub fn discovery_poll_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_poll_interval_ms)
    }

    /// Get the corrective retry window as a `Duration`.
    #[must_use]
    pub fn corrective_retry(&self) -> Duration {
        Duration::from_millis(self.corrective_retry_ms)
    }

    /// Get the run time as a `Duration`.
    #[must_use]
    pub fn run_time(&self) -> Duration {
        Duration::from_secs(self.run_seconds)
    }

    /// Settings handed to the topology.
    #[must_use]
    pub fn topology_config(&self) -> TopologyConfig {
        TopologyConfig {
            packet_pool_capacity: self.packet_pool_capacity,
            slot_poll_interval: self.slot_poll_interval(),
            discovery_poll_interval: self.discovery_poll_interval(),
            corrective_retry: self.corrective_retry(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            packet_pool_capacity: Self::default_pool_capacity(),
            slot_poll_interval_ms: Self::default_slot_poll(),
            discovery_poll_interval_ms: Self::default_discovery_poll(),
            corrective_retry_ms: Self::default_corrective_retry(),
            run_seconds: Self::default_run_seconds(),
            scenario: Scenario::default(),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| MonitorError::InvalidEnv { name, value })
        })
        .transpose()
}
