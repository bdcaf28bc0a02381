//! Tunables for document sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::pending::BufferLimits;

/// Document session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote presence records older than this are dropped
    pub awareness_timeout: Duration,
    /// How often awareness expiry and the other session timers are checked
    pub tick_interval: Duration,
    /// First reconnect delay; doubles per failed attempt
    pub reconnect_initial: Duration,
    /// Upper bound for the reconnect delay
    pub reconnect_max: Duration,
    /// A peer that has not sent its state vector within this window is
    /// asked for a full resync
    pub resync_timeout: Duration,
    /// Periodic state vector exchange with every peer
    pub sync_interval: Duration,
    /// Link-level ping interval
    pub heartbeat_interval: Duration,
    /// Causal buffer bounds
    pub buffer: BufferLimits,
    /// Frames queued per peer before new ones are dropped
    pub outbound_capacity: usize,
    /// Commands queued for the session actor
    pub command_capacity: usize,
    /// Payloads above this many bytes are LZ4 compressed
    pub compression_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            awareness_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_millis(500),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            resync_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            buffer: BufferLimits::default(),
            outbound_capacity: 256,
            command_capacity: 256,
            compression_threshold: 1024,
        }
    }
}

impl SessionConfig {
    /// Interval at which the local presence record is re-broadcast.
    pub fn awareness_renewal(&self) -> Duration {
        self.awareness_timeout / 2
    }
}
