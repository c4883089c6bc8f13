//! Runtime configuration for a Raft node.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::NodeId;

/// Runtime config for a Raft node, built once at startup and shared (via
/// `Arc`) with the running core.
///
/// Timing fields are expressed in milliseconds. The election timeout on any
/// given round is drawn uniformly from `[election_timeout_min,
/// election_timeout_max)`; the heartbeat interval is drawn from
/// `[heartbeat_interval, heartbeat_interval * 4)`. The heartbeat interval
/// must stay well below the election timeout floor or followers will start
/// elections against a live leader.
#[derive(Clone, Debug)]
pub struct Config {
    /// This node's identifier within `cluster`.
    pub id: NodeId,
    /// The fixed cluster roster: every member's id mapped to its address.
    /// Dynamic membership changes are not supported; this map is read once
    /// at startup.
    pub cluster: BTreeMap<NodeId, String>,
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// Upper (exclusive) bound of the randomized election timeout.
    pub election_timeout_max: u64,
    /// Lower bound of the randomized heartbeat/append interval.
    pub heartbeat_interval_min: u64,
    /// Upper (exclusive) bound of the randomized heartbeat/append interval.
    pub heartbeat_interval_max: u64,
    /// Maximum number of log entries batched into one `append_entries` RPC.
    pub max_payload_entries: u64,
    /// Scales all of the above timers by 10x, for interactive debugging.
    pub debug: bool,
}

impl Config {
    /// Start building a config for `id` within `cluster`.
    pub fn build(id: NodeId, cluster: BTreeMap<NodeId, String>) -> ConfigBuilder {
        ConfigBuilder {
            id,
            cluster,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval_min: None,
            heartbeat_interval_max: None,
            max_payload_entries: None,
            debug: false,
        }
    }

    fn scale(&self, millis: u64) -> u64 {
        if self.debug {
            millis * 10
        } else {
            millis
        }
    }

    pub fn election_timeout_range(&self) -> (u64, u64) {
        (self.scale(self.election_timeout_min), self.scale(self.election_timeout_max))
    }

    pub fn heartbeat_interval_range(&self) -> (u64, u64) {
        (self.scale(self.heartbeat_interval_min), self.scale(self.heartbeat_interval_max))
    }
}

/// A builder for `Config`, following the validate-then-build pattern used
/// throughout this crate's other construction-heavy types.
pub struct ConfigBuilder {
    id: NodeId,
    cluster: BTreeMap<NodeId, String>,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval_min: Option<u64>,
    heartbeat_interval_max: Option<u64>,
    max_payload_entries: Option<u64>,
    debug: bool,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = Some(v);
        self
    }

    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = Some(v);
        self
    }

    pub fn heartbeat_interval_min(mut self, v: u64) -> Self {
        self.heartbeat_interval_min = Some(v);
        self
    }

    pub fn heartbeat_interval_max(mut self, v: u64) -> Self {
        self.heartbeat_interval_max = Some(v);
        self
    }

    pub fn max_payload_entries(mut self, v: u64) -> Self {
        self.max_payload_entries = Some(v);
        self
    }

    pub fn debug(mut self, v: bool) -> Self {
        self.debug = v;
        self
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(100);
        let election_timeout_max = self.election_timeout_max.unwrap_or(400);
        let heartbeat_interval_min = self.heartbeat_interval_min.unwrap_or(20);
        let heartbeat_interval_max = self.heartbeat_interval_max.unwrap_or(80);
        let max_payload_entries = self.max_payload_entries.unwrap_or(2);

        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidTimeoutRange {
                min: election_timeout_min,
                max: election_timeout_max,
            });
        }
        if heartbeat_interval_min >= heartbeat_interval_max {
            return Err(ConfigError::InvalidTimeoutRange {
                min: heartbeat_interval_min,
                max: heartbeat_interval_max,
            });
        }
        if heartbeat_interval_max >= election_timeout_min {
            return Err(ConfigError::HeartbeatNotFasterThanElection {
                heartbeat_max: heartbeat_interval_max,
                election_min: election_timeout_min,
            });
        }
        if max_payload_entries == 0 {
            return Err(ConfigError::ZeroMaxPayloadEntries);
        }
        if !self.cluster.contains_key(&self.id) {
            return Err(ConfigError::SelfNotInCluster { id: self.id });
        }

        Ok(Config {
            id: self.id,
            cluster: self.cluster,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval_min,
            heartbeat_interval_max,
            max_payload_entries,
            debug: self.debug,
        })
    }
}
