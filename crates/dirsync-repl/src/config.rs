//! Replication configuration, loaded from TOML or JSON.

use crate::csn::ReplicaId;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings of one replication domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Id of this replica, unique across the topology.
    pub replica_id: ReplicaId,
    /// Suffix the domain replicates.
    pub base_dn: String,
    /// Number of replay worker tasks.
    pub replay_workers: usize,
    /// Bound of the inbound replay queue.
    pub replay_queue_capacity: usize,
    /// Bound of the outbound update stream.
    pub outbound_queue_capacity: usize,
    /// Attempts per replayed update before it is given up.
    pub max_replay_retries: u32,
    /// Pause after a BUSY or UNAVAILABLE result, in milliseconds.
    pub busy_retry_backoff_ms: u64,
    /// How often the state vector is saved, in milliseconds.
    pub state_flush_interval_ms: u64,
    /// Age after which historical records may be purged, in milliseconds.
    pub historical_purge_delay_ms: u64,
    /// How often the purge task runs, in milliseconds.
    pub historical_purge_interval_ms: u64,
    /// Where the state vector is persisted.
    pub state_file: Option<PathBuf>,
    /// Attributes holding at most one value.
    pub single_valued_attributes: Vec<String>,
    /// Repair naming conflicts during replay.
    pub solve_conflicts: bool,
    /// Recent local changes kept for catching up peers.
    pub recovery_log_capacity: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            replica_id: 1,
            base_dn: String::from("dc=example,dc=com"),
            replay_workers: 4,
            replay_queue_capacity: 10_000,
            outbound_queue_capacity: 10_000,
            max_replay_retries: 10,
            busy_retry_backoff_ms: 50,
            state_flush_interval_ms: 1_000,
            historical_purge_delay_ms: 24 * 60 * 60 * 1_000,
            historical_purge_interval_ms: 60 * 60 * 1_000,
            state_file: None,
            single_valued_attributes: Vec::new(),
            solve_conflicts: true,
            recovery_log_capacity: 10_000,
        }
    }
}

impl DomainConfig {
    /// Parsed suffix.
    pub fn base(&self) -> Result<Dn> {
        let dn = Dn::parse(&self.base_dn)?;
        if dn.is_root() {
            return Err(ReplError::Config {
                msg: "base_dn must not be empty".to_string(),
            });
        }
        Ok(dn)
    }

    /// Reject settings the domain cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.base()?;
        let positive = [
            ("replay_workers", self.replay_workers as u64),
            ("replay_queue_capacity", self.replay_queue_capacity as u64),
            ("outbound_queue_capacity", self.outbound_queue_capacity as u64),
            ("max_replay_retries", u64::from(self.max_replay_retries)),
            ("state_flush_interval_ms", self.state_flush_interval_ms),
            ("historical_purge_interval_ms", self.historical_purge_interval_ms),
            ("recovery_log_capacity", self.recovery_log_capacity as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ReplError::Config {
                    msg: format!("{name} must be greater than zero"),
                });
            }
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Emit logs as JSON.
    pub log_json: bool,
    /// Replicated suffixes.
    pub domains: Vec<DomainConfig>,
}

impl ReplConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every domain and reject duplicate suffixes.
    pub fn validate(&self) -> Result<()> {
        let mut seen = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            domain.validate()?;
            let base = domain.base()?;
            if seen.contains(&base) {
                return Err(ReplError::DomainExists {
                    base_dn: domain.base_dn.clone(),
                });
            }
            seen.push(base);
        }
        Ok(())
    }
}
