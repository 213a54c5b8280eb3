//! Per-replica configuration, TOML-sourced via the `config` crate as
//! the ambient substitute for DSE replication-entry parsing (a
//! non-goal, `spec.md` §1; `SPEC_FULL.md` §6).

use std::time::Duration;

use dsrepl_types::{ReplicaGeneration, ReplicaType, Rid};

/// Errors loading or validating a [`ReplicaConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("loading replica config: {0}")]
    Source(#[from] config::ConfigError),
    #[error("repl_type must be one of primary, read-write, read-only, got {0:?}")]
    BadReplicaType(String),
    #[error("backoff_min ({min:?}) must not exceed backoff_max ({max:?})")]
    BackoffRange { min: Duration, max: Duration },
}

/// Raw TOML shape; field names match the on-disk keys so `config` can
/// deserialize directly (`repl5_replica.c`'s config-attribute names,
/// `SPEC_FULL.md` §6).
#[derive(Debug, serde::Deserialize)]
struct RawReplicaConfig {
    root_dn: String,
    repl_id: u16,
    repl_type: String,
    replica_generation: String,
    #[serde(default = "default_purge_delay_secs")]
    purge_delay_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    reap_interval_secs: u64,
    #[serde(default)]
    referrals: Vec<String>,
    #[serde(default = "default_backoff_min_secs")]
    backoff_min_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    backoff_max_secs: u64,
    #[serde(default = "default_protocol_timeout_secs")]
    protocol_timeout_secs: u64,
}

fn default_purge_delay_secs() -> u64 {
    crate::protocol::DEFAULT_PURGE_DELAY.as_secs()
}
fn default_reap_interval_secs() -> u64 {
    crate::protocol::DEFAULT_REAP_INTERVAL.as_secs()
}
fn default_backoff_min_secs() -> u64 {
    crate::protocol::PROTOCOL_BACKOFF_MINIMUM.as_secs()
}
fn default_backoff_max_secs() -> u64 {
    crate::protocol::PROTOCOL_BACKOFF_MAXIMUM.as_secs()
}
fn default_protocol_timeout_secs() -> u64 {
    crate::protocol::DEFAULT_PROTOCOL_TIMEOUT.as_secs()
}

/// Validated, typed replica configuration (`spec.md` §6, `SPEC_FULL.md`
/// §6).
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub root_dn: String,
    pub repl_id: Rid,
    pub repl_type: ReplicaType,
    pub replica_generation: ReplicaGeneration,
    pub purge_delay: Duration,
    pub reap_interval: Duration,
    pub referrals: Vec<String>,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub protocol_timeout: Duration,
}

impl ReplicaConfig {
    /// Loads configuration from the given TOML file path, layering in
    /// defaults for any field the file omits.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref().to_path_buf()))
            .build()?;
        let raw: RawReplicaConfig = settings.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawReplicaConfig) -> Result<Self, ConfigError> {
        let repl_type = match raw.repl_type.as_str() {
            "primary" => ReplicaType::Primary,
            "read-write" => ReplicaType::ReadWrite,
            "read-only" => ReplicaType::ReadOnly,
            other => return Err(ConfigError::BadReplicaType(other.to_string())),
        };
        let backoff_min = Duration::from_secs(raw.backoff_min_secs);
        let backoff_max = Duration::from_secs(raw.backoff_max_secs);
        if backoff_min > backoff_max {
            return Err(ConfigError::BackoffRange {
                min: backoff_min,
                max: backoff_max,
            });
        }
        Ok(Self {
            root_dn: raw.root_dn,
            repl_id: Rid::new(raw.repl_id),
            repl_type,
            replica_generation: ReplicaGeneration::new(raw.replica_generation),
            purge_delay: Duration::from_secs(raw.purge_delay_secs),
            reap_interval: Duration::from_secs(raw.reap_interval_secs),
            referrals: raw.referrals,
            backoff_min,
            backoff_max,
            protocol_timeout: Duration::from_secs(raw.protocol_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests;
