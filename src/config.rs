//! Migration configuration.
//!
//! [`MigrationConfig`] is loaded from `config/migration.toml` (optional) with
//! `SCHEMAGUARD__*` environment overrides, e.g.
//! `SCHEMAGUARD__MIGRATION__KEYSPACE__NAME=events`.

use crate::executor::ConsistencyLevel;
use crate::migration::advisor::{AdvisorKind, RetrySchedule};
use crate::migration::collector::DuplicateStrategy;
use crate::migration::lock::LeaseSettings;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/migration.toml";
const ENV_PREFIX: &str = "SCHEMAGUARD";

/// Keyspace replication strategy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Replication {
    SimpleStrategy { replication_factor: u32 },
    NetworkTopologyStrategy { datacenters: BTreeMap<String, u32> },
}

impl Default for Replication {
    fn default() -> Self {
        Replication::SimpleStrategy {
            replication_factor: 1,
        }
    }
}

impl Replication {
    /// Render as the CQL replication map literal
    #[must_use]
    pub fn to_cql_map(&self) -> String {
        match self {
            Replication::SimpleStrategy { replication_factor } => format!(
                "{{'class': 'SimpleStrategy', 'replication_factor': {replication_factor}}}"
            ),
            Replication::NetworkTopologyStrategy { datacenters } => {
                let mut parts = vec!["'class': 'NetworkTopologyStrategy'".to_string()];
                parts.extend(
                    datacenters
                        .iter()
                        .map(|(dc, factor)| format!("'{dc}': {factor}")),
                );
                format!("{{{}}}", parts.join(", "))
            }
        }
    }
}

/// The keyspace the ledger lives in, created on first use if absent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyspaceDefinition {
    pub name: String,
    #[serde(default)]
    pub replication: Replication,
    #[serde(default = "default_true")]
    pub durable_writes: bool,
}

impl KeyspaceDefinition {
    /// Keyspace with `SimpleStrategy`, replication factor 1
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replication: Replication::default(),
            durable_writes: true,
        }
    }

    #[must_use]
    pub fn with_replication(mut self, replication: Replication) -> Self {
        self.replication = replication;
        self
    }
}

/// Everything the engine needs to run a migration pass
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    pub keyspace: KeyspaceDefinition,
    /// Script locations, `scheme:path` or a bare filesystem path
    #[serde(default = "default_script_locations")]
    pub script_locations: Vec<String>,
    #[serde(default)]
    pub duplicate_strategy: DuplicateStrategy,
    /// Prefix for the ledger tables (`<prefix>_schema_migration`)
    #[serde(default)]
    pub table_prefix: Option<String>,
    /// Consistency level for migration statements
    #[serde(default)]
    pub consistency: ConsistencyLevel,
    /// Consistency level for ledger reads and writes
    #[serde(default)]
    pub metadata_consistency: ConsistencyLevel,
    #[serde(default)]
    pub execution_profile: Option<String>,
    #[serde(default = "default_true")]
    pub leader_election: bool,
    #[serde(default = "default_true")]
    pub checksum_validation: bool,
    #[serde(default)]
    pub validate_only: bool,
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u32,
    #[serde(default = "default_lease_backoff_ms")]
    pub lease_backoff_ms: u64,
    /// Give up on leader election after this many attempts (unbounded if unset)
    #[serde(default)]
    pub lease_max_attempts: Option<u32>,
    #[serde(default)]
    pub advisor: AdvisorKind,
    #[serde(default)]
    pub agreement_retry: RetrySchedule,
}

fn default_true() -> bool {
    true
}

fn default_script_locations() -> Vec<String> {
    vec!["migrations".to_string()]
}

fn default_lease_ttl_seconds() -> u32 {
    300
}

fn default_lease_backoff_ms() -> u64 {
    10_000
}

impl MigrationConfig {
    /// Configuration with defaults for every setting except the keyspace
    #[must_use]
    pub fn new(keyspace: KeyspaceDefinition) -> Self {
        Self {
            keyspace,
            script_locations: default_script_locations(),
            duplicate_strategy: DuplicateStrategy::default(),
            table_prefix: None,
            consistency: ConsistencyLevel::default(),
            metadata_consistency: ConsistencyLevel::default(),
            execution_profile: None,
            leader_election: true,
            checksum_validation: true,
            validate_only: false,
            lease_ttl_seconds: default_lease_ttl_seconds(),
            lease_backoff_ms: default_lease_backoff_ms(),
            lease_max_attempts: None,
            advisor: AdvisorKind::default(),
            agreement_retry: RetrySchedule::default(),
        }
    }

    /// Load the configuration from `config/migration.toml`, falling back to env vars.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if neither source yields a valid `migration` section.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // Unreadable file: retry with the environment alone
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    log::warn!("Failed to load {DEFAULT_CONFIG_FILE}, falling back to env: {err}");
                }
                Config::builder()
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        Self::from_settings(&settings)
    }

    /// Load the configuration from an explicit file, with env overrides applied on top
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be parsed or the section is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Self::from_settings(&settings)
    }

    fn from_settings(settings: &Config) -> Result<Self, ConfigError> {
        settings.get::<MigrationConfig>("migration").map_err(|e| {
            ConfigError::Message(format!(
                "Migration configuration could not be loaded from file or environment: {e}"
            ))
        })
    }

    /// Lease timing derived from the configuration
    #[must_use]
    pub fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings {
            ttl_seconds: self.lease_ttl_seconds,
            backoff: Duration::from_millis(self.lease_backoff_ms),
            max_attempts: self.lease_max_attempts,
        }
    }
}
