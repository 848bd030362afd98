//! Migration-specific error types

use crate::executor::StoreError;
use thiserror::Error;

/// Why a single migration statement failed
#[derive(Error, Debug)]
pub enum ExecutionFailure {
    /// The cluster rejected or failed the statement
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The statement succeeded but the cluster did not report schema agreement
    #[error("schema agreement was not reached after the statement")]
    NoAgreement,
    /// Bounded wait for schema agreement gave up
    #[error("schema agreement was not reached after {attempts} checks")]
    AgreementTimeout { attempts: u32 },
}

/// Migration engine errors
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A script could not be discovered, parsed or read
    #[error("Invalid migration script '{script}': {message}")]
    Repository { script: String, message: String },

    /// A script location could not be enumerated
    #[error("Failed to scan migration location '{location}': {message}")]
    Location { location: String, message: String },

    /// A statement failed, the ledger holds a failed row for `version`
    #[error(
        "Migration '{script}' (version {version}) failed during execution of statement \
         `{statement}`: {cause}"
    )]
    Execution {
        version: i32,
        script: String,
        statement: String,
        #[source]
        cause: ExecutionFailure,
    },

    /// Leader election exhausted its configured attempts
    #[error(
        "Could not take the migration lead for keyspace '{keyspace}' after {attempts} attempts. \
         Another process may be running migrations; a stale lease expires with its TTL."
    )]
    LeaseTimeout { keyspace: String, attempts: u32 },

    /// Fewer scripts are available than have been applied
    #[error(
        "{persisted} migrations have been applied but only {available} scripts were found. \
         Removing applied migration scripts is not supported."
    )]
    ScriptsRemoved { persisted: usize, available: usize },

    /// Applied scripts were modified after being applied
    #[error(
        "Checksum mismatch for applied migrations: {}. \
         The scripts were edited after deployment; restore them or recompute their checksums.",
        .scripts.join(", ")
    )]
    ChecksumDrift { scripts: Vec<String> },

    /// Ledger bookkeeping failed
    #[error("Database error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MigrationError {
    pub(crate) fn repository(script: impl Into<String>, message: impl Into<String>) -> Self {
        MigrationError::Repository {
            script: script.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_drift_lists_every_script() {
        let err = MigrationError::ChecksumDrift {
            scripts: vec!["add_users.cql".into(), "add_events.cql".into()],
        };
        let message = err.to_string();
        assert!(message.contains("add_users.cql, add_events.cql"));
    }

    #[test]
    fn test_execution_error_names_script_and_statement() {
        let err = MigrationError::Execution {
            version: 2,
            script: "add_events.cql".into(),
            statement: "CREATE TABLE events (id int PRIMARY KEY)".into(),
            cause: ExecutionFailure::NoAgreement,
        };
        let message = err.to_string();
        assert!(message.contains("'add_events.cql' (version 2)"));
        assert!(message.contains("CREATE TABLE events"));
        assert!(message.contains("schema agreement"));
    }
}
