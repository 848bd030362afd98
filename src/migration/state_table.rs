//! Ledger table definitions
//!
//! Two tables live in the managed keyspace:
//! - `schema_migration`: one row per execution attempt, keyed by
//!   `(applied_successful, version)` with versions clustered descending so the
//!   newest successful version is the first row of the `true` partition
//! - `schema_migration_leader`: the single lease row, written with a TTL

use crate::executor::{ClusteringOrder, CqlType, TableRef, TableSchema};

pub const MIGRATION_TABLE: &str = "schema_migration";
pub const LEADER_TABLE: &str = "schema_migration_leader";

pub const COL_APPLIED_SUCCESSFUL: &str = "applied_successful";
pub const COL_VERSION: &str = "version";
pub const COL_SCRIPT_NAME: &str = "script_name";
pub const COL_SCRIPT: &str = "script";
pub const COL_EXECUTED_AT: &str = "executed_at";

pub const COL_SCOPE_KEY: &str = "scope_key";
pub const COL_LEADER_ID: &str = "leader_id";
pub const COL_ACQUIRED_AT: &str = "acquired_at";
pub const COL_LEADER_HOST: &str = "leader_host";

/// Resolved names of the two ledger tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTables {
    pub history: TableRef,
    pub leader: TableRef,
}

impl LedgerTables {
    /// Table names for `keyspace`, optionally prefixed (`<prefix>_schema_migration`)
    #[must_use]
    pub fn new(keyspace: &str, table_prefix: Option<&str>) -> Self {
        let name = |table: &str| match table_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}_{table}"),
            _ => table.to_string(),
        };
        Self {
            history: TableRef::new(keyspace, name(MIGRATION_TABLE)),
            leader: TableRef::new(keyspace, name(LEADER_TABLE)),
        }
    }

    /// Definition of the migration history table
    #[must_use]
    pub fn history_schema(&self) -> TableSchema {
        TableSchema {
            table: self.history.clone(),
            columns: vec![
                (COL_APPLIED_SUCCESSFUL.to_string(), CqlType::Boolean),
                (COL_VERSION.to_string(), CqlType::Int),
                (COL_SCRIPT_NAME.to_string(), CqlType::Varchar),
                (COL_SCRIPT.to_string(), CqlType::Text),
                (COL_EXECUTED_AT.to_string(), CqlType::Timestamp),
            ],
            partition_key: vec![COL_APPLIED_SUCCESSFUL.to_string()],
            clustering: vec![(COL_VERSION.to_string(), ClusteringOrder::Desc)],
        }
    }

    /// Definition of the lease table
    #[must_use]
    pub fn leader_schema(&self) -> TableSchema {
        TableSchema {
            table: self.leader.clone(),
            columns: vec![
                (COL_SCOPE_KEY.to_string(), CqlType::Text),
                (COL_LEADER_ID.to_string(), CqlType::Uuid),
                (COL_ACQUIRED_AT.to_string(), CqlType::Timestamp),
                (COL_LEADER_HOST.to_string(), CqlType::Text),
            ],
            partition_key: vec![COL_SCOPE_KEY.to_string()],
            clustering: Vec::new(),
        }
    }
}
