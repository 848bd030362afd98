//! Schema ledger: the migration history table and the statement executor
//!
//! [`SchemaLedger`] owns the session for a migration run. It creates the
//! keyspace and both ledger tables on construction, reads the current schema
//! version, runs migration scripts statement by statement and records every
//! attempt. Leader election lives in [`lock`](super::lock).

use crate::config::{KeyspaceDefinition, MigrationConfig};
use crate::executor::{
    ConsistencyLevel, CqlSession, CqlValue, ExecutionOptions, Statement, StoreError, TableSchema,
};
use crate::migration::advisor::{AdvisorKind, ExecutionAdvisor, RetrySchedule};
use crate::migration::lock::LeaseSettings;
use crate::migration::repository::BASELINE_VERSION;
use crate::migration::state_table::{
    LedgerTables, COL_APPLIED_SUCCESSFUL, COL_EXECUTED_AT, COL_SCRIPT, COL_SCRIPT_NAME,
    COL_VERSION,
};
use crate::migration::{CqlLexer, ExecutionFailure, Migration, MigrationError};
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Ledger settings
#[derive(Debug, Clone, Default)]
pub struct LedgerOptions {
    pub table_prefix: Option<String>,
    /// Consistency for migration statements
    pub consistency: ConsistencyLevel,
    /// Consistency for ledger reads and writes
    pub metadata_consistency: ConsistencyLevel,
    pub execution_profile: Option<String>,
    pub lease: LeaseSettings,
    pub advisor: AdvisorKind,
    pub agreement_retry: RetrySchedule,
}

impl From<&MigrationConfig> for LedgerOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            table_prefix: config.table_prefix.clone(),
            consistency: config.consistency,
            metadata_consistency: config.metadata_consistency,
            execution_profile: config.execution_profile.clone(),
            lease: config.lease_settings(),
            advisor: config.advisor,
            agreement_retry: config.agreement_retry,
        }
    }
}

/// Durable migration state of one keyspace
pub struct SchemaLedger {
    pub(crate) session: Arc<dyn CqlSession>,
    pub(crate) keyspace: KeyspaceDefinition,
    pub(crate) tables: LedgerTables,
    pub(crate) options: LedgerOptions,
    advisor: Box<dyn ExecutionAdvisor>,
    pub(crate) leader_id: Uuid,
    pub(crate) host_name: String,
    pub(crate) lease_held: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for SchemaLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaLedger")
            .field("keyspace", &self.keyspace.name)
            .field("tables", &self.tables)
            .field("leader_id", &self.leader_id)
            .field("host_name", &self.host_name)
            .field("lease_held", &self.lease_held())
            .finish_non_exhaustive()
    }
}

impl SchemaLedger {
    /// Connect the ledger to `keyspace`, creating the keyspace and ledger tables as needed
    ///
    /// Safe to run concurrently from several instances.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the keyspace or tables cannot be created.
    pub fn new(
        session: Arc<dyn CqlSession>,
        keyspace: KeyspaceDefinition,
        options: LedgerOptions,
    ) -> Result<Self, MigrationError> {
        let tables = LedgerTables::new(&keyspace.name, options.table_prefix.as_deref());
        let advisor = options.advisor.advisor(options.agreement_retry);
        let ledger = Self {
            session,
            keyspace,
            tables,
            options,
            advisor,
            leader_id: Uuid::new_v4(),
            host_name: local_host_name(),
            lease_held: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        ledger.initialize()?;
        Ok(ledger)
    }

    fn initialize(&self) -> Result<(), MigrationError> {
        if !self.session.keyspace_exists(&self.keyspace.name)? {
            log::info!("Creating keyspace '{}'", self.keyspace.name);
            let create = Statement::CreateKeyspace {
                name: self.keyspace.name.clone(),
                replication: self.keyspace.replication.clone(),
                durable_writes: self.keyspace.durable_writes,
            };
            self.run_tolerating_existing(&create)?;
        }
        self.ensure_table(self.tables.history_schema())?;
        self.ensure_table(self.tables.leader_schema())?;
        Ok(())
    }

    fn ensure_table(&self, schema: TableSchema) -> Result<(), MigrationError> {
        if self
            .session
            .table_exists(&schema.table.keyspace, &schema.table.name)?
        {
            return Ok(());
        }
        log::debug!("Creating ledger table {}", schema.table);
        self.run_tolerating_existing(&Statement::CreateTable(schema))
    }

    // Another instance may win the creation race
    fn run_tolerating_existing(&self, statement: &Statement) -> Result<(), MigrationError> {
        match self.session.execute(statement, &self.metadata_options()) {
            Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn metadata_options(&self) -> ExecutionOptions {
        ExecutionOptions::with_consistency(self.options.metadata_consistency)
    }

    fn migration_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            consistency: self.options.consistency,
            serial_consistency: None,
            profile: self.options.execution_profile.clone(),
        }
    }

    /// Highest successfully applied version, or 0 when nothing has been applied
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the ledger cannot be read.
    pub fn current_version(&self) -> Result<i32, MigrationError> {
        let select = Statement::Select {
            table: self.tables.history.clone(),
            columns: vec![COL_VERSION.to_string()],
            filter: vec![(COL_APPLIED_SUCCESSFUL.to_string(), CqlValue::Boolean(true))],
            limit: Some(1),
        };
        let result = self.session.execute(&select, &self.metadata_options())?;
        match result.rows.first() {
            Some(row) => Ok(row.get_int(COL_VERSION)?),
            None => Ok(BASELINE_VERSION),
        }
    }

    /// Run every statement of `migration` and record the outcome
    ///
    /// Statements run one at a time through the execution advisor, and each
    /// must leave the cluster in schema agreement. On the first failure a row
    /// with `applied_successful = false` is written holding the statements
    /// attempted so far.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Execution` naming the failing statement, or
    /// `MigrationError::Store` if the success row cannot be written.
    pub fn execute(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut attempted = Vec::new();
        for cql in CqlLexer::new(&migration.script) {
            log::debug!("Executing `{cql}`");
            let statement = Statement::Raw(cql.clone());
            attempted.push(cql);
            if let Err(cause) = self.run_statement(&statement) {
                let failed_script = format!("{};", attempted.join(";\n"));
                if let Err(e) = self.write_history(migration, false, &failed_script) {
                    log::error!(
                        "Could not record failure of migration '{}' (version {}): {e}",
                        migration.script_name,
                        migration.version
                    );
                }
                return Err(MigrationError::Execution {
                    version: migration.version,
                    script: migration.script_name.clone(),
                    statement: statement.to_cql(),
                    cause,
                });
            }
        }
        self.write_history(migration, true, &migration.script)
    }

    fn run_statement(&self, statement: &Statement) -> Result<(), ExecutionFailure> {
        let session = self.session.as_ref();
        self.advisor.before_execute(session, statement)?;
        let result = session.execute(statement, &self.migration_options())?;
        let result = self.advisor.after_execute(session, statement, result)?;
        if !result.schema_in_agreement {
            return Err(ExecutionFailure::NoAgreement);
        }
        Ok(())
    }

    fn write_history(
        &self,
        migration: &Migration,
        applied: bool,
        script: &str,
    ) -> Result<(), MigrationError> {
        let insert = Statement::Insert {
            table: self.tables.history.clone(),
            values: vec![
                (COL_APPLIED_SUCCESSFUL.to_string(), CqlValue::Boolean(applied)),
                (COL_VERSION.to_string(), CqlValue::Int(migration.version)),
                (COL_SCRIPT_NAME.to_string(), CqlValue::Text(migration.script_name.clone())),
                (COL_SCRIPT.to_string(), CqlValue::Text(script.to_string())),
                (COL_EXECUTED_AT.to_string(), CqlValue::Timestamp(Utc::now())),
            ],
            if_not_exists: false,
            ttl_seconds: None,
        };
        self.session.execute(&insert, &self.metadata_options())?;
        Ok(())
    }

    /// All successfully applied migrations, ascending by version
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the ledger cannot be read or a row is malformed.
    pub fn load_history(&self) -> Result<Vec<Migration>, MigrationError> {
        let select = Statement::Select {
            table: self.tables.history.clone(),
            columns: Vec::new(),
            filter: vec![(COL_APPLIED_SUCCESSFUL.to_string(), CqlValue::Boolean(true))],
            limit: None,
        };
        let result = self.session.execute(&select, &self.metadata_options())?;
        let mut history = result
            .rows
            .iter()
            .map(Migration::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        history.sort_by_key(|m| m.version);
        Ok(history)
    }

    /// Rewrite the stored script of an applied migration without executing it
    ///
    /// Returns `false` when no successful row exists for the version.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the update fails.
    pub fn update_checksum(&self, migration: &Migration) -> Result<bool, MigrationError> {
        let update = Statement::Update {
            table: self.tables.history.clone(),
            set: vec![
                (COL_SCRIPT.to_string(), CqlValue::Text(migration.script.clone())),
                (COL_SCRIPT_NAME.to_string(), CqlValue::Text(migration.script_name.clone())),
            ],
            key: vec![
                (COL_APPLIED_SUCCESSFUL.to_string(), CqlValue::Boolean(true)),
                (COL_VERSION.to_string(), CqlValue::Int(migration.version)),
            ],
            if_exists: true,
        };
        let result = self.session.execute(&update, &self.metadata_options())?;
        Ok(result.was_applied())
    }

    /// Close the session; later calls do nothing
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.session.close();
        }
    }

    #[must_use]
    pub fn keyspace(&self) -> &str {
        &self.keyspace.name
    }

    #[must_use]
    pub fn tables(&self) -> &LedgerTables {
        &self.tables
    }

    #[must_use]
    pub fn leader_id(&self) -> Uuid {
        self.leader_id
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    #[must_use]
    pub fn lease_held(&self) -> bool {
        self.lease_held.load(Ordering::SeqCst)
    }
}

fn local_host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;

    fn ledger(cluster: &MemoryCluster) -> SchemaLedger {
        SchemaLedger::new(
            Arc::new(cluster.session()),
            KeyspaceDefinition::new("app"),
            LedgerOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_initialization_is_idempotent() {
        let cluster = MemoryCluster::new();
        let first = ledger(&cluster);
        let second = ledger(&cluster);
        assert_eq!(first.current_version().unwrap(), 0);
        assert_eq!(second.current_version().unwrap(), 0);
        assert_ne!(first.leader_id(), second.leader_id());
        assert!(!first.host_name().is_empty());
    }

    #[test]
    fn test_execute_records_success_and_version() {
        let cluster = MemoryCluster::new();
        let ledger = ledger(&cluster);
        let script = "CREATE TABLE users (id uuid PRIMARY KEY);\nCREATE INDEX ON users (id);";
        ledger.execute(&Migration::new("users.cql", 1, script)).unwrap();
        ledger.execute(&Migration::new("orders.cql", 2, "CREATE TABLE orders (id uuid PRIMARY KEY);")).unwrap();

        assert_eq!(ledger.current_version().unwrap(), 2);
        assert_eq!(cluster.executed_statements().len(), 3);

        let history = ledger.load_history().unwrap();
        assert_eq!(history.iter().map(|m| m.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(history[0].script, script);
        assert!(history.iter().all(|m| m.applied_successfully));
    }

    #[test]
    fn test_failed_statement_writes_failure_row() {
        let cluster = MemoryCluster::new();
        cluster.fail_statements_containing("BROKEN");
        let ledger = ledger(&cluster);
        let migration = Migration::new("bad.cql", 3, "CREATE TABLE a (x int PRIMARY KEY);\nBROKEN;\nCREATE TABLE b (x int PRIMARY KEY);");

        let err = ledger.execute(&migration).unwrap_err();
        match err {
            MigrationError::Execution { version, script, statement, .. } => {
                assert_eq!(version, 3);
                assert_eq!(script, "bad.cql");
                assert_eq!(statement, "BROKEN");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.current_version().unwrap(), 0);

        let failed: Vec<_> = cluster
            .rows(&ledger.tables().history)
            .into_iter()
            .filter(|row| row.get_bool(COL_APPLIED_SUCCESSFUL) == Ok(false))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].get_text(COL_SCRIPT).unwrap(),
            "CREATE TABLE a (x int PRIMARY KEY);\nBROKEN;"
        );
    }

    #[test]
    fn test_disagreement_fails_the_migration() {
        let cluster = MemoryCluster::new();
        cluster.disagree_on_statements_containing("ALTER");
        let ledger = ledger(&cluster);
        let err = ledger
            .execute(&Migration::new("alter.cql", 1, "ALTER TABLE t ADD b int;"))
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Execution { cause: ExecutionFailure::NoAgreement, .. }
        ));
    }

    #[test]
    fn test_update_checksum_only_touches_applied_rows() {
        let cluster = MemoryCluster::new();
        let ledger = ledger(&cluster);
        ledger.execute(&Migration::new("a.cql", 1, "CREATE TABLE a (x int PRIMARY KEY);")).unwrap();

        let edited = Migration::new("a.cql", 1, "CREATE TABLE a (x int PRIMARY KEY, y int);");
        assert!(ledger.update_checksum(&edited).unwrap());
        assert!(!ledger.update_checksum(&Migration::new("b.cql", 2, "SELECT 1;")).unwrap());

        let history = ledger.load_history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_consistent_with(&edited));
    }

    #[test]
    fn test_close_is_idempotent() {
        let cluster = MemoryCluster::new();
        let ledger = ledger(&cluster);
        ledger.close();
        ledger.close();
        assert!(matches!(ledger.current_version(), Err(MigrationError::Store(StoreError::Closed))));
    }
}
