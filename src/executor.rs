//! `CqlSession` Module
//!
//! Provides the `CqlSession` trait that abstracts statement execution against a
//! Cassandra-family cluster. The engine never speaks the wire protocol itself:
//! a driver adapter implements this trait and forwards [`Statement::to_cql`]
//! (or the structured form) to its session.
//!
//! Statements are structured so that the ledger's bookkeeping writes
//! (conditional inserts with a TTL, conditional deletes, keyed selects) can be
//! served by any backend, including the in-memory cluster used in tests.

use crate::config::Replication;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a [`CqlSession`] implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The cluster could not be reached
    #[error("Connection error: {0}")]
    Connection(String),
    /// The statement was rejected (syntax, unknown table, ...)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// A keyspace or table being created already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// Not enough replicas were available for the requested consistency level
    #[error("Unavailable: {0}")]
    Unavailable(String),
    /// The coordinator timed out waiting for replicas
    #[error("Timeout: {0}")]
    Timeout(String),
    /// A returned row could not be decoded into the expected shape
    #[error("Decode error: {0}")]
    Decode(String),
    /// The session has been closed
    #[error("Session is closed")]
    Closed,
}

/// Consistency level requested for a single statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    #[default]
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
    Serial,
    LocalSerial,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::Any => "ANY",
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Two => "TWO",
            ConsistencyLevel::Three => "THREE",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
            ConsistencyLevel::LocalQuorum => "LOCAL_QUORUM",
            ConsistencyLevel::EachQuorum => "EACH_QUORUM",
            ConsistencyLevel::LocalOne => "LOCAL_ONE",
            ConsistencyLevel::Serial => "SERIAL",
            ConsistencyLevel::LocalSerial => "LOCAL_SERIAL",
        };
        f.write_str(name)
    }
}

/// Per-statement execution settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Consistency level for the statement
    pub consistency: ConsistencyLevel,
    /// Serial consistency for lightweight transactions (`IF ...` clauses)
    pub serial_consistency: Option<ConsistencyLevel>,
    /// Named driver execution profile, if the deployment uses them
    pub profile: Option<String>,
}

impl ExecutionOptions {
    /// Options with the given consistency level and no profile
    #[must_use]
    pub fn with_consistency(consistency: ConsistencyLevel) -> Self {
        Self {
            consistency,
            serial_consistency: None,
            profile: None,
        }
    }
}

/// A single CQL value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CqlValue {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl CqlValue {
    /// Render the value as a CQL literal
    ///
    /// Text is single-quoted with embedded quotes doubled; timestamps are
    /// rendered as milliseconds since the epoch.
    #[must_use]
    pub fn to_cql_literal(&self) -> String {
        match self {
            CqlValue::Null => "null".to_string(),
            CqlValue::Boolean(b) => b.to_string(),
            CqlValue::Int(i) => i.to_string(),
            CqlValue::BigInt(i) => i.to_string(),
            CqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            CqlValue::Timestamp(ts) => ts.timestamp_millis().to_string(),
            CqlValue::Uuid(id) => id.to_string(),
        }
    }
}

/// Column types used by the ledger tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqlType {
    Boolean,
    Int,
    BigInt,
    Text,
    Varchar,
    Timestamp,
    Uuid,
}

impl fmt::Display for CqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CqlType::Boolean => "boolean",
            CqlType::Int => "int",
            CqlType::BigInt => "bigint",
            CqlType::Text => "text",
            CqlType::Varchar => "varchar",
            CqlType::Timestamp => "timestamp",
            CqlType::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

/// Fully qualified table name (`keyspace.table`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub keyspace: String,
    pub name: String,
}

impl TableRef {
    #[must_use]
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.name)
    }
}

/// Clustering order of a clustering column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusteringOrder {
    Asc,
    Desc,
}

/// Table definition used by `CREATE TABLE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: TableRef,
    pub columns: Vec<(String, CqlType)>,
    pub partition_key: Vec<String>,
    pub clustering: Vec<(String, ClusteringOrder)>,
}

impl TableSchema {
    /// All primary key columns: partition key followed by clustering columns
    pub fn primary_key(&self) -> impl Iterator<Item = &str> {
        self.partition_key
            .iter()
            .map(String::as_str)
            .chain(self.clustering.iter().map(|(c, _)| c.as_str()))
    }
}

/// A statement the engine asks a session to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// A literal CQL statement, as produced by the lexer for migration scripts
    Raw(String),
    CreateKeyspace {
        name: String,
        replication: Replication,
        durable_writes: bool,
    },
    CreateTable(TableSchema),
    Insert {
        table: TableRef,
        values: Vec<(String, CqlValue)>,
        if_not_exists: bool,
        ttl_seconds: Option<u32>,
    },
    Update {
        table: TableRef,
        set: Vec<(String, CqlValue)>,
        key: Vec<(String, CqlValue)>,
        if_exists: bool,
    },
    Delete {
        table: TableRef,
        key: Vec<(String, CqlValue)>,
        conditions: Vec<(String, CqlValue)>,
    },
    Select {
        table: TableRef,
        /// Empty means `*`
        columns: Vec<String>,
        filter: Vec<(String, CqlValue)>,
        limit: Option<usize>,
    },
}

fn render_assignments(pairs: &[(String, CqlValue)], separator: &str) -> String {
    pairs
        .iter()
        .map(|(column, value)| format!("{column} = {}", value.to_cql_literal()))
        .collect::<Vec<_>>()
        .join(separator)
}

impl Statement {
    /// Render the statement as CQL text
    #[must_use]
    pub fn to_cql(&self) -> String {
        match self {
            Statement::Raw(cql) => cql.clone(),
            Statement::CreateKeyspace {
                name,
                replication,
                durable_writes,
            } => format!(
                "CREATE KEYSPACE IF NOT EXISTS {name} WITH replication = {} AND durable_writes = {durable_writes}",
                replication.to_cql_map()
            ),
            Statement::CreateTable(schema) => {
                let columns = schema
                    .columns
                    .iter()
                    .map(|(name, ty)| format!("{name} {ty}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let partition = if schema.partition_key.len() == 1 {
                    schema.partition_key[0].clone()
                } else {
                    format!("({})", schema.partition_key.join(", "))
                };
                let mut key = vec![partition];
                key.extend(schema.clustering.iter().map(|(c, _)| c.clone()));
                let mut cql = format!(
                    "CREATE TABLE IF NOT EXISTS {} ({columns}, PRIMARY KEY ({}))",
                    schema.table,
                    key.join(", ")
                );
                if !schema.clustering.is_empty() {
                    let order = schema
                        .clustering
                        .iter()
                        .map(|(c, o)| match o {
                            ClusteringOrder::Asc => format!("{c} ASC"),
                            ClusteringOrder::Desc => format!("{c} DESC"),
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    cql.push_str(&format!(" WITH CLUSTERING ORDER BY ({order})"));
                }
                cql
            }
            Statement::Insert {
                table,
                values,
                if_not_exists,
                ttl_seconds,
            } => {
                let columns = values
                    .iter()
                    .map(|(c, _)| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let literals = values
                    .iter()
                    .map(|(_, v)| v.to_cql_literal())
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut cql = format!("INSERT INTO {table} ({columns}) VALUES ({literals})");
                if *if_not_exists {
                    cql.push_str(" IF NOT EXISTS");
                }
                if let Some(ttl) = ttl_seconds {
                    cql.push_str(&format!(" USING TTL {ttl}"));
                }
                cql
            }
            Statement::Update {
                table,
                set,
                key,
                if_exists,
            } => {
                let mut cql = format!(
                    "UPDATE {table} SET {} WHERE {}",
                    render_assignments(set, ", "),
                    render_assignments(key, " AND ")
                );
                if *if_exists {
                    cql.push_str(" IF EXISTS");
                }
                cql
            }
            Statement::Delete {
                table,
                key,
                conditions,
            } => {
                let mut cql = format!(
                    "DELETE FROM {table} WHERE {}",
                    render_assignments(key, " AND ")
                );
                if !conditions.is_empty() {
                    cql.push_str(&format!(" IF {}", render_assignments(conditions, " AND ")));
                }
                cql
            }
            Statement::Select {
                table,
                columns,
                filter,
                limit,
            } => {
                let projection = if columns.is_empty() {
                    "*".to_string()
                } else {
                    columns.join(", ")
                };
                let mut cql = format!("SELECT {projection} FROM {table}");
                if !filter.is_empty() {
                    cql.push_str(&format!(" WHERE {}", render_assignments(filter, " AND ")));
                }
                if let Some(limit) = limit {
                    cql.push_str(&format!(" LIMIT {limit}"));
                }
                cql
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cql())
    }
}

/// A result row: column name / value pairs in projection order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    columns: Vec<(String, CqlValue)>,
}

impl Row {
    #[must_use]
    pub fn new(columns: Vec<(String, CqlValue)>) -> Self {
        Self { columns }
    }

    /// Raw value of a column, if present
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&CqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> &[(String, CqlValue)] {
        &self.columns
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub(crate) fn set(&mut self, column: &str, value: CqlValue) {
        match self.columns.iter_mut().find(|(name, _)| name == column) {
            Some((_, existing)) => *existing = value,
            None => self.columns.push((column.to_string(), value)),
        }
    }

    fn missing(column: &str, expected: &str) -> StoreError {
        StoreError::Decode(format!("column '{column}' is missing or not {expected}"))
    }

    /// # Errors
    ///
    /// Returns `StoreError::Decode` if the column is missing or not an `int`.
    pub fn get_int(&self, column: &str) -> Result<i32, StoreError> {
        match self.get(column) {
            Some(CqlValue::Int(v)) => Ok(*v),
            _ => Err(Self::missing(column, "an int")),
        }
    }

    /// # Errors
    ///
    /// Returns `StoreError::Decode` if the column is missing or not a `boolean`.
    pub fn get_bool(&self, column: &str) -> Result<bool, StoreError> {
        match self.get(column) {
            Some(CqlValue::Boolean(v)) => Ok(*v),
            _ => Err(Self::missing(column, "a boolean")),
        }
    }

    /// # Errors
    ///
    /// Returns `StoreError::Decode` if the column is missing or not text.
    pub fn get_text(&self, column: &str) -> Result<&str, StoreError> {
        match self.get(column) {
            Some(CqlValue::Text(v)) => Ok(v),
            _ => Err(Self::missing(column, "text")),
        }
    }

    /// # Errors
    ///
    /// Returns `StoreError::Decode` if the column is missing or not a `timestamp`.
    pub fn get_timestamp(&self, column: &str) -> Result<DateTime<Utc>, StoreError> {
        match self.get(column) {
            Some(CqlValue::Timestamp(v)) => Ok(*v),
            _ => Err(Self::missing(column, "a timestamp")),
        }
    }

    /// # Errors
    ///
    /// Returns `StoreError::Decode` if the column is missing or not a `uuid`.
    pub fn get_uuid(&self, column: &str) -> Result<Uuid, StoreError> {
        match self.get(column) {
            Some(CqlValue::Uuid(v)) => Ok(*v),
            _ => Err(Self::missing(column, "a uuid")),
        }
    }
}

/// Result of executing a [`Statement`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// `[applied]` flag of a lightweight transaction, `None` for plain statements
    pub applied: Option<bool>,
    /// Whether the cluster reported schema agreement after the statement
    pub schema_in_agreement: bool,
}

impl QueryResult {
    /// A successful result without rows
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            applied: None,
            schema_in_agreement: true,
        }
    }

    /// `true` only when a conditional statement reported `[applied] = true`
    #[must_use]
    pub fn was_applied(&self) -> bool {
        self.applied == Some(true)
    }
}

/// Session over a Cassandra-family cluster
///
/// Implementations must be `Send + Sync`: a single engine instance drives one
/// session from one thread, but several engines may share a process.
///
/// # Examples
///
/// ```no_run
/// use schemaguard::executor::{CqlSession, ExecutionOptions, Statement, ConsistencyLevel};
///
/// # fn example(session: &dyn CqlSession) -> Result<(), schemaguard::executor::StoreError> {
/// let options = ExecutionOptions::with_consistency(ConsistencyLevel::Quorum);
/// let result = session.execute(&Statement::Raw("CREATE TABLE ks.t (a int PRIMARY KEY)".into()), &options)?;
/// assert!(result.schema_in_agreement);
/// # Ok(())
/// # }
/// ```
pub trait CqlSession: Send + Sync {
    /// Execute a statement
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the cluster rejects or fails the statement.
    fn execute(
        &self,
        statement: &Statement,
        options: &ExecutionOptions,
    ) -> Result<QueryResult, StoreError>;

    /// Ask the cluster whether all live nodes agree on the schema version
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the metadata cannot be queried.
    fn check_schema_agreement(&self) -> Result<bool, StoreError>;

    /// # Errors
    ///
    /// Returns `StoreError` if the metadata cannot be queried.
    fn keyspace_exists(&self, keyspace: &str) -> Result<bool, StoreError>;

    /// # Errors
    ///
    /// Returns `StoreError` if the metadata cannot be queried.
    fn table_exists(&self, keyspace: &str, table: &str) -> Result<bool, StoreError>;

    /// Close the session; subsequent calls fail with `StoreError::Closed`
    fn close(&self);
}
