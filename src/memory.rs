//! In-memory cluster for tests
//!
//! [`MemoryCluster`] models the parts of a Cassandra-family cluster the
//! migration engine relies on: keyspaces and tables with primary keys,
//! upserting inserts, lightweight transactions (`IF NOT EXISTS`, `IF EXISTS`,
//! `IF col = value`), row TTLs, clustering order and schema agreement. Every
//! [`MemorySession`] opened from one cluster shares its state, so several
//! migrators (threads) can race against it like separate processes would.
//!
//! Raw statements (migration script content) are not interpreted; they are
//! recorded and can be made to fail or to report schema disagreement. Ledger
//! statements are structured and always interpreted, unless a ledger failure
//! rule matches their rendered CQL.

use crate::executor::{
    ClusteringOrder, CqlSession, CqlValue, ExecutionOptions, QueryResult, Row, Statement,
    StoreError, TableRef, TableSchema,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct StoredRow {
    row: Row,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<StoredRow>,
}

impl MemoryTable {
    fn key_of(&self, row: &Row) -> Vec<Option<CqlValue>> {
        self.schema
            .primary_key()
            .map(|column| row.get(column).cloned())
            .collect()
    }

    fn position(&self, key: &[Option<CqlValue>]) -> Option<usize> {
        self.rows
            .iter()
            .position(|stored| self.key_of(&stored.row).as_slice() == key)
    }

    fn purge_expired(&mut self, now: Instant) {
        self.rows
            .retain(|stored| stored.expires_at.map_or(true, |expires| expires > now));
    }
}

#[derive(Debug)]
struct FailureRule {
    fragment: String,
    remaining: Option<u32>,
    ledger: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    keyspaces: HashMap<String, HashMap<String, MemoryTable>>,
    executed: Vec<String>,
    failures: Vec<FailureRule>,
    disagreements: Vec<String>,
    agreement_lag: u32,
    pending_disagreement: u32,
    clock_offset: Duration,
}

impl ClusterState {
    fn now(&self) -> Instant {
        Instant::now() + self.clock_offset
    }

    fn take_failure(&mut self, cql: &str, ledger: bool) -> bool {
        let Some(rule) = self.failures.iter_mut().find(|rule| {
            rule.ledger == ledger && cql.contains(&rule.fragment) && rule.remaining != Some(0)
        })
        else {
            return false;
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        true
    }

    fn table_mut(&mut self, table: &TableRef) -> Result<&mut MemoryTable, StoreError> {
        let now = self.now();
        let table_state = self
            .keyspaces
            .get_mut(&table.keyspace)
            .and_then(|tables| tables.get_mut(&table.name))
            .ok_or_else(|| StoreError::InvalidQuery(format!("unconfigured table {table}")))?;
        table_state.purge_expired(now);
        Ok(table_state)
    }
}

fn row_from_pairs(pairs: &[(String, CqlValue)]) -> Row {
    Row::new(pairs.to_vec())
}

fn matches_all(row: &Row, pairs: &[(String, CqlValue)]) -> bool {
    pairs
        .iter()
        .all(|(column, value)| row.get(column).map_or(*value == CqlValue::Null, |v| v == value))
}

/// Shared in-memory cluster state
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session on this cluster
    #[must_use]
    pub fn session(&self) -> MemorySession {
        MemorySession {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail every raw statement containing `fragment`
    pub fn fail_statements_containing(&self, fragment: impl Into<String>) {
        self.lock().failures.push(FailureRule {
            fragment: fragment.into(),
            remaining: None,
            ledger: false,
        });
    }

    /// Fail the next `times` raw statements containing `fragment`
    pub fn fail_statements_containing_times(&self, fragment: impl Into<String>, times: u32) {
        self.lock().failures.push(FailureRule {
            fragment: fragment.into(),
            remaining: Some(times),
            ledger: false,
        });
    }

    /// Fail the next `times` structured statements whose CQL contains `fragment`
    ///
    /// Simulates ledger reads and writes failing, e.g. while tables are still
    /// being created by another node.
    pub fn fail_ledger_statements_containing_times(&self, fragment: impl Into<String>, times: u32) {
        self.lock().failures.push(FailureRule {
            fragment: fragment.into(),
            remaining: Some(times),
            ledger: true,
        });
    }

    /// Drop all failure rules
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Raw statements containing `fragment` report schema disagreement
    pub fn disagree_on_statements_containing(&self, fragment: impl Into<String>) {
        self.lock().disagreements.push(fragment.into());
    }

    /// After a disagreement, this many agreement checks report `false`
    pub fn set_agreement_lag(&self, checks: u32) {
        self.lock().agreement_lag = checks;
    }

    /// Start a disagreement window of `agreement_lag` checks now
    pub fn delay_agreement(&self) {
        let mut state = self.lock();
        state.pending_disagreement = state.agreement_lag;
    }

    /// Move the cluster clock forward, expiring TTL'd rows
    pub fn advance_time(&self, by: Duration) {
        self.lock().clock_offset += by;
    }

    /// Raw (script) statements executed so far, across all sessions
    #[must_use]
    pub fn executed_statements(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Live rows of a table, in storage order (empty if the table does not exist)
    #[must_use]
    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        let mut state = self.lock();
        match state.table_mut(table) {
            Ok(table) => table.rows.iter().map(|stored| stored.row.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Write a row directly, bypassing sessions (upsert, no TTL)
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidQuery` if the table does not exist.
    pub fn put_row(&self, table: &TableRef, values: Vec<(String, CqlValue)>) -> Result<(), StoreError> {
        let mut state = self.lock();
        let table_state = state.table_mut(table)?;
        let row = Row::new(values);
        let key = table_state.key_of(&row);
        match table_state.position(&key) {
            Some(index) => table_state.rows[index] = StoredRow { row, expires_at: None },
            None => table_state.rows.push(StoredRow { row, expires_at: None }),
        }
        Ok(())
    }
}

/// A session on a [`MemoryCluster`]
#[derive(Debug)]
pub struct MemorySession {
    state: Arc<Mutex<ClusterState>>,
    closed: AtomicBool,
}

impl MemorySession {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn execute_in(state: &mut ClusterState, statement: &Statement) -> Result<QueryResult, StoreError> {
    let now = state.now();
    match statement {
        Statement::Raw(cql) => {
            state.executed.push(cql.clone());
            let disagrees = state.disagreements.iter().any(|f| cql.contains(f.as_str()));
            if disagrees {
                state.pending_disagreement = state.agreement_lag;
            }
            Ok(QueryResult {
                schema_in_agreement: !disagrees,
                ..QueryResult::empty()
            })
        }
        Statement::CreateKeyspace { name, .. } => {
            state.keyspaces.entry(name.clone()).or_default();
            Ok(QueryResult::empty())
        }
        Statement::CreateTable(schema) => {
            let tables = state.keyspaces.get_mut(&schema.table.keyspace).ok_or_else(|| {
                StoreError::InvalidQuery(format!("Keyspace {} does not exist", schema.table.keyspace))
            })?;
            tables
                .entry(schema.table.name.clone())
                .or_insert_with(|| MemoryTable {
                    schema: schema.clone(),
                    rows: Vec::new(),
                });
            Ok(QueryResult::empty())
        }
        Statement::Insert {
            table,
            values,
            if_not_exists,
            ttl_seconds,
        } => {
            let table_state = state.table_mut(table)?;
            let row = row_from_pairs(values);
            let key = table_state.key_of(&row);
            let expires_at = ttl_seconds.map(|ttl| now + Duration::from_secs(u64::from(ttl)));
            match table_state.position(&key) {
                Some(index) if *if_not_exists => Ok(QueryResult {
                    rows: vec![table_state.rows[index].row.clone()],
                    applied: Some(false),
                    schema_in_agreement: true,
                }),
                Some(index) => {
                    let stored = &mut table_state.rows[index];
                    for (column, value) in values {
                        stored.row.set(column, value.clone());
                    }
                    stored.expires_at = expires_at;
                    Ok(QueryResult::empty())
                }
                None => {
                    table_state.rows.push(StoredRow { row, expires_at });
                    Ok(QueryResult {
                        applied: if_not_exists.then_some(true),
                        ..QueryResult::empty()
                    })
                }
            }
        }
        Statement::Update {
            table,
            set,
            key,
            if_exists,
        } => {
            let table_state = state.table_mut(table)?;
            let key_values = table_state.key_of(&row_from_pairs(key));
            match table_state.position(&key_values) {
                Some(index) => {
                    let stored = &mut table_state.rows[index];
                    for (column, value) in set {
                        stored.row.set(column, value.clone());
                    }
                    Ok(QueryResult {
                        applied: if_exists.then_some(true),
                        ..QueryResult::empty()
                    })
                }
                None if *if_exists => Ok(QueryResult {
                    applied: Some(false),
                    ..QueryResult::empty()
                }),
                None => {
                    let mut pairs = key.clone();
                    pairs.extend(set.iter().cloned());
                    table_state.rows.push(StoredRow {
                        row: Row::new(pairs),
                        expires_at: None,
                    });
                    Ok(QueryResult::empty())
                }
            }
        }
        Statement::Delete {
            table,
            key,
            conditions,
        } => {
            let table_state = state.table_mut(table)?;
            let key_values = table_state.key_of(&row_from_pairs(key));
            let position = table_state.position(&key_values);
            if conditions.is_empty() {
                if let Some(index) = position {
                    table_state.rows.remove(index);
                }
                return Ok(QueryResult::empty());
            }
            match position {
                Some(index) if matches_all(&table_state.rows[index].row, conditions) => {
                    table_state.rows.remove(index);
                    Ok(QueryResult {
                        applied: Some(true),
                        ..QueryResult::empty()
                    })
                }
                Some(index) => Ok(QueryResult {
                    rows: vec![table_state.rows[index].row.clone()],
                    applied: Some(false),
                    schema_in_agreement: true,
                }),
                None => Ok(QueryResult {
                    applied: Some(false),
                    ..QueryResult::empty()
                }),
            }
        }
        Statement::Select {
            table,
            columns,
            filter,
            limit,
        } => {
            let table_state = state.table_mut(table)?;
            let mut rows: Vec<Row> = table_state
                .rows
                .iter()
                .filter(|stored| matches_all(&stored.row, filter))
                .map(|stored| stored.row.clone())
                .collect();
            let partition: Vec<String> = table_state.schema.partition_key.clone();
            let clustering = table_state.schema.clustering.clone();
            rows.sort_by(|a, b| {
                for column in &partition {
                    let ordering = a.get(column).cmp(&b.get(column));
                    if ordering.is_ne() {
                        return ordering;
                    }
                }
                for (column, order) in &clustering {
                    let ordering = a.get(column).cmp(&b.get(column));
                    let ordering = match order {
                        ClusteringOrder::Asc => ordering,
                        ClusteringOrder::Desc => ordering.reverse(),
                    };
                    if ordering.is_ne() {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
            if let Some(limit) = limit {
                rows.truncate(*limit);
            }
            if !columns.is_empty() {
                rows = rows
                    .into_iter()
                    .map(|row| {
                        Row::new(
                            columns
                                .iter()
                                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(CqlValue::Null)))
                                .collect(),
                        )
                    })
                    .collect();
            }
            Ok(QueryResult {
                rows,
                ..QueryResult::empty()
            })
        }
    }
}

impl CqlSession for MemorySession {
    fn execute(&self, statement: &Statement, _options: &ExecutionOptions) -> Result<QueryResult, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let mut state = self.lock();
        match statement {
            Statement::Raw(cql) => {
                if state.take_failure(cql, false) {
                    state.executed.push(cql.clone());
                    return Err(StoreError::InvalidQuery(format!("injected failure for `{cql}`")));
                }
            }
            structured => {
                let cql = structured.to_cql();
                if state.take_failure(&cql, true) {
                    return Err(StoreError::InvalidQuery(format!("injected failure for `{cql}`")));
                }
            }
        }
        execute_in(&mut state, statement)
    }

    fn check_schema_agreement(&self) -> Result<bool, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let mut state = self.lock();
        if state.pending_disagreement > 0 {
            state.pending_disagreement -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn keyspace_exists(&self, keyspace: &str) -> Result<bool, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(self.lock().keyspaces.contains_key(keyspace))
    }

    fn table_exists(&self, keyspace: &str, table: &str) -> Result<bool, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(self
            .lock()
            .keyspaces
            .get(keyspace)
            .is_some_and(|tables| tables.contains_key(table)))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Replication;
    use crate::executor::{CqlType, ExecutionOptions};

    fn options() -> ExecutionOptions {
        ExecutionOptions::default()
    }

    fn lease_table(session: &MemorySession) -> TableRef {
        let table = TableRef::new("ks", "lease");
        session
            .execute(
                &Statement::CreateKeyspace {
                    name: "ks".into(),
                    replication: Replication::default(),
                    durable_writes: true,
                },
                &options(),
            )
            .unwrap();
        session
            .execute(
                &Statement::CreateTable(TableSchema {
                    table: table.clone(),
                    columns: vec![("k".into(), CqlType::Text), ("owner".into(), CqlType::Int)],
                    partition_key: vec!["k".into()],
                    clustering: vec![],
                }),
                &options(),
            )
            .unwrap();
        table
    }

    fn take(table: &TableRef, owner: i32, ttl: Option<u32>) -> Statement {
        Statement::Insert {
            table: table.clone(),
            values: vec![
                ("k".into(), CqlValue::Text("lock".into())),
                ("owner".into(), CqlValue::Int(owner)),
            ],
            if_not_exists: true,
            ttl_seconds: ttl,
        }
    }

    #[test]
    fn test_insert_if_not_exists_is_exclusive() {
        let cluster = MemoryCluster::new();
        let first = cluster.session();
        let second = cluster.session();
        let table = lease_table(&first);

        assert!(first.execute(&take(&table, 1, None), &options()).unwrap().was_applied());
        let lost = second.execute(&take(&table, 2, None), &options()).unwrap();
        assert!(!lost.was_applied());
        assert_eq!(lost.rows[0].get_int("owner").unwrap(), 1);
    }

    #[test]
    fn test_ttl_expires_rows() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();
        let table = lease_table(&session);
        assert!(session.execute(&take(&table, 1, Some(5)), &options()).unwrap().was_applied());
        cluster.advance_time(Duration::from_secs(6));
        assert!(cluster.rows(&table).is_empty());
        assert!(session.execute(&take(&table, 2, Some(5)), &options()).unwrap().was_applied());
    }

    #[test]
    fn test_conditional_delete_checks_owner() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();
        let table = lease_table(&session);
        session.execute(&take(&table, 1, None), &options()).unwrap();

        let release = |owner: i32| Statement::Delete {
            table: table.clone(),
            key: vec![("k".into(), CqlValue::Text("lock".into()))],
            conditions: vec![("owner".into(), CqlValue::Int(owner))],
        };
        assert!(!session.execute(&release(2), &options()).unwrap().was_applied());
        assert!(session.execute(&release(1), &options()).unwrap().was_applied());
        assert!(cluster.rows(&table).is_empty());
    }

    #[test]
    fn test_unknown_table_and_closed_session() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();
        let select = Statement::Select {
            table: TableRef::new("ks", "missing"),
            columns: vec![],
            filter: vec![],
            limit: None,
        };
        assert!(matches!(
            session.execute(&select, &options()),
            Err(StoreError::InvalidQuery(_))
        ));
        session.close();
        assert!(session.is_closed());
        assert_eq!(
            session.execute(&Statement::Raw("SELECT 1".into()), &options()),
            Err(StoreError::Closed)
        );
    }

    #[test]
    fn test_failure_injection_and_disagreement() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();
        cluster.fail_statements_containing_times("DROP", 1);
        cluster.disagree_on_statements_containing("ALTER");

        assert!(session.execute(&Statement::Raw("DROP TABLE t".into()), &options()).is_err());
        assert!(session.execute(&Statement::Raw("DROP TABLE t".into()), &options()).is_ok());
        let altered = session
            .execute(&Statement::Raw("ALTER TABLE t ADD b int".into()), &options())
            .unwrap();
        assert!(!altered.schema_in_agreement);
        assert_eq!(cluster.executed_statements().len(), 3);
    }

    #[test]
    fn test_ledger_failures_only_hit_structured_statements() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();
        let table = lease_table(&session);
        cluster.fail_ledger_statements_containing_times("INSERT INTO", 1);

        assert!(session
            .execute(&Statement::Raw("INSERT INTO t (a) VALUES (1)".into()), &options())
            .is_ok());
        assert!(session.execute(&take(&table, 1, None), &options()).is_err());
        assert!(session.execute(&take(&table, 1, None), &options()).unwrap().was_applied());
    }
}
