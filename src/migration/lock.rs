//! Lease-based leader election over the `schema_migration_leader` table
//!
//! The instance whose conditional insert (`IF NOT EXISTS USING TTL`) is
//! applied holds the lease for the keyspace. The row expires with its TTL, so
//! a crashed leader blocks others for at most one TTL.

use crate::executor::{ConsistencyLevel, CqlValue, ExecutionOptions, Statement};
use crate::migration::state_table::{
    COL_ACQUIRED_AT, COL_LEADER_HOST, COL_LEADER_ID, COL_SCOPE_KEY,
};
use crate::migration::{MigrationError, SchemaLedger};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Lease timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSettings {
    /// TTL of the lease row
    pub ttl_seconds: u32,
    /// Wait between attempts while another instance holds the lease
    pub backoff: Duration,
    /// Give up after this many attempts; `None` waits until the work is done
    pub max_attempts: Option<u32>,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            backoff: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// Result of leader election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// This instance holds the lease and must run the migrations
    Leader,
    /// Another instance brought the schema up to the target version
    AlreadyMigrated,
}

/// Releases the lease when dropped
pub struct LeaseGuard<'a> {
    ledger: &'a SchemaLedger,
}

impl<'a> LeaseGuard<'a> {
    pub(crate) fn new(ledger: &'a SchemaLedger) -> Self {
        Self { ledger }
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.ledger.release_lease();
    }
}

impl SchemaLedger {
    fn lwt_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            serial_consistency: Some(ConsistencyLevel::Serial),
            ..self.metadata_options()
        }
    }

    fn lease_key(&self) -> (String, CqlValue) {
        (
            COL_SCOPE_KEY.to_string(),
            CqlValue::Text(self.keyspace.name.clone()),
        )
    }

    fn lease_insert(&self, ttl_seconds: u32) -> Statement {
        Statement::Insert {
            table: self.tables.leader.clone(),
            values: vec![
                self.lease_key(),
                (COL_LEADER_ID.to_string(), CqlValue::Uuid(self.leader_id)),
                (COL_ACQUIRED_AT.to_string(), CqlValue::Timestamp(Utc::now())),
                (COL_LEADER_HOST.to_string(), CqlValue::Text(self.host_name.clone())),
            ],
            if_not_exists: true,
            ttl_seconds: Some(ttl_seconds),
        }
    }

    /// Wait until this instance leads or the schema reaches `target_version`
    ///
    /// Contention and read errors are logged and retried after the configured
    /// backoff.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LeaseTimeout` once `max_attempts` is exhausted.
    pub fn acquire_lease(&self, target_version: i32) -> Result<LeaseOutcome, MigrationError> {
        let settings = &self.options.lease;
        let mut attempts = 0u32;
        loop {
            match self.current_version() {
                Ok(current) if current >= target_version => {
                    log::info!(
                        "Keyspace '{}' already at version {current}, no lead needed",
                        self.keyspace.name
                    );
                    return Ok(LeaseOutcome::AlreadyMigrated);
                }
                Ok(_) => {}
                Err(e) => log::debug!("Could not read schema version, retrying: {e}"),
            }

            if let Some(max) = settings.max_attempts {
                if attempts >= max {
                    return Err(MigrationError::LeaseTimeout {
                        keyspace: self.keyspace.name.clone(),
                        attempts,
                    });
                }
            }
            attempts += 1;

            let acquire = self.lease_insert(settings.ttl_seconds);
            match self.session.execute(&acquire, &self.lwt_options()) {
                Ok(result) if result.was_applied() => {
                    self.lease_held.store(true, Ordering::SeqCst);
                    log::info!(
                        "Took the migration lead for keyspace '{}' as {} on {}",
                        self.keyspace.name,
                        self.leader_id,
                        self.host_name
                    );
                    return Ok(LeaseOutcome::Leader);
                }
                Ok(result) => {
                    let holder = result
                        .rows
                        .first()
                        .and_then(|row| row.get_text(COL_LEADER_HOST).ok())
                        .unwrap_or("another instance");
                    log::info!(
                        "Migration lead for keyspace '{}' is held by {holder}, waiting {:?}",
                        self.keyspace.name,
                        settings.backoff
                    );
                }
                Err(e) => log::debug!("Lease attempt failed, retrying: {e}"),
            }

            thread::sleep(settings.backoff);
        }
    }

    /// Give up the lease if this instance holds it
    ///
    /// Never fails: if the row cannot be deleted (or has already expired and
    /// been taken by someone else) a warning is logged and the TTL cleans up.
    pub fn release_lease(&self) {
        if !self.lease_held() {
            return;
        }
        let release = Statement::Delete {
            table: self.tables.leader.clone(),
            key: vec![self.lease_key()],
            conditions: vec![(COL_LEADER_ID.to_string(), CqlValue::Uuid(self.leader_id))],
        };
        match self.session.execute(&release, &self.lwt_options()) {
            Ok(result) if result.was_applied() => {
                self.lease_held.store(false, Ordering::SeqCst);
                log::info!("Released the migration lead for keyspace '{}'", self.keyspace.name);
            }
            Ok(_) => log::warn!(
                "Migration lease for keyspace '{}' was no longer ours; it expires with its TTL",
                self.keyspace.name
            ),
            Err(e) => log::warn!(
                "Could not release the migration lease for keyspace '{}', it expires with its TTL: {e}",
                self.keyspace.name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyspaceDefinition;
    use crate::memory::MemoryCluster;
    use crate::migration::{LedgerOptions, Migration};
    use std::sync::Arc;

    fn ledger(cluster: &MemoryCluster, max_attempts: Option<u32>) -> SchemaLedger {
        let options = LedgerOptions {
            lease: LeaseSettings {
                ttl_seconds: 60,
                backoff: Duration::from_millis(1),
                max_attempts,
            },
            ..LedgerOptions::default()
        };
        SchemaLedger::new(Arc::new(cluster.session()), KeyspaceDefinition::new("app"), options).unwrap()
    }

    #[test]
    fn test_single_leader() {
        let cluster = MemoryCluster::new();
        let first = ledger(&cluster, Some(3));
        let second = ledger(&cluster, Some(3));

        assert_eq!(first.acquire_lease(1).unwrap(), LeaseOutcome::Leader);
        assert!(first.lease_held());
        assert!(matches!(
            second.acquire_lease(1),
            Err(MigrationError::LeaseTimeout { attempts: 3, .. })
        ));
        assert!(!second.lease_held());

        let rows = cluster.rows(&first.tables().leader);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_uuid(COL_LEADER_ID).unwrap(), first.leader_id());
    }

    #[test]
    fn test_release_lets_the_next_instance_lead() {
        let cluster = MemoryCluster::new();
        let first = ledger(&cluster, Some(1));
        let second = ledger(&cluster, Some(1));

        {
            assert_eq!(first.acquire_lease(1).unwrap(), LeaseOutcome::Leader);
            let _guard = LeaseGuard::new(&first);
        }
        assert!(!first.lease_held());
        assert_eq!(second.acquire_lease(1).unwrap(), LeaseOutcome::Leader);
    }

    #[test]
    fn test_already_migrated_skips_election() {
        let cluster = MemoryCluster::new();
        let leader = ledger(&cluster, None);
        leader
            .execute(&Migration::new("a.cql", 1, "CREATE TABLE a (x int PRIMARY KEY);"))
            .unwrap();

        let follower = ledger(&cluster, None);
        assert_eq!(follower.acquire_lease(1).unwrap(), LeaseOutcome::AlreadyMigrated);
        assert!(cluster.rows(&follower.tables().leader).is_empty());
    }

    #[test]
    fn test_acquired_at_is_taken_on_the_winning_attempt() {
        let cluster = MemoryCluster::new();
        let first = ledger(&cluster, None);
        assert_eq!(first.acquire_lease(1).unwrap(), LeaseOutcome::Leader);

        let (released_at, waiter_id) = thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let second = ledger(&cluster, None);
                let outcome = second.acquire_lease(1).unwrap();
                (outcome, second.leader_id())
            });
            thread::sleep(Duration::from_millis(50));
            let released_at = Utc::now();
            first.release_lease();
            let (outcome, waiter_id) = waiter.join().unwrap();
            assert_eq!(outcome, LeaseOutcome::Leader);
            (released_at, waiter_id)
        });

        let rows = cluster.rows(&first.tables().leader);
        assert_eq!(rows[0].get_uuid(COL_LEADER_ID).unwrap(), waiter_id);
        assert!(rows[0].get_timestamp(COL_ACQUIRED_AT).unwrap() >= released_at);
    }

    #[test]
    fn test_election_retries_after_query_errors() {
        let cluster = MemoryCluster::new();
        let instance = ledger(&cluster, Some(5));
        cluster.fail_ledger_statements_containing_times("FROM app.schema_migration ", 2);
        cluster.fail_ledger_statements_containing_times("INSERT INTO app.schema_migration_leader", 2);

        assert_eq!(instance.acquire_lease(1).unwrap(), LeaseOutcome::Leader);
        assert!(instance.lease_held());
        assert_eq!(cluster.rows(&instance.tables().leader).len(), 1);
    }

    #[test]
    fn test_election_errors_count_towards_max_attempts() {
        let cluster = MemoryCluster::new();
        let instance = ledger(&cluster, Some(2));
        cluster.fail_ledger_statements_containing_times("INSERT INTO app.schema_migration_leader", 2);

        assert!(matches!(
            instance.acquire_lease(1),
            Err(MigrationError::LeaseTimeout { attempts: 2, .. })
        ));
        assert!(!instance.lease_held());
    }

    #[test]
    fn test_expired_lease_is_released_gracefully() {
        let cluster = MemoryCluster::new();
        let stale = ledger(&cluster, Some(1));
        let fresh = ledger(&cluster, Some(1));

        assert_eq!(stale.acquire_lease(1).unwrap(), LeaseOutcome::Leader);
        cluster.advance_time(Duration::from_secs(61));
        assert_eq!(fresh.acquire_lease(1).unwrap(), LeaseOutcome::Leader);

        // The stale holder's conditional delete must not remove the new lease
        stale.release_lease();
        assert!(stale.lease_held());
        let rows = cluster.rows(&fresh.tables().leader);
        assert_eq!(rows[0].get_uuid(COL_LEADER_ID).unwrap(), fresh.leader_id());
    }
}
