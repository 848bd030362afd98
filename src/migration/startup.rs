//! In-process migration entry points
//!
//! Applications call [`run_migrations`] during initialization, before serving
//! traffic. In a rolling deployment every instance calls it; one takes the
//! lease and migrates, the others wait until the keyspace is current.

use crate::config::MigrationConfig;
use crate::executor::CqlSession;
use crate::migration::scanner::ScannerRegistry;
use crate::migration::{
    ChecksumAuditor, LedgerOptions, MigrationError, MigrationOutcome, MigrationRepository,
    Migrator, MigratorOptions, SchemaLedger,
};
use std::sync::Arc;

/// Migrate the configured keyspace to the latest script version
///
/// Builds the repository, ledger and migrator from `config` and runs them.
/// The session is closed when this returns, whatever the outcome.
///
/// # Example
///
/// ```rust,no_run
/// use schemaguard::config::MigrationConfig;
/// use schemaguard::executor::CqlSession;
/// use schemaguard::migration::{run_migrations, ScannerRegistry};
/// use std::sync::Arc;
///
/// fn startup(session: Arc<dyn CqlSession>) -> Result<(), Box<dyn std::error::Error>> {
///     let config = MigrationConfig::load()?;
///     run_migrations(&config, session, ScannerRegistry::filesystem("."))?;
///     Ok(())
/// }
/// ```
///
/// # Errors
///
/// Fails fast with the first `MigrationError`; the application should not start.
pub fn run_migrations(
    config: &MigrationConfig,
    session: Arc<dyn CqlSession>,
    registry: ScannerRegistry,
) -> Result<MigrationOutcome, MigrationError> {
    let migrator = build_migrator(config, session, registry)?;
    let outcome = migrator.migrate()?;
    match outcome {
        MigrationOutcome::Migrated { applied, to, .. } => {
            log::info!("Applied {applied} migration(s) on startup, now at version {to}");
        }
        MigrationOutcome::UpToDate { version } => {
            log::debug!("No pending migrations, keyspace at version {version}");
        }
        MigrationOutcome::Validated => {}
    }
    Ok(outcome)
}

/// Store current checksums for applied versions in `[start, end)` without executing anything
///
/// For scripts that were deliberately edited after being applied. The session
/// is closed when this returns.
///
/// # Errors
///
/// Returns `MigrationError` if scripts cannot be read or the ledger update fails.
pub fn recompute_checksums(
    config: &MigrationConfig,
    session: Arc<dyn CqlSession>,
    registry: ScannerRegistry,
    start: i32,
    end: i32,
) -> Result<usize, MigrationError> {
    let migrator = build_migrator(config, session, registry)?;
    let result = ChecksumAuditor::new(migrator.repository(), migrator.ledger()).recompute(start, end);
    migrator.close();
    result
}

fn build_migrator(
    config: &MigrationConfig,
    session: Arc<dyn CqlSession>,
    registry: ScannerRegistry,
) -> Result<Migrator, MigrationError> {
    let repository = match MigrationRepository::new(
        registry,
        config.script_locations.as_slice(),
        config.duplicate_strategy,
    ) {
        Ok(repository) => repository,
        Err(e) => {
            session.close();
            return Err(e);
        }
    };
    let ledger = match SchemaLedger::new(
        Arc::clone(&session),
        config.keyspace.clone(),
        LedgerOptions::from(config),
    ) {
        Ok(ledger) => ledger,
        Err(e) => {
            session.close();
            return Err(e);
        }
    };
    Ok(Migrator::new(repository, ledger, MigratorOptions::from(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyspaceDefinition;
    use crate::memory::MemoryCluster;
    use crate::migration::scanner::{MemoryScanner, MEMORY_SCHEME};

    fn config() -> MigrationConfig {
        let mut config = MigrationConfig::new(KeyspaceDefinition::new("inventory"));
        config.script_locations = vec!["memory:scripts".to_string()];
        config.lease_backoff_ms = 1;
        config
    }

    fn registry(scanner: Arc<MemoryScanner>) -> ScannerRegistry {
        ScannerRegistry::new().with_scanner(MEMORY_SCHEME, scanner)
    }

    #[test]
    fn test_run_migrations_end_to_end() {
        let cluster = MemoryCluster::new();
        let scanner = Arc::new(
            MemoryScanner::new().with_script("scripts/1_items.cql", "CREATE TABLE items (sku text PRIMARY KEY);"),
        );
        let session = Arc::new(cluster.session());

        let outcome = run_migrations(&config(), session.clone(), registry(scanner)).unwrap();
        assert_eq!(outcome, MigrationOutcome::Migrated { from: 0, to: 1, applied: 1 });
        assert!(session.is_closed());
    }

    #[test]
    fn test_repository_errors_close_the_session() {
        let cluster = MemoryCluster::new();
        let session = Arc::new(cluster.session());
        let err = run_migrations(&config(), session.clone(), ScannerRegistry::new()).unwrap_err();
        assert!(matches!(err, MigrationError::Location { .. }));
        assert!(session.is_closed());
    }

    #[test]
    fn test_recompute_checksums() {
        let cluster = MemoryCluster::new();
        let scanner = Arc::new(
            MemoryScanner::new().with_script("scripts/1_items.cql", "CREATE TABLE items (sku text PRIMARY KEY);"),
        );
        run_migrations(&config(), Arc::new(cluster.session()), registry(scanner.clone())).unwrap();

        scanner.insert("scripts/1_items.cql", "CREATE TABLE items (sku text PRIMARY KEY, qty int);");
        let session = Arc::new(cluster.session());
        assert!(matches!(
            run_migrations(&config(), session, registry(scanner.clone())),
            Err(MigrationError::ChecksumDrift { .. })
        ));

        let session = Arc::new(cluster.session());
        assert_eq!(recompute_checksums(&config(), session.clone(), registry(scanner.clone()), 1, 2).unwrap(), 1);
        assert!(session.is_closed());
        assert_eq!(
            run_migrations(&config(), Arc::new(cluster.session()), registry(scanner)).unwrap(),
            MigrationOutcome::UpToDate { version: 1 }
        );
    }
}
