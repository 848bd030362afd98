//! Rolling-deployment scenarios: several instances migrate the same keyspace at once

use schemaguard::config::{KeyspaceDefinition, MigrationConfig};
use schemaguard::executor::CqlValue;
use schemaguard::memory::MemoryCluster;
use schemaguard::migration::scanner::MEMORY_SCHEME;
use schemaguard::migration::{run_migrations, LedgerTables, MemoryScanner, MigrationOutcome, ScannerRegistry};
use std::sync::Arc;
use std::thread;

const INSTANCES: usize = 6;
const SCRIPTS: i32 = 5;

fn scanner() -> Arc<MemoryScanner> {
    let scanner = MemoryScanner::new();
    for version in 1..=SCRIPTS {
        scanner.insert(
            format!("db/{version:03}_table_{version}.cql"),
            format!("CREATE TABLE t{version} (id int PRIMARY KEY);\nALTER TABLE t{version} ADD v text;"),
        );
    }
    Arc::new(scanner)
}

fn config() -> MigrationConfig {
    let mut config = MigrationConfig::new(KeyspaceDefinition::new("fleet"));
    config.script_locations = vec!["memory:db".to_string()];
    config.lease_backoff_ms = 2;
    config
}

#[test]
fn test_concurrent_instances_migrate_exactly_once() {
    let cluster = MemoryCluster::new();
    let scanner = scanner();
    let config = config();

    let outcomes: Vec<MigrationOutcome> = thread::scope(|scope| {
        let handles: Vec<_> = (0..INSTANCES)
            .map(|_| {
                let session = Arc::new(cluster.session());
                let registry = ScannerRegistry::new().with_scanner(MEMORY_SCHEME, scanner.clone());
                let config = &config;
                scope.spawn(move || run_migrations(config, session, registry))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect()
    });

    let migrated: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, MigrationOutcome::Migrated { .. }))
        .collect();
    assert_eq!(migrated.len(), 1);
    assert_eq!(
        *migrated[0],
        MigrationOutcome::Migrated { from: 0, to: SCRIPTS, applied: SCRIPTS as usize }
    );
    assert!(outcomes
        .iter()
        .filter(|o| !matches!(o, MigrationOutcome::Migrated { .. }))
        .all(|o| *o == MigrationOutcome::UpToDate { version: SCRIPTS }));

    let expected: Vec<String> = (1..=SCRIPTS)
        .flat_map(|v| {
            [
                format!("CREATE TABLE t{v} (id int PRIMARY KEY)"),
                format!("ALTER TABLE t{v} ADD v text"),
            ]
        })
        .collect();
    assert_eq!(cluster.executed_statements(), expected);

    let tables = LedgerTables::new("fleet", None);
    let successful = cluster
        .rows(&tables.history)
        .into_iter()
        .filter(|row| row.get("applied_successful") == Some(&CqlValue::Boolean(true)))
        .count();
    assert_eq!(successful, SCRIPTS as usize);
    assert!(cluster.rows(&tables.leader).is_empty());
}

#[test]
fn test_late_instances_see_up_to_date_keyspace() {
    let cluster = MemoryCluster::new();
    let scanner = scanner();
    let registry = || ScannerRegistry::new().with_scanner(MEMORY_SCHEME, scanner.clone());

    run_migrations(&config(), Arc::new(cluster.session()), registry()).unwrap();
    for _ in 0..3 {
        assert_eq!(
            run_migrations(&config(), Arc::new(cluster.session()), registry()).unwrap(),
            MigrationOutcome::UpToDate { version: SCRIPTS }
        );
    }
    assert_eq!(cluster.executed_statements().len(), 2 * SCRIPTS as usize);
}
