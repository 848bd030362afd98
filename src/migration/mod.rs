//! Schema migrations for Cassandra-family keyspaces
//!
//! Scripts named `<version>_<name>.cql` are discovered by a
//! [`MigrationRepository`], compared with the keyspace's
//! [`SchemaLedger`] and applied in version order by a [`Migrator`]. Only one
//! instance of a rolling deployment migrates at a time: the one holding the
//! lease row.
//!
//! # Example
//!
//! ```rust,no_run
//! use schemaguard::config::KeyspaceDefinition;
//! use schemaguard::executor::CqlSession;
//! use schemaguard::migration::{
//!     DuplicateStrategy, LedgerOptions, MigrationRepository, Migrator, MigratorOptions,
//!     ScannerRegistry, SchemaLedger,
//! };
//! use std::sync::Arc;
//!
//! fn migrate(session: Arc<dyn CqlSession>) -> Result<(), schemaguard::migration::MigrationError> {
//!     let repository = MigrationRepository::new(
//!         ScannerRegistry::filesystem("."),
//!         &["file:migrations"],
//!         DuplicateStrategy::FailOnDuplicates,
//!     )?;
//!     let ledger = SchemaLedger::new(session, KeyspaceDefinition::new("events"), LedgerOptions::default())?;
//!     let outcome = Migrator::new(repository, ledger, MigratorOptions::default()).migrate()?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod advisor;
pub mod auditor;
pub mod checksum;
pub mod collector;
pub mod error;
pub mod file;
pub mod ledger;
pub mod lexer;
pub mod lock;
pub mod migrator;
pub mod record;
pub mod repository;
pub mod scanner;
pub mod startup;
pub mod state_table;

pub use advisor::{AdvisorKind, ExecutionAdvisor, RetrySchedule};
pub use auditor::ChecksumAuditor;
pub use checksum::{calculate_checksum, strip_comment_lines};
pub use collector::{DuplicateStrategy, ScriptCollector};
pub use error::{ExecutionFailure, MigrationError};
pub use file::ScriptRecord;
pub use ledger::{LedgerOptions, SchemaLedger};
pub use lexer::{split_statements, CqlLexer};
pub use lock::{LeaseGuard, LeaseOutcome, LeaseSettings};
pub use migrator::{MigrationOutcome, Migrator, MigratorOptions};
pub use record::Migration;
pub use repository::MigrationRepository;
pub use scanner::{FileSystemScanner, MemoryScanner, ResourceScanner, ScannerRegistry};
pub use startup::{recompute_checksums, run_migrations};
pub use state_table::LedgerTables;
