//! # Schemaguard
//!
//! Versioned schema migrations for Cassandra-family column stores, safe to run
//! from every instance of a rolling deployment.
//!
//! - [`migration`]: script discovery, the statement lexer, the schema ledger,
//!   lease-based leader election, the migrator and the checksum auditor
//! - [`executor`]: the driver boundary ([`executor::CqlSession`])
//! - [`config`]: [`config::MigrationConfig`] loading
//! - `memory` (feature `test-helpers`): an in-memory cluster for tests

pub mod config;
pub mod executor;
pub mod migration;

#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;

pub use config::{KeyspaceDefinition, MigrationConfig, Replication};
pub use executor::{CqlSession, StoreError};
pub use migration::{run_migrations, MigrationError, MigrationOutcome, Migrator};
