//! Migrator - runs pending migrations under the cluster-wide lease

use crate::config::MigrationConfig;
use crate::migration::lock::{LeaseGuard, LeaseOutcome};
use crate::migration::{ChecksumAuditor, MigrationError, MigrationRepository, SchemaLedger};
use std::time::Instant;

/// Switches for a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigratorOptions {
    /// Elect a single leader before applying scripts
    pub leader_election: bool,
    /// Audit applied scripts before migrating
    pub checksum_validation: bool,
    /// Only audit, never apply
    pub validate_only: bool,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            leader_election: true,
            checksum_validation: true,
            validate_only: false,
        }
    }
}

impl From<&MigrationConfig> for MigratorOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            leader_election: config.leader_election,
            checksum_validation: config.checksum_validation,
            validate_only: config.validate_only,
        }
    }
}

/// What a migration run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The keyspace was already at (or past) the latest script version
    UpToDate { version: i32 },
    /// Validate-only run: applied scripts match
    Validated,
    /// This instance applied `applied` scripts, moving from `from` to `to`
    Migrated { from: i32, to: i32, applied: usize },
}

/// Brings a keyspace up to the latest script version
///
/// The migrator owns the ledger, and with it the session: [`Migrator::migrate`]
/// closes the session on every path.
#[derive(Debug)]
pub struct Migrator {
    repository: MigrationRepository,
    ledger: SchemaLedger,
    options: MigratorOptions,
}

impl Migrator {
    #[must_use]
    pub fn new(repository: MigrationRepository, ledger: SchemaLedger, options: MigratorOptions) -> Self {
        Self {
            repository,
            ledger,
            options,
        }
    }

    pub fn repository(&self) -> &MigrationRepository {
        &self.repository
    }

    pub fn ledger(&self) -> &SchemaLedger {
        &self.ledger
    }

    /// Run the migration state machine, then close the session
    ///
    /// 1. Check the ledger version against the latest script.
    /// 2. Take the lease (if leader election is on); another instance may
    ///    finish the work while we wait.
    /// 3. Re-read the version under the lease.
    /// 4. Apply every newer script in order, stopping at the first failure.
    /// 5. Release the lease.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Execution` for the first failing statement, the
    /// auditor's errors when checksum validation is on, and ledger errors.
    pub fn migrate(self) -> Result<MigrationOutcome, MigrationError> {
        let result = self.run();
        self.ledger.close();
        result
    }

    fn run(&self) -> Result<MigrationOutcome, MigrationError> {
        let auditor = ChecksumAuditor::new(&self.repository, &self.ledger);
        if self.options.validate_only {
            auditor.validate()?;
            log::info!("Applied migrations of keyspace '{}' are valid", self.ledger.keyspace());
            return Ok(MigrationOutcome::Validated);
        }
        if self.options.checksum_validation {
            auditor.validate()?;
        }

        let latest = self.repository.latest_version();
        let current = self.ledger.current_version()?;
        if current >= latest {
            log::info!("Keyspace '{}' is up to date at version {current}", self.ledger.keyspace());
            return Ok(MigrationOutcome::UpToDate { version: current });
        }

        let _lease = if self.options.leader_election {
            match self.ledger.acquire_lease(latest)? {
                LeaseOutcome::Leader => Some(LeaseGuard::new(&self.ledger)),
                LeaseOutcome::AlreadyMigrated => {
                    let version = self.ledger.current_version()?;
                    return Ok(MigrationOutcome::UpToDate { version });
                }
            }
        } else {
            None
        };

        let current = self.ledger.current_version()?;
        if current >= latest {
            log::info!("Keyspace '{}' was migrated to version {current} meanwhile", self.ledger.keyspace());
            return Ok(MigrationOutcome::UpToDate { version: current });
        }

        let pending = self.repository.migrations_since(current)?;
        log::info!(
            "Applying {} migration(s) to keyspace '{}' (version {current} -> {latest})",
            pending.len(),
            self.ledger.keyspace()
        );
        for migration in &pending {
            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "apply_migration",
                version = migration.version,
                script = %migration.script_name
            )
            .entered();

            let start = Instant::now();
            self.ledger.execute(migration)?;
            log::info!(
                "Applied migration '{}' (version {}) in {}ms",
                migration.script_name,
                migration.version,
                start.elapsed().as_millis()
            );
        }

        Ok(MigrationOutcome::Migrated {
            from: current,
            to: pending.last().map_or(current, |m| m.version),
            applied: pending.len(),
        })
    }

    /// Audit applied migrations without applying anything
    ///
    /// # Errors
    ///
    /// See [`ChecksumAuditor::validate`].
    pub fn validate(&self) -> Result<(), MigrationError> {
        ChecksumAuditor::new(&self.repository, &self.ledger).validate()
    }

    /// Store current checksums for applied versions in `[start, end)`
    ///
    /// # Errors
    ///
    /// See [`ChecksumAuditor::recompute`].
    pub fn recompute(&self, start: i32, end: i32) -> Result<usize, MigrationError> {
        ChecksumAuditor::new(&self.repository, &self.ledger).recompute(start, end)
    }

    /// Close the session without migrating
    pub fn close(&self) {
        self.ledger.close();
    }
}
