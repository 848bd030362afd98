//! Checksum auditing: detects applied scripts that were edited afterwards

use crate::migration::{MigrationError, MigrationRepository, SchemaLedger};

/// Compares the ledger's applied migrations with the scripts on hand
#[derive(Debug, Clone, Copy)]
pub struct ChecksumAuditor<'a> {
    repository: &'a MigrationRepository,
    ledger: &'a SchemaLedger,
}

impl<'a> ChecksumAuditor<'a> {
    #[must_use]
    pub fn new(repository: &'a MigrationRepository, ledger: &'a SchemaLedger) -> Self {
        Self { repository, ledger }
    }

    /// Check every applied migration against the script at the same position
    ///
    /// # Errors
    ///
    /// - `MigrationError::ScriptsRemoved` if fewer scripts exist than were applied
    /// - `MigrationError::ChecksumDrift` listing every mismatching script
    pub fn validate(&self) -> Result<(), MigrationError> {
        let history = self.ledger.load_history()?;
        let available = self.repository.migrations_since(0)?;
        if available.len() < history.len() {
            return Err(MigrationError::ScriptsRemoved {
                persisted: history.len(),
                available: available.len(),
            });
        }

        let drifted: Vec<String> = history
            .iter()
            .zip(&available)
            .filter(|(applied, script)| !applied.is_consistent_with(script))
            .map(|(applied, _)| applied.script_name.clone())
            .collect();
        if !drifted.is_empty() {
            return Err(MigrationError::ChecksumDrift { scripts: drifted });
        }

        log::debug!("{} applied migration(s) match their scripts", history.len());
        Ok(())
    }

    /// Store the current script content for applied versions in `[start, end)`
    ///
    /// Nothing is executed. Returns the number of ledger rows rewritten.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if scripts cannot be read or the ledger update fails.
    pub fn recompute(&self, start: i32, end: i32) -> Result<usize, MigrationError> {
        let mut updated = 0;
        for migration in self.repository.migrations_in_range(start, end)? {
            if self.ledger.update_checksum(&migration)? {
                log::info!(
                    "Recomputed checksum of '{}' (version {})",
                    migration.script_name,
                    migration.version
                );
                updated += 1;
            }
        }
        Ok(updated)
    }
}
