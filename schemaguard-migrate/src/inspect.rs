//! Offline inspection of migration scripts

use schemaguard::migration::repository::BASELINE_VERSION;
use schemaguard::migration::{
    split_statements, DuplicateStrategy, MigrationError, MigrationRepository, ScannerRegistry,
};
use std::path::Path;

/// One discovered script, as shown by `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSummary {
    pub version: i32,
    pub script_name: String,
    pub checksum: u32,
    pub statements: usize,
    /// Version at or below the baseline; `migrate` never applies it
    pub never_applied: bool,
}

/// Discover and summarize the scripts under `locations`, relative to `base_dir`
///
/// # Errors
///
/// Returns `MigrationError` for unreadable locations, malformed names or
/// duplicate versions (under `FailOnDuplicates`).
pub fn summarize<S: AsRef<str>>(
    base_dir: &Path,
    locations: &[S],
    strategy: DuplicateStrategy,
) -> Result<Vec<ScriptSummary>, MigrationError> {
    let repository = MigrationRepository::new(ScannerRegistry::filesystem(base_dir), locations, strategy)?;
    Ok(repository
        .migrations_since(-1)?
        .into_iter()
        .map(|migration| ScriptSummary {
            never_applied: migration.version <= BASELINE_VERSION,
            version: migration.version,
            statements: split_statements(&migration.script).len(),
            checksum: migration.checksum,
            script_name: migration.script_name,
        })
        .collect())
}
