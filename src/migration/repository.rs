//! Script repository: discovers versioned scripts and materializes migrations

use crate::migration::file::SCRIPT_EXTENSION;
use crate::migration::scanner::ScannerRegistry;
use crate::migration::{
    strip_comment_lines, DuplicateStrategy, Migration, MigrationError, ScriptRecord,
};

/// Version reported by a keyspace with no successful migration
///
/// A script carrying this version is discovered but never applied.
pub const BASELINE_VERSION: i32 = 0;

/// Ordered set of migration scripts found in one or more locations
///
/// Discovery happens once, in [`MigrationRepository::new`]. Script content is
/// read when migrations are requested.
#[derive(Debug, Clone)]
pub struct MigrationRepository {
    registry: ScannerRegistry,
    scripts: Vec<ScriptRecord>,
}

impl MigrationRepository {
    /// Discover the scripts in `locations`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Location` if a location cannot be scanned and
    /// `MigrationError::Repository` for malformed names or duplicate versions
    /// (under [`DuplicateStrategy::FailOnDuplicates`]).
    pub fn new<S: AsRef<str>>(
        registry: ScannerRegistry,
        locations: &[S],
        strategy: DuplicateStrategy,
    ) -> Result<Self, MigrationError> {
        let mut collector = strategy.collector();
        for location in locations {
            let location = location.as_ref();
            let (scheme, path, scanner) = registry.resolve(location)?;
            let resources = scanner.list_resources(path).map_err(|e| MigrationError::Location {
                location: location.to_string(),
                message: e.to_string(),
            })?;
            for resource in resources.iter().filter(|r| r.ends_with(SCRIPT_EXTENSION)) {
                collector.collect(ScriptRecord::from_locator(&format!("{scheme}:{resource}"))?)?;
            }
        }

        let mut scripts = collector.into_records();
        scripts.sort();
        log::debug!("Discovered {} migration script(s)", scripts.len());
        let repository = Self { registry, scripts };
        for script in repository.baseline_scripts() {
            log::warn!(
                "Script '{}' has version {BASELINE_VERSION} and will never be applied; start versions at 1",
                script.resource_locator()
            );
        }
        Ok(repository)
    }

    /// Scripts at or below [`BASELINE_VERSION`], which `migrate` never reaches
    pub fn baseline_scripts(&self) -> impl Iterator<Item = &ScriptRecord> {
        self.scripts
            .iter()
            .filter(|record| record.version() <= BASELINE_VERSION)
    }

    /// Discovered scripts, ascending by version
    #[must_use]
    pub fn scripts(&self) -> &[ScriptRecord] {
        &self.scripts
    }

    /// Highest available version, or 0 without scripts
    #[must_use]
    pub fn latest_version(&self) -> i32 {
        self.scripts.last().map_or(0, ScriptRecord::version)
    }

    /// Migrations with a version strictly greater than `version`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Repository` naming the first script that cannot be read.
    pub fn migrations_since(&self, version: i32) -> Result<Vec<Migration>, MigrationError> {
        self.load(|v| v > version)
    }

    /// Migrations with versions in `[start, end)`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Repository` naming the first script that cannot be read.
    pub fn migrations_in_range(&self, start: i32, end: i32) -> Result<Vec<Migration>, MigrationError> {
        self.load(|v| v >= start && v < end)
    }

    fn load(&self, include: impl Fn(i32) -> bool) -> Result<Vec<Migration>, MigrationError> {
        self.scripts
            .iter()
            .filter(|record| include(record.version()))
            .map(|record| self.read(record))
            .collect()
    }

    fn read(&self, record: &ScriptRecord) -> Result<Migration, MigrationError> {
        let (_, path, scanner) = self
            .registry
            .resolve(record.resource_locator())
            .map_err(|e| MigrationError::repository(record.script_name(), e.to_string()))?;
        let content = scanner
            .read_resource(path)
            .map_err(|e| MigrationError::repository(record.script_name(), e.to_string()))?;
        Ok(Migration::new(
            record.script_name(),
            record.version(),
            strip_comment_lines(&content),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::scanner::{MemoryScanner, MEMORY_SCHEME};
    use std::sync::Arc;

    fn registry(scanner: MemoryScanner) -> ScannerRegistry {
        ScannerRegistry::new().with_scanner(MEMORY_SCHEME, Arc::new(scanner))
    }

    #[test]
    fn test_scripts_are_sorted_by_version() {
        let scanner = MemoryScanner::new()
            .with_script("db/1_first.cql", "CREATE TABLE a (x int PRIMARY KEY);")
            .with_script("db/3_third.cql", "CREATE TABLE c (x int PRIMARY KEY);")
            .with_script("db/2_second.cql", "CREATE TABLE b (x int PRIMARY KEY);")
            .with_script("db/README.md", "not a script");
        let repository =
            MigrationRepository::new(registry(scanner), &["memory:db"], DuplicateStrategy::default()).unwrap();

        let versions: Vec<i32> = repository.scripts().iter().map(ScriptRecord::version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(repository.latest_version(), 3);
        assert_eq!(repository.scripts()[1].script_name(), "second.cql");
    }

    #[test]
    fn test_since_and_range_bounds() {
        let scanner = MemoryScanner::new()
            .with_script("db/1_a.cql", "-- first\nSELECT 1;")
            .with_script("db/2_b.cql", "SELECT 2;")
            .with_script("db/3_c.cql", "SELECT 3;");
        let repository =
            MigrationRepository::new(registry(scanner), &["memory:db"], DuplicateStrategy::default()).unwrap();

        let since: Vec<i32> = repository.migrations_since(1).unwrap().iter().map(|m| m.version).collect();
        assert_eq!(since, vec![2, 3]);
        let range: Vec<i32> = repository.migrations_in_range(1, 3).unwrap().iter().map(|m| m.version).collect();
        assert_eq!(range, vec![1, 2]);

        let first = &repository.migrations_since(0).unwrap()[0];
        assert_eq!(first.script, "SELECT 1;");
        assert!(repository.migrations_since(3).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_strategies() {
        let scanner = || {
            MemoryScanner::new()
                .with_script("db/1_original.cql", "SELECT 1;")
                .with_script("db/1_copy.cql", "SELECT 2;")
        };
        let err = MigrationRepository::new(registry(scanner()), &["memory:db"], DuplicateStrategy::FailOnDuplicates)
            .unwrap_err();
        assert!(matches!(err, MigrationError::Repository { ref script, .. } if script == "copy.cql"));

        let repository =
            MigrationRepository::new(registry(scanner()), &["memory:db"], DuplicateStrategy::IgnoreDuplicates).unwrap();
        assert_eq!(repository.scripts().len(), 1);
        assert_eq!(repository.scripts()[0].script_name(), "original.cql");
    }

    #[test]
    fn test_duplicates_across_locations_follow_location_order() {
        let scanner = || {
            MemoryScanner::new()
                .with_script("core/1_accounts.cql", "CREATE TABLE accounts (id int PRIMARY KEY);")
                .with_script("core/2_ledger.cql", "CREATE TABLE ledger (id int PRIMARY KEY);")
                .with_script("extra/2_ledger_copy.cql", "CREATE TABLE ledger_copy (id int PRIMARY KEY);")
                .with_script("extra/3_audit.cql", "CREATE TABLE audit (id int PRIMARY KEY);")
        };
        let locations = ["memory:core", "memory:extra"];

        let err = MigrationRepository::new(registry(scanner()), &locations, DuplicateStrategy::FailOnDuplicates)
            .unwrap_err();
        assert!(matches!(err, MigrationError::Repository { ref script, .. } if script == "ledger_copy.cql"));

        let repository =
            MigrationRepository::new(registry(scanner()), &locations, DuplicateStrategy::IgnoreDuplicates).unwrap();
        let names: Vec<&str> = repository.scripts().iter().map(ScriptRecord::script_name).collect();
        assert_eq!(names, vec!["accounts.cql", "ledger.cql", "audit.cql"]);
        assert_eq!(
            repository.migrations_in_range(2, 3).unwrap()[0].script,
            "CREATE TABLE ledger (id int PRIMARY KEY);"
        );

        let reversed = MigrationRepository::new(
            registry(scanner()),
            &["memory:extra", "memory:core"],
            DuplicateStrategy::IgnoreDuplicates,
        )
        .unwrap();
        assert_eq!(reversed.scripts()[1].script_name(), "ledger_copy.cql");
    }

    #[test]
    fn test_version_zero_is_discovered_but_never_pending() {
        let scanner = MemoryScanner::new()
            .with_script("db/000_bootstrap.cql", "CREATE TABLE boot (id int PRIMARY KEY);")
            .with_script("db/001_users.cql", "CREATE TABLE users (id int PRIMARY KEY);");
        let repository =
            MigrationRepository::new(registry(scanner), &["memory:db"], DuplicateStrategy::default()).unwrap();

        let baseline: Vec<&str> = repository.baseline_scripts().map(ScriptRecord::script_name).collect();
        assert_eq!(baseline, vec!["bootstrap.cql"]);
        let pending: Vec<i32> = repository
            .migrations_since(BASELINE_VERSION)
            .unwrap()
            .iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(pending, vec![1]);
    }

    #[test]
    fn test_empty_location_and_bad_names() {
        let repository = MigrationRepository::new(
            registry(MemoryScanner::new()),
            &["memory:db"],
            DuplicateStrategy::default(),
        )
        .unwrap();
        assert_eq!(repository.latest_version(), 0);

        let bad = MemoryScanner::new().with_script("db/v1_bad.cql", "SELECT 1;");
        let err = MigrationRepository::new(registry(bad), &["memory:db"], DuplicateStrategy::default()).unwrap_err();
        assert!(matches!(err, MigrationError::Repository { ref script, .. } if script == "v1_bad.cql"));

        let err = MigrationRepository::new(ScannerRegistry::new(), &["memory:db"], DuplicateStrategy::default())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Location { .. }));
    }
}
