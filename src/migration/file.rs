//! Migration script discovery metadata

use crate::migration::MigrationError;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Extension of recognized migration scripts
pub const SCRIPT_EXTENSION: &str = ".cql";

/// Separates the version prefix from the script name
pub const VERSION_NAME_DELIMITER: char = '_';

/// A discovered migration script (metadata only, content is read on demand)
///
/// Equality, hashing and ordering consider the version alone: two records
/// with the same version are the same change as far as the repository is
/// concerned, whatever their names.
#[derive(Debug, Clone)]
pub struct ScriptRecord {
    version: i32,
    resource_locator: String,
    script_name: String,
}

impl ScriptRecord {
    /// Create a new `ScriptRecord`
    pub fn new(version: i32, resource_locator: impl Into<String>, script_name: impl Into<String>) -> Self {
        Self {
            version,
            resource_locator: resource_locator.into(),
            script_name: script_name.into(),
        }
    }

    /// Build a record from a resource locator (`scheme:path/003_add_events.cql`)
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Repository` if the file name has no version
    /// prefix or the prefix is not a non-negative integer.
    pub fn from_locator(resource_locator: &str) -> Result<Self, MigrationError> {
        let file_name = base_name(resource_locator);
        let (version, script_name) = parse_file_name(file_name)?;
        Ok(Self::new(version, resource_locator, script_name))
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn resource_locator(&self) -> &str {
        &self.resource_locator
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }
}

impl PartialEq for ScriptRecord {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for ScriptRecord {}

impl Hash for ScriptRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.hash(state);
    }
}

impl PartialOrd for ScriptRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScriptRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version.cmp(&other.version)
    }
}

/// Last path segment of a locator, ignoring any `scheme:` prefix
pub fn base_name(resource_locator: &str) -> &str {
    resource_locator
        .rsplit(|c: char| c == '/' || c == '\\' || c == ':')
        .next()
        .unwrap_or(resource_locator)
}

/// Parse a script file name into version and script name
///
/// Expected format: `{version}_{name}.cql`. The split happens on the first
/// delimiter, so the name may itself contain underscores.
///
/// # Example
/// - `003_add_events_table.cql` → version: 3, name: "add_events_table.cql"
///
/// # Errors
///
/// Returns `MigrationError::Repository` naming the file if it has no
/// delimiter or its version prefix is not a non-negative integer.
pub fn parse_file_name(file_name: &str) -> Result<(i32, String), MigrationError> {
    let (prefix, name) = file_name.split_once(VERSION_NAME_DELIMITER).ok_or_else(|| {
        MigrationError::repository(
            file_name,
            format!(
                "file name does not match the pattern {{version}}{VERSION_NAME_DELIMITER}{{name}}{SCRIPT_EXTENSION}"
            ),
        )
    })?;

    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MigrationError::repository(
            file_name,
            format!("version prefix '{prefix}' is not a non-negative integer"),
        ));
    }

    let version = prefix.parse::<i32>().map_err(|e| {
        MigrationError::repository(file_name, format!("version prefix '{prefix}' is out of range: {e}"))
    })?;

    Ok((version, name.to_string()))
}
