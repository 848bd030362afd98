//! `Migration` - a fully materialized migration script or ledger entry

use crate::executor::{Row, StoreError};
use crate::migration::calculate_checksum;
use crate::migration::state_table::{
    COL_APPLIED_SUCCESSFUL, COL_EXECUTED_AT, COL_SCRIPT, COL_SCRIPT_NAME, COL_VERSION,
};
use chrono::{DateTime, Utc};

/// A migration with its content and checksum
///
/// Built by the repository when content is requested, or reconstructed from a
/// row of the `schema_migration` ledger table. Two migrations are the same
/// change when their versions match and consistent when their checksums match
/// as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Script file name without the version prefix
    pub script_name: String,

    pub version: i32,

    /// Comment-filtered script text
    pub script: String,

    /// CRC-32 of `script`
    pub checksum: u32,

    pub applied_successfully: bool,

    pub executed_at: DateTime<Utc>,
}

impl Migration {
    /// Create a not-yet-applied `Migration`, computing its checksum
    #[must_use]
    pub fn new(script_name: impl Into<String>, version: i32, script: impl Into<String>) -> Self {
        let script = script.into();
        Self {
            script_name: script_name.into(),
            version,
            checksum: calculate_checksum(&script),
            script,
            applied_successfully: false,
            executed_at: Utc::now(),
        }
    }

    /// Whether `other` is the same change with the same content
    #[must_use]
    pub fn is_consistent_with(&self, other: &Migration) -> bool {
        self.version == other.version && self.checksum == other.checksum
    }

    /// Create a `Migration` from a ledger row
    ///
    /// The checksum is recomputed from the stored script text.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Decode` if a column is missing or has the wrong type.
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        let script = row.get_text(COL_SCRIPT)?.to_string();
        Ok(Self {
            script_name: row.get_text(COL_SCRIPT_NAME)?.to_string(),
            version: row.get_int(COL_VERSION)?,
            checksum: calculate_checksum(&script),
            script,
            applied_successfully: row.get_bool(COL_APPLIED_SUCCESSFUL)?,
            executed_at: row.get_timestamp(COL_EXECUTED_AT)?,
        })
    }
}
