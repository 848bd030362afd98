//! Duplicate-version resolution during script discovery

use crate::migration::{MigrationError, ScriptRecord};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};

/// How discovery treats two scripts claiming the same version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    /// Abort discovery on the second script with an already-seen version
    #[default]
    FailOnDuplicates,
    /// Keep the first script registered for a version, drop the rest
    IgnoreDuplicates,
}

impl DuplicateStrategy {
    /// A fresh collector implementing this strategy
    #[must_use]
    pub fn collector(self) -> Box<dyn ScriptCollector> {
        match self {
            DuplicateStrategy::FailOnDuplicates => Box::<FailOnDuplicatesCollector>::default(),
            DuplicateStrategy::IgnoreDuplicates => Box::<IgnoreDuplicatesCollector>::default(),
        }
    }
}

/// Receives discovered scripts one at a time, in discovery order
pub trait ScriptCollector: Send {
    /// # Errors
    ///
    /// Returns `MigrationError::Repository` if the strategy rejects the record.
    fn collect(&mut self, record: ScriptRecord) -> Result<(), MigrationError>;

    /// The collected records (not necessarily sorted)
    fn into_records(self: Box<Self>) -> Vec<ScriptRecord>;
}

#[derive(Debug, Default)]
pub struct FailOnDuplicatesCollector {
    records: Vec<ScriptRecord>,
    versions: HashSet<i32>,
}

impl ScriptCollector for FailOnDuplicatesCollector {
    fn collect(&mut self, record: ScriptRecord) -> Result<(), MigrationError> {
        if !self.versions.insert(record.version()) {
            return Err(MigrationError::repository(
                record.script_name(),
                format!(
                    "found more than one script for version {} ({})",
                    record.version(),
                    record.resource_locator()
                ),
            ));
        }
        self.records.push(record);
        Ok(())
    }

    fn into_records(self: Box<Self>) -> Vec<ScriptRecord> {
        self.records
    }
}

#[derive(Debug, Default)]
pub struct IgnoreDuplicatesCollector {
    records: BTreeSet<ScriptRecord>,
}

impl ScriptCollector for IgnoreDuplicatesCollector {
    fn collect(&mut self, record: ScriptRecord) -> Result<(), MigrationError> {
        if let Some(kept) = self.records.get(&record) {
            log::debug!(
                "Ignoring {} because {} already provides version {}",
                record.resource_locator(),
                kept.resource_locator(),
                record.version()
            );
            return Ok(());
        }
        self.records.insert(record);
        Ok(())
    }

    fn into_records(self: Box<Self>) -> Vec<ScriptRecord> {
        self.records.into_iter().collect()
    }
}
