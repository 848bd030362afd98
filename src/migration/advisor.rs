//! Execution advisors: hooks around every migration statement
//!
//! Some managed deployments need extra care around schema changes (waiting
//! for agreement to settle, pacing DDL). Advisors are a fixed, statically
//! registered set selected by [`AdvisorKind`].

use crate::executor::{CqlSession, QueryResult, Statement};
use crate::migration::ExecutionFailure;
use serde::Deserialize;
use std::thread;
use std::time::Duration;

/// Hooks run before and after each migration statement
pub trait ExecutionAdvisor: Send + Sync {
    /// Called before the statement is sent
    ///
    /// # Errors
    ///
    /// Returns `ExecutionFailure` to abort the migration before the statement runs.
    fn before_execute(&self, _session: &dyn CqlSession, _statement: &Statement) -> Result<(), ExecutionFailure> {
        Ok(())
    }

    /// Called with the statement's result; may refine it (e.g. after waiting
    /// for schema agreement)
    ///
    /// # Errors
    ///
    /// Returns `ExecutionFailure` to abort the migration after the statement ran.
    fn after_execute(
        &self,
        _session: &dyn CqlSession,
        _statement: &Statement,
        result: QueryResult,
    ) -> Result<QueryResult, ExecutionFailure> {
        Ok(result)
    }
}

/// Available advisors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorKind {
    /// Trust the driver's agreement flag as reported with each result
    #[default]
    Standard,
    /// Poll for schema agreement on a bounded schedule when a result reports disagreement
    AgreementPolling,
}

impl AdvisorKind {
    #[must_use]
    pub fn advisor(self, schedule: RetrySchedule) -> Box<dyn ExecutionAdvisor> {
        match self {
            AdvisorKind::Standard => Box::new(StandardAdvisor),
            AdvisorKind::AgreementPolling => Box::new(AgreementPollingAdvisor::new(schedule)),
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySchedule {
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 2_000,
            max_attempts: 10,
        }
    }
}

impl RetrySchedule {
    /// The delay before each attempt; yields exactly `max_attempts` values
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let schedule = *self;
        let mut next = schedule.initial_delay_ms.min(schedule.max_delay_ms);
        (0..schedule.max_attempts).map(move |_| {
            let delay = next;
            next = next
                .saturating_mul(u64::from(schedule.multiplier))
                .min(schedule.max_delay_ms);
            Duration::from_millis(delay)
        })
    }
}

/// No-op hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardAdvisor;

impl ExecutionAdvisor for StandardAdvisor {}

/// Waits for schema agreement after statements that report disagreement
#[derive(Debug, Clone)]
pub struct AgreementPollingAdvisor {
    schedule: RetrySchedule,
}

impl AgreementPollingAdvisor {
    #[must_use]
    pub fn new(schedule: RetrySchedule) -> Self {
        Self { schedule }
    }
}

impl ExecutionAdvisor for AgreementPollingAdvisor {
    fn after_execute(
        &self,
        session: &dyn CqlSession,
        statement: &Statement,
        mut result: QueryResult,
    ) -> Result<QueryResult, ExecutionFailure> {
        if result.schema_in_agreement {
            return Ok(result);
        }

        for (attempt, delay) in self.schedule.delays().enumerate() {
            thread::sleep(delay);
            match session.check_schema_agreement() {
                Ok(true) => {
                    log::debug!(
                        "Schema agreement reached after {} check(s) for `{statement}`",
                        attempt + 1
                    );
                    result.schema_in_agreement = true;
                    return Ok(result);
                }
                Ok(false) => {}
                Err(e) => log::debug!("Schema agreement check failed, retrying: {e}"),
            }
        }

        Err(ExecutionFailure::AgreementTimeout {
            attempts: self.schedule.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;

    fn fast_schedule(max_attempts: u32) -> RetrySchedule {
        RetrySchedule {
            initial_delay_ms: 1,
            multiplier: 2,
            max_delay_ms: 4,
            max_attempts,
        }
    }

    fn disagreeing() -> QueryResult {
        QueryResult {
            schema_in_agreement: false,
            ..QueryResult::empty()
        }
    }

    #[test]
    fn test_delays_are_capped_and_bounded() {
        let delays: Vec<u64> = fast_schedule(5).delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![1, 2, 4, 4, 4]);
        assert_eq!(RetrySchedule::default().delays().count(), 10);
    }

    #[test]
    fn test_standard_advisor_passes_result_through() {
        let cluster = MemoryCluster::new();
        let session = cluster.session();
        let statement = Statement::Raw("SELECT 1".into());
        let result = StandardAdvisor
            .after_execute(&session, &statement, disagreeing())
            .unwrap();
        assert!(!result.schema_in_agreement);
    }

    #[test]
    fn test_polling_advisor_waits_for_agreement() {
        let cluster = MemoryCluster::new();
        cluster.set_agreement_lag(2);
        cluster.delay_agreement();
        let session = cluster.session();
        let statement = Statement::Raw("CREATE TABLE t (a int PRIMARY KEY)".into());
        let result = AgreementPollingAdvisor::new(fast_schedule(5))
            .after_execute(&session, &statement, disagreeing())
            .unwrap();
        assert!(result.schema_in_agreement);
    }

    #[test]
    fn test_polling_advisor_gives_up() {
        let cluster = MemoryCluster::new();
        cluster.set_agreement_lag(10);
        cluster.delay_agreement();
        let session = cluster.session();
        let statement = Statement::Raw("CREATE TABLE t (a int PRIMARY KEY)".into());
        let err = AgreementPollingAdvisor::new(fast_schedule(3))
            .after_execute(&session, &statement, disagreeing())
            .unwrap_err();
        assert!(matches!(err, ExecutionFailure::AgreementTimeout { attempts: 3 }));
    }
}
