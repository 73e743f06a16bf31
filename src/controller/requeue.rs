//! Requeue decision for a reconciliation pass.
//!
//! Pure: given the conditions still pending after a pass, pick the earliest
//! re-check time, bounded below so a burst of conditions can never turn into
//! a busy loop. A pass with no pending conditions settles and waits for the
//! next external event. In particular, a successful create of a dependent
//! that has no readiness of its own never schedules a requeue by itself.

use std::time::Duration;

/// Floor for any scheduled delay.
pub const MIN_DELAY: Duration = Duration::from_secs(5);

/// Delay while a write conflict cools off; a retry picks up the new version.
pub const CONFLICT_DELAY: Duration = Duration::from_secs(5);

/// Delay while the workload is rolling out.
pub const WORKLOAD_DELAY: Duration = Duration::from_secs(30);

/// Delay while infrastructure is being provisioned.
pub const INFRA_DELAY: Duration = Duration::from_secs(30);

/// Delay while a referenced configuration source is missing.
pub const CONFIG_SOURCE_DELAY: Duration = Duration::from_secs(60);

/// A reason the pass could not settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCondition {
    /// The workload deployment reports no ready replicas yet.
    WorkloadNotReady,
    /// A mandatory infrastructure subsystem is not provisioned.
    InfraNotProvisioned(String),
    /// A referenced external properties bundle does not exist yet.
    ConfigSourceMissing(String),
    /// An optimistic-concurrency write lost a race.
    WriteConflict,
}

impl PendingCondition {
    /// Suggested delay before re-checking this condition.
    pub fn suggested_delay(&self) -> Duration {
        match self {
            PendingCondition::WorkloadNotReady => WORKLOAD_DELAY,
            PendingCondition::InfraNotProvisioned(_) => INFRA_DELAY,
            PendingCondition::ConfigSourceMissing(_) => CONFIG_SOURCE_DELAY,
            PendingCondition::WriteConflict => CONFLICT_DELAY,
        }
    }

    /// One-line operator-facing description.
    pub fn describe(&self) -> String {
        match self {
            PendingCondition::WorkloadNotReady => "waiting for workload to become ready".into(),
            PendingCondition::InfraNotProvisioned(what) => {
                format!("waiting for infrastructure: {what}")
            }
            PendingCondition::ConfigSourceMissing(name) => {
                format!("referenced properties ConfigMap '{name}' not found")
            }
            PendingCondition::WriteConflict => "write conflict, retrying".into(),
        }
    }
}

/// Earliest re-check time over all pending conditions, or `None` to settle.
pub fn schedule(pending: &[PendingCondition]) -> Option<Duration> {
    pending
        .iter()
        .map(PendingCondition::suggested_delay)
        .min()
        .map(|delay| delay.max(MIN_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_with_nothing_pending() {
        assert_eq!(schedule(&[]), None);
    }

    #[test]
    fn picks_minimum_delay() {
        let pending = vec![
            PendingCondition::WorkloadNotReady,
            PendingCondition::WriteConflict,
            PendingCondition::ConfigSourceMissing("props".into()),
        ];
        assert_eq!(schedule(&pending), Some(CONFLICT_DELAY));
    }

    #[test]
    fn clamps_below_to_floor() {
        // All built-in delays already sit at or above the floor; the clamp
        // guards future condition kinds with sub-floor suggestions.
        let delay = schedule(&[PendingCondition::WriteConflict]).unwrap();
        assert!(delay >= MIN_DELAY);
    }
}
