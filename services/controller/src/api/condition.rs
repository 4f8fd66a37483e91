//! Status conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";
pub const HEALTHY: &str = "Healthy";
pub const STALLED: &str = "Stalled";

/// Machine-readable condition reasons.
pub mod reason {
    pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
    pub const PROGRESSING: &str = "Progressing";
    pub const ARTIFACT_FAILED: &str = "ArtifactFailed";
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    pub const BUILD_FAILED: &str = "BuildFailed";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const APPLY_FAILED: &str = "ApplyFailed";
    pub const PRUNE_FAILED: &str = "PruneFailed";
    pub const HEALTH_CHECK_FAILED: &str = "HealthCheckFailed";
    pub const RECONCILIATION_TIMEOUT: &str = "ReconciliationTimeout";
    pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    pub last_transition_time: DateTime<Utc>,
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Insert or update a condition.
///
/// `lastTransitionTime` only moves when the status flips.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: Utc::now(),
        }),
    }
}

pub fn remove(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set(&mut conditions, READY, ConditionStatus::False, reason::BUILD_FAILED, "a");
        let first = conditions[0].last_transition_time;

        set(&mut conditions, READY, ConditionStatus::False, reason::APPLY_FAILED, "b");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].reason, reason::APPLY_FAILED);

        set(&mut conditions, READY, ConditionStatus::True, reason::RECONCILIATION_SUCCEEDED, "ok");
        assert!(is_true(&conditions, READY));
        assert!(conditions[0].last_transition_time >= first);
    }

    #[test]
    fn test_condition_wire_format() {
        let mut conditions = Vec::new();
        set(&mut conditions, STALLED, ConditionStatus::True, reason::RETRIES_EXHAUSTED, "x");
        let value = serde_json::to_value(&conditions[0]).unwrap();
        assert_eq!(value["type"], "Stalled");
        assert_eq!(value["status"], "True");
        assert!(value.get("lastTransitionTime").is_some());

        remove(&mut conditions, STALLED);
        assert!(conditions.is_empty());
    }
}
