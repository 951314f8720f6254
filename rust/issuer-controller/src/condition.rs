//! Status conditions shared by the issuer resources and cert-manager `CertificateRequest`s

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time,
    schemars::{self, JsonSchema},
};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_APPROVED: &str = "Approved";
pub const CONDITION_DENIED: &str = "Denied";

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition, known values are `Ready`, `Approved` and `Denied`.
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// Machine readable, CamelCase explanation for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable description of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The last time `status` changed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    /// Whether moving from `old` to `self` is a state transition worth announcing.
    ///
    /// Only the status and reason count, a new message for the same state is not a transition.
    pub fn transitions_from(&self, old: Option<&Condition>) -> bool {
        old.map_or(true, |old| old.status != self.status || old.reason != self.reason)
    }
}

/// Implemented by status objects that carry a list of [`Condition`]s.
///
/// At most one condition of each type is kept, [`HasConditions::set_condition`] updates it in place.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|cond| cond.type_ == type_)
    }

    fn has_condition(&self, type_: &str, status: ConditionStatus) -> bool {
        self.condition(type_).is_some_and(|cond| cond.status == status)
    }

    /// Sets the condition `type_`, adding it if it doesn't exist yet.
    ///
    /// `last_transition_time` is only moved to `now` if `status` differs from the stored status,
    /// `reason` and `message` are always overwritten.
    fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: &Time,
    ) {
        let conditions = self.conditions_mut();
        let idx = match conditions.iter().position(|cond| cond.type_ == type_) {
            Some(idx) => idx,
            None => {
                conditions.push(Condition {
                    type_: type_.to_string(),
                    status,
                    reason: None,
                    message: None,
                    last_transition_time: Some(now.clone()),
                });
                conditions.len() - 1
            }
        };
        let cond = &mut conditions[idx];
        if cond.status != status {
            cond.status = status;
            cond.last_transition_time = Some(now.clone());
        }
        cond.reason = Some(reason.into());
        cond.message = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::k8s_openapi::{
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::{TimeZone, Utc},
    };

    use super::{Condition, ConditionStatus, HasConditions, CONDITION_APPROVED, CONDITION_READY};

    #[derive(Default)]
    struct Status {
        conditions: Vec<Condition>,
    }

    impl HasConditions for Status {
        fn conditions(&self) -> &[Condition] {
            &self.conditions
        }

        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }
    }

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap())
    }

    #[test]
    fn set_adds_missing_condition() {
        let mut status = Status::default();
        status.set_condition(
            CONDITION_READY,
            ConditionStatus::True,
            "reason1",
            "message1",
            &at(0),
        );
        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason.as_deref(), Some("reason1"));
        assert_eq!(ready.message.as_deref(), Some("message1"));
        assert_eq!(ready.last_transition_time, Some(at(0)));
        assert!(status.condition(CONDITION_APPROVED).is_none());
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut status = Status::default();
        status.set_condition(CONDITION_READY, ConditionStatus::False, "a", "first", &at(0));
        status.set_condition(CONDITION_READY, ConditionStatus::False, "b", "second", &at(10));
        status.set_condition(CONDITION_READY, ConditionStatus::False, "c", "third", &at(20));

        let ready = status.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some("c"));
        assert_eq!(ready.message.as_deref(), Some("third"));
        assert_eq!(ready.last_transition_time, Some(at(0)));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn changed_status_moves_transition_time() {
        let mut status = Status::default();
        status.set_condition(CONDITION_READY, ConditionStatus::Unknown, "a", "", &at(0));
        status.set_condition(CONDITION_READY, ConditionStatus::True, "a", "", &at(30));
        assert_eq!(
            status.condition(CONDITION_READY).unwrap().last_transition_time,
            Some(at(30))
        );
        assert!(status.has_condition(CONDITION_READY, ConditionStatus::True));
        assert!(!status.has_condition(CONDITION_READY, ConditionStatus::False));
    }

    #[test]
    fn only_status_and_reason_changes_are_transitions() {
        let mut status = Status::default();
        status.set_condition(CONDITION_READY, ConditionStatus::False, "Pending", "a", &at(0));
        let pending = status.condition(CONDITION_READY).unwrap().clone();
        assert!(pending.transitions_from(None));

        status.set_condition(CONDITION_READY, ConditionStatus::False, "Pending", "b", &at(5));
        let new_message = status.condition(CONDITION_READY).unwrap().clone();
        assert!(!new_message.transitions_from(Some(&pending)));

        status.set_condition(CONDITION_READY, ConditionStatus::False, "Failed", "b", &at(10));
        assert!(status
            .condition(CONDITION_READY)
            .unwrap()
            .transitions_from(Some(&new_message)));

        status.set_condition(CONDITION_READY, ConditionStatus::True, "Failed", "b", &at(15));
        assert!(status
            .condition(CONDITION_READY)
            .unwrap()
            .transitions_from(Some(&new_message)));
    }

    #[test]
    fn other_conditions_are_left_alone() {
        let mut status = Status::default();
        status.set_condition(CONDITION_APPROVED, ConditionStatus::True, "x", "y", &at(0));
        status.set_condition(CONDITION_READY, ConditionStatus::False, "a", "b", &at(5));
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(
            status.condition(CONDITION_APPROVED).unwrap().last_transition_time,
            Some(at(0))
        );
    }
}
