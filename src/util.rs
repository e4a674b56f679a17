use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_ERROR: &str = "Error";
pub const CONDITION_GENERATING: &str = "Generating";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

pub const REASON_RECONCILING: &str = "Reconciling";

/// Builds a condition stamped with the current time
pub fn new_condition(type_: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: None,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

pub fn find_status_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Adds or updates the condition of the same type, returning whether anything changed.
///
/// Same rules as apimachinery's `meta.SetStatusCondition`: the transition time only
/// moves when the status flips, reason and message are always refreshed.
pub fn set_status_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) else {
        conditions.push(new);
        return true;
    };

    let mut changed = false;
    if existing.status != new.status {
        existing.status = new.status;
        existing.last_transition_time = new.last_transition_time;
        changed = true;
    }
    if existing.reason != new.reason {
        existing.reason = new.reason;
        changed = true;
    }
    if existing.message != new.message {
        existing.message = new.message;
        changed = true;
    }
    if new.observed_generation.is_some() && existing.observed_generation != new.observed_generation {
        existing.observed_generation = new.observed_generation;
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a str> {
        find_status_condition(conditions, type_).map(|c| c.status.as_str())
    }

    #[test]
    fn adds_missing_condition() {
        let mut conditions = vec![];
        assert!(set_status_condition(
            &mut conditions,
            new_condition(CONDITION_AVAILABLE, STATUS_UNKNOWN, REASON_RECONCILING, "Starting reconciliation"),
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(status_of(&conditions, CONDITION_AVAILABLE), Some(STATUS_UNKNOWN));
    }

    #[test]
    fn updates_condition_in_place() {
        let mut conditions = vec![new_condition(
            CONDITION_AVAILABLE,
            STATUS_UNKNOWN,
            REASON_RECONCILING,
            "Starting reconciliation",
        )];
        let first_transition = conditions[0].last_transition_time.clone();

        assert!(set_status_condition(
            &mut conditions,
            new_condition(CONDITION_AVAILABLE, STATUS_TRUE, REASON_RECONCILING, "Config map exists"),
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(status_of(&conditions, CONDITION_AVAILABLE), Some(STATUS_TRUE));
        assert_eq!(conditions[0].message, "Config map exists");
        assert!(conditions[0].last_transition_time.0 >= first_transition.0);
    }

    #[test]
    fn keeps_transition_time_when_status_is_unchanged() {
        let mut conditions = vec![new_condition(CONDITION_ERROR, STATUS_TRUE, "Invalid", "old")];
        let mut update = new_condition(CONDITION_ERROR, STATUS_TRUE, "Invalid", "new");
        update.last_transition_time = Time(chrono::DateTime::from_timestamp(0, 0).unwrap());
        let original = conditions[0].last_transition_time.clone();

        assert!(set_status_condition(&mut conditions, update));
        assert_eq!(conditions[0].last_transition_time, original);
        assert_eq!(conditions[0].message, "new");
    }

    #[test]
    fn identical_condition_is_not_a_change() {
        let mut conditions = vec![new_condition(CONDITION_GENERATING, STATUS_TRUE, REASON_RECONCILING, "m")];
        assert!(!set_status_condition(
            &mut conditions,
            new_condition(CONDITION_GENERATING, STATUS_TRUE, REASON_RECONCILING, "m"),
        ));
        assert_eq!(status_of(&conditions, CONDITION_GENERATING), Some(STATUS_TRUE));
        assert_eq!(status_of(&conditions, CONDITION_ERROR), None);
    }
}
