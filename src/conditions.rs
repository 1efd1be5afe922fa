//! Typed condition bookkeeping shared by all controllers.
//!
//! Worker status is mid-transition between two condition schemas: the
//! `Available`/`Progressing`/`Degraded` triad and the legacy
//! `Ready`/`Working` pair. Writers emit both; the readers here prefer the
//! triad and consult the legacy pair only when the triad is absent, with a
//! reason guard so an unrelated `Ready` is not miscounted as success.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const TYPE_READY: &str = "Ready";
pub const TYPE_WORKING: &str = "Working";
pub const TYPE_AVAILABLE: &str = "Available";
pub const TYPE_PROGRESSING: &str = "Progressing";
pub const TYPE_DEGRADED: &str = "Degraded";
pub const TYPE_MERGED: &str = "Merged";
pub const TYPE_COMPLETE: &str = "Complete";

pub const REASON_POD_SUCCEEDED: &str = "PodSucceeded";

pub fn new_condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_owned(),
        status: if status { "True" } else { "False" }.to_owned(),
        reason: reason.to_owned(),
        message: message.to_owned(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Upsert keyed by condition type. The list never holds two entries of the
/// same type, and `lastTransitionTime` only moves when the status value
/// actually flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).map(|c| c.status == "True").unwrap_or(false)
}

/// True when the worker finished successfully and its branch is merge-ready.
pub fn work_complete(conditions: &[Condition]) -> bool {
    match get_condition(conditions, TYPE_AVAILABLE) {
        Some(c) => c.status == "True",
        None => get_condition(conditions, TYPE_READY)
            .map(|c| c.status == "True" && c.reason == REASON_POD_SUCCEEDED)
            .unwrap_or(false),
    }
}

/// The in-progress condition, if the worker is currently progressing.
/// Returns the condition itself so callers can inspect the transition time.
pub fn work_in_progress(conditions: &[Condition]) -> Option<&Condition> {
    match get_condition(conditions, TYPE_PROGRESSING) {
        Some(c) => (c.status == "True").then_some(c),
        None => get_condition(conditions, TYPE_WORKING).filter(|c| c.status == "True"),
    }
}

pub fn work_degraded(conditions: &[Condition]) -> bool {
    is_condition_true(conditions, TYPE_DEGRADED)
}

/// Stuck means progressing with no condition transition for strictly
/// longer than the threshold. An age exactly at the threshold is not stuck.
pub fn stuck_since(condition: &Condition, threshold: std::time::Duration, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(condition.last_transition_time.0);
    match chrono::Duration::from_std(threshold) {
        Ok(limit) => age > limit,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn cond(type_: &str, status: bool, reason: &str) -> Condition {
        new_condition(type_, status, reason, "", Some(1))
    }

    #[test]
    fn set_condition_deduplicates_by_type() {
        let mut conds = vec![];
        set_condition(&mut conds, cond(TYPE_READY, true, "AllGood"));
        set_condition(&mut conds, cond(TYPE_READY, false, "IssuesDetected"));
        set_condition(&mut conds, cond(TYPE_DEGRADED, false, "Healthy"));
        assert_eq!(conds.len(), 2);
        assert_eq!(get_condition(&conds, TYPE_READY).unwrap().status, "False");
    }

    #[test]
    fn unchanged_status_preserves_transition_time() {
        let mut conds = vec![];
        let mut first = cond(TYPE_PROGRESSING, true, "PodRunning");
        first.last_transition_time = Time(Utc::now() - ChronoDuration::minutes(20));
        let original = first.last_transition_time.clone();
        set_condition(&mut conds, first);
        set_condition(&mut conds, cond(TYPE_PROGRESSING, true, "PodRunning"));
        assert_eq!(
            get_condition(&conds, TYPE_PROGRESSING).unwrap().last_transition_time,
            original
        );

        set_condition(&mut conds, cond(TYPE_PROGRESSING, false, "PodSucceeded"));
        assert_ne!(
            get_condition(&conds, TYPE_PROGRESSING).unwrap().last_transition_time,
            original
        );
    }

    #[test]
    fn triad_wins_over_legacy() {
        // Available=False with a stale legacy Ready=True must not count as done
        let mut conds = vec![];
        set_condition(&mut conds, cond(TYPE_AVAILABLE, false, "PodRunning"));
        set_condition(&mut conds, cond(TYPE_READY, true, REASON_POD_SUCCEEDED));
        assert!(!work_complete(&conds));
    }

    #[test]
    fn legacy_fallback_needs_reason_guard() {
        let conds = vec![cond(TYPE_READY, true, "Provisioned")];
        assert!(!work_complete(&conds));
        let conds = vec![cond(TYPE_READY, true, REASON_POD_SUCCEEDED)];
        assert!(work_complete(&conds));
    }

    #[test]
    fn progressing_falls_back_to_working() {
        let conds = vec![cond(TYPE_WORKING, true, "PodRunning")];
        assert!(work_in_progress(&conds).is_some());
        let conds = vec![
            cond(TYPE_PROGRESSING, false, "PodSucceeded"),
            cond(TYPE_WORKING, true, "PodRunning"),
        ];
        // triad present, so the stale legacy entry is ignored
        assert!(work_in_progress(&conds).is_none());
    }

    #[test]
    fn stuck_boundary_is_strict() {
        let now = Utc::now();
        let threshold = Duration::from_secs(15 * 60);
        let mut c = cond(TYPE_PROGRESSING, true, "PodRunning");

        c.last_transition_time = Time(now - ChronoDuration::minutes(15));
        assert!(!stuck_since(&c, threshold, now), "exactly at threshold is not stuck");

        c.last_transition_time = Time(now - ChronoDuration::minutes(15) - ChronoDuration::nanoseconds(1));
        assert!(stuck_since(&c, threshold, now), "older than threshold is stuck");
    }
}
