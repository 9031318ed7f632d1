//! Assessment lifecycle: `not_started -> in_progress -> {completed, expired}`.
//!
//! Transitions are pure functions on an [`Assessment`]; persisting the outcome
//! is the caller's job. Expiry is detected lazily when a submission is
//! attempted, never by a timer.

use chrono::{DateTime, Duration, Utc};

use crate::error::EngineError;
use crate::models::{Assessment, AssessmentStatus};

/// Moves a fresh assessment to `in_progress`, fixing its deadline.
///
/// A second start is rejected and leaves `started_at` untouched.
pub fn start(assessment: &mut Assessment, now: DateTime<Utc>) -> Result<(), EngineError> {
    if assessment.status != AssessmentStatus::NotStarted {
        return Err(EngineError::AlreadyStarted);
    }
    assessment.status = AssessmentStatus::InProgress;
    assessment.started_at = Some(now);
    assessment.expires_at = Some(now + Duration::minutes(i64::from(assessment.duration_minutes)));
    Ok(())
}

#[derive(Debug)]
pub enum Gate {
    /// Submission may proceed
    Open,
    /// The deadline passed; the assessment was moved to `expired` and must be persisted
    Expired,
    /// Submission is refused and nothing changed
    Closed(EngineError),
}

/// Decides whether a submission is accepted at `now`.
///
/// Only the `in_progress -> expired` edge mutates the assessment, so calling
/// this on an already expired assessment never rewrites it.
pub fn admit_submission(assessment: &mut Assessment, now: DateTime<Utc>) -> Gate {
    if assessment.status != AssessmentStatus::InProgress {
        return Gate::Closed(EngineError::NotActive);
    }
    if is_past_deadline(assessment, now) {
        assessment.status = AssessmentStatus::Expired;
        return Gate::Expired;
    }
    Gate::Open
}

pub fn is_past_deadline(assessment: &Assessment, now: DateTime<Utc>) -> bool {
    assessment.expires_at.is_some_and(|deadline| now > deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment() -> Assessment {
        Assessment {
            id: 1,
            title: "Backend".into(),
            description: String::new(),
            duration_minutes: 90,
            candidate_id: "cand-1".into(),
            status: AssessmentStatus::NotStarted,
            started_at: None,
            expires_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_start_sets_deadline_once() {
        let mut a = assessment();
        let t0 = Utc::now();
        start(&mut a, t0).unwrap();
        assert_eq!(a.status, AssessmentStatus::InProgress);
        assert_eq!(a.started_at, Some(t0));
        assert_eq!(a.expires_at, Some(t0 + Duration::minutes(90)));

        let err = start(&mut a, t0 + Duration::minutes(5)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyStarted));
        assert_eq!(a.started_at, Some(t0));
    }

    #[test]
    fn test_submission_gate() {
        let mut a = assessment();
        let t0 = Utc::now();
        assert!(matches!(
            admit_submission(&mut a, t0),
            Gate::Closed(EngineError::NotActive)
        ));

        start(&mut a, t0).unwrap();
        assert!(matches!(admit_submission(&mut a, t0 + Duration::minutes(89)), Gate::Open));

        // Exactly at the deadline is still allowed
        assert!(matches!(admit_submission(&mut a, t0 + Duration::minutes(90)), Gate::Open));

        assert!(matches!(admit_submission(&mut a, t0 + Duration::minutes(91)), Gate::Expired));
        assert_eq!(a.status, AssessmentStatus::Expired);

        // Already expired: refused without another transition
        assert!(matches!(
            admit_submission(&mut a, t0 + Duration::minutes(92)),
            Gate::Closed(EngineError::NotActive)
        ));
    }

    #[test]
    fn test_completed_assessment_is_closed() {
        let mut a = assessment();
        a.status = AssessmentStatus::Completed;
        assert!(matches!(
            admit_submission(&mut a, Utc::now()),
            Gate::Closed(EngineError::NotActive)
        ));
        assert!(matches!(start(&mut a, Utc::now()), Err(EngineError::AlreadyStarted)));
    }
}
