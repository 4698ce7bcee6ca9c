//! Pure projections from raw activity to analytics snapshots.
//!
//! A student snapshot is a left fold of [`ActivityEvent`]s. Applying one more
//! event to a stored snapshot gives the same result as refolding the whole log,
//! so stores may recompute in full or incrementally.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{ClassAnalyticsSnapshot, ProjectStatus, StudentAnalyticsSnapshot};

/// Window for counting a student as active.
pub const ACTIVE_WINDOW_HOURS: i64 = 24;

/// One raw row feeding a student snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    Mastery {
        score: f64,
        response_time: Option<f64>,
    },
    Engagement {
        score: Option<f64>,
    },
    Project {
        status: ProjectStatus,
        updated_at: DateTime<Utc>,
    },
}

fn running_mean(mean: f64, count: i64, value: f64) -> f64 {
    mean + (value - mean) / count as f64
}

/// Snapshot of a student with no recorded activity.
pub fn empty_student(
    student_id: Uuid,
    class_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> StudentAnalyticsSnapshot {
    StudentAnalyticsSnapshot {
        student_id,
        class_id,
        mastery_avg: 0.0,
        engagement_avg: 0.0,
        engagement_events: 0,
        project_status: ProjectStatus::NotStarted,
        project_updated_at: None,
        total_responses: 0,
        timed_responses: 0,
        avg_response_time: 0.0,
        last_activity: now,
    }
}

/// Folds one event into `snapshot` and stamps `last_activity` with `now`.
pub fn apply(snapshot: &mut StudentAnalyticsSnapshot, event: &ActivityEvent, now: DateTime<Utc>) {
    match event {
        ActivityEvent::Mastery {
            score,
            response_time,
        } => {
            snapshot.total_responses += 1;
            snapshot.mastery_avg =
                running_mean(snapshot.mastery_avg, snapshot.total_responses, *score);
            if let Some(seconds) = response_time {
                snapshot.timed_responses += 1;
                snapshot.avg_response_time = running_mean(
                    snapshot.avg_response_time,
                    snapshot.timed_responses,
                    *seconds,
                );
            }
        }
        ActivityEvent::Engagement { score } => {
            // events without a score do not count toward the average
            if let Some(score) = score {
                snapshot.engagement_events += 1;
                snapshot.engagement_avg =
                    running_mean(snapshot.engagement_avg, snapshot.engagement_events, *score);
            }
        }
        ActivityEvent::Project { status, updated_at } => {
            let newer = snapshot
                .project_updated_at
                .map_or(true, |current| *updated_at >= current);
            if newer {
                snapshot.project_status = *status;
                snapshot.project_updated_at = Some(*updated_at);
            }
        }
    }
    snapshot.last_activity = now;
}

/// Full recompute of a student snapshot from the raw activity log.
pub fn project_student<'a, I>(
    student_id: Uuid,
    class_id: Option<Uuid>,
    events: I,
    now: DateTime<Utc>,
) -> StudentAnalyticsSnapshot
where
    I: IntoIterator<Item = &'a ActivityEvent>,
{
    let mut snapshot = empty_student(student_id, class_id, now);
    for event in events {
        apply(&mut snapshot, event, now);
    }
    snapshot
}

/// Folds committed member snapshots into the class snapshot.
///
/// `completed_projects` is the number of completed project rows owned by
/// class members.
pub fn project_class(
    class_id: Uuid,
    members: &[StudentAnalyticsSnapshot],
    completed_projects: i64,
    now: DateTime<Utc>,
) -> ClassAnalyticsSnapshot {
    let mut seen = HashSet::new();
    let mut mastery_total = 0.0;
    let mut engagement_total = 0.0;
    let mut active = 0i64;
    let active_since = now - Duration::hours(ACTIVE_WINDOW_HOURS);

    for member in members {
        if !seen.insert(member.student_id) {
            continue;
        }
        mastery_total += member.mastery_avg;
        engagement_total += member.engagement_avg;
        if member.last_activity >= active_since {
            active += 1;
        }
    }

    let count = seen.len() as i64;
    let average = |total: f64| if count == 0 { 0.0 } else { total / count as f64 };

    ClassAnalyticsSnapshot {
        class_id,
        avg_mastery: average(mastery_total),
        avg_engagement: average(engagement_total),
        student_count: count,
        active_students: active,
        completed_projects,
        updated_at: now,
    }
}
