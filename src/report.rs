use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{ProjectStatus, StudentAnalyticsSnapshot};
use crate::store::Dashboard;

/// Students below this mastery are listed under "Needs Support".
pub const SUPPORT_THRESHOLD: f64 = 50.0;

fn status_counts(dashboard: &Dashboard) -> Vec<(ProjectStatus, usize)> {
    [
        ProjectStatus::NotStarted,
        ProjectStatus::InProgress,
        ProjectStatus::Submitted,
        ProjectStatus::Completed,
    ]
    .into_iter()
    .map(|status| {
        let count = dashboard
            .students
            .iter()
            .filter(|(_, snap)| snap.project_status == status)
            .count();
        (status, count)
    })
    .collect()
}

fn needs_support(dashboard: &Dashboard) -> Vec<(&str, &StudentAnalyticsSnapshot)> {
    let mut flagged: Vec<_> = dashboard
        .students
        .iter()
        .filter(|(_, snap)| snap.total_responses > 0 && snap.mastery_avg < SUPPORT_THRESHOLD)
        .map(|(record, snap)| (record.full_name.as_str(), snap))
        .collect();
    flagged.sort_by(|a, b| a.1.mastery_avg.total_cmp(&b.1.mastery_avg));
    flagged
}

/// Renders a class dashboard as markdown. Reads snapshot values only.
pub fn build_dashboard(dashboard: &Dashboard, generated_at: DateTime<Utc>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Class Dashboard: {}", dashboard.class.name);
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");

    match &dashboard.snapshot {
        Some(class) => {
            let _ = writeln!(output, "- Average mastery: {:.1}", class.avg_mastery);
            let _ = writeln!(output, "- Average engagement: {:.1}", class.avg_engagement);
            let _ = writeln!(
                output,
                "- Active students (24h): {} of {}",
                class.active_students, class.student_count
            );
            let _ = writeln!(output, "- Completed projects: {}", class.completed_projects);
            let _ = writeln!(
                output,
                "- Snapshot updated {}",
                class.updated_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
        None => {
            let _ = writeln!(output, "No class snapshot yet. Run `refresh` first.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students");

    if dashboard.students.is_empty() {
        let _ = writeln!(output, "No student snapshots recorded for this class.");
    } else {
        let _ = writeln!(
            output,
            "| Student | Mastery | Engagement | Responses | Avg response (s) | Project | Last activity |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for (record, snap) in &dashboard.students {
            let _ = writeln!(
                output,
                "| {} | {:.1} | {:.1} | {} | {:.1} | {} | {} |",
                record.full_name,
                snap.mastery_avg,
                snap.engagement_avg,
                snap.total_responses,
                snap.avg_response_time,
                snap.project_status,
                snap.last_activity.format("%Y-%m-%d")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Project Status");
    for (status, count) in status_counts(dashboard) {
        let _ = writeln!(output, "- {status}: {count}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Support");
    let flagged = needs_support(dashboard);
    if flagged.is_empty() {
        let _ = writeln!(output, "No students below {SUPPORT_THRESHOLD:.0} mastery.");
    } else {
        for (name, snap) in flagged {
            let _ = writeln!(
                output,
                "- {} (mastery {:.1} across {} responses)",
                name, snap.mastery_avg, snap.total_responses
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassAnalyticsSnapshot, ClassRecord, StudentRecord};
    use crate::projection;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn student(
        name: &str,
        class_id: Uuid,
        mastery: f64,
        status: ProjectStatus,
        now: DateTime<Utc>,
    ) -> (StudentRecord, StudentAnalyticsSnapshot) {
        let id = Uuid::new_v4();
        let mut snap = projection::empty_student(id, Some(class_id), now);
        snap.mastery_avg = mastery;
        snap.total_responses = 4;
        snap.project_status = status;
        let record = StudentRecord {
            id,
            full_name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase().replace(' ', ".")),
            class_id: Some(class_id),
        };
        (record, snap)
    }

    #[test]
    fn dashboard_lists_students_and_flags_low_mastery() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        let class_id = Uuid::new_v4();
        let dashboard = Dashboard {
            class: ClassRecord {
                id: class_id,
                name: "Period 2 Algebra".to_string(),
            },
            snapshot: Some(ClassAnalyticsSnapshot {
                class_id,
                avg_mastery: 61.0,
                avg_engagement: 72.5,
                student_count: 2,
                active_students: 1,
                completed_projects: 1,
                updated_at: now,
            }),
            students: vec![
                student("Avery Lee", class_id, 82.0, ProjectStatus::Completed, now),
                student("Kiara Patel", class_id, 40.0, ProjectStatus::NotStarted, now),
            ],
        };

        let report = build_dashboard(&dashboard, now);
        assert!(report.starts_with("# Class Dashboard: Period 2 Algebra"));
        assert!(report.contains("- Average mastery: 61.0"));
        assert!(report.contains("- Active students (24h): 1 of 2"));
        assert!(report.contains("| Avery Lee | 82.0 |"));
        assert!(report.contains("- completed: 1"));
        assert!(report.contains("- Kiara Patel (mastery 40.0 across 4 responses)"));
        assert!(!report.contains("- Avery Lee (mastery"));
    }

    #[test]
    fn dashboard_without_snapshots_says_so() {
        let class_id = Uuid::new_v4();
        let dashboard = Dashboard {
            class: ClassRecord {
                id: class_id,
                name: "Chemistry".to_string(),
            },
            snapshot: None,
            students: Vec::new(),
        };

        let report = build_dashboard(&dashboard, Utc::now());
        assert!(report.contains("No class snapshot yet"));
        assert!(report.contains("No student snapshots recorded"));
        assert!(report.contains("No students below 50 mastery."));
    }
}
