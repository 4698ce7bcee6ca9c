use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// One graded interaction. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub student_id: Uuid,
    pub concept_id: Option<String>,
    pub correct: bool,
    /// Seconds taken to answer, when the client reported it.
    pub response_time: Option<f64>,
    pub occurred_at: DateTime<Utc>,
}

/// A past observation as read back for estimation, most-recent-last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub correct: bool,
    pub response_time: Option<f64>,
    /// Mastery score recorded alongside the observation.
    pub score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_observation(observation: &Observation, score: Option<f64>) -> Self {
        Self {
            correct: observation.correct,
            response_time: observation.response_time,
            score,
            timestamp: observation.occurred_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    Bkt,
    Hybrid,
    Fallback,
}

impl std::fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EstimationMethod::Bkt => "bkt",
            EstimationMethod::Hybrid => "hybrid",
            EstimationMethod::Fallback => "fallback",
        };
        f.write_str(label)
    }
}

/// Output of one estimation run. `score` is in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryEstimate {
    pub student_id: Uuid,
    pub score: f64,
    pub method: EstimationMethod,
    pub bkt: Option<f64>,
    pub dkt: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    NotStarted,
    InProgress,
    Submitted,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::NotStarted => "not_started",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Submitted => "submitted",
            ProjectStatus::Completed => "completed",
        }
    }

    /// Unknown labels read as `NotStarted`.
    pub fn parse(value: &str) -> Self {
        match value {
            "in_progress" => ProjectStatus::InProgress,
            "submitted" => ProjectStatus::Submitted,
            "completed" => ProjectStatus::Completed,
            _ => ProjectStatus::NotStarted,
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materialized per-student aggregates. Written only by the snapshot updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentAnalyticsSnapshot {
    pub student_id: Uuid,
    pub class_id: Option<Uuid>,
    pub mastery_avg: f64,
    pub engagement_avg: f64,
    pub engagement_events: i64,
    pub project_status: ProjectStatus,
    pub project_updated_at: Option<DateTime<Utc>>,
    pub total_responses: i64,
    pub timed_responses: i64,
    pub avg_response_time: f64,
    pub last_activity: DateTime<Utc>,
}

/// Materialized per-class aggregates folded from member student snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAnalyticsSnapshot {
    pub class_id: Uuid,
    pub avg_mastery: f64,
    pub avg_engagement: f64,
    pub student_count: i64,
    pub active_students: i64,
    pub completed_projects: i64,
    pub updated_at: DateTime<Utc>,
}

/// Payload accepted by the mastery-update queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub concept_id: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub correct: bool,
    #[serde(default)]
    pub response_time: Option<f64>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl ResponsePayload {
    pub fn into_observation(self, student_id: Uuid) -> Observation {
        Observation {
            student_id,
            concept_id: self.concept_id,
            correct: self.correct,
            response_time: self.response_time,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Payload accepted by the engagement-update queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementPayload {
    pub score: f64,
}

/// Anything other than a literal `true` counts as incorrect.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(matches!(value, serde_json::Value::Bool(true)))
}

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub class_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ClassRecord {
    pub id: Uuid,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_boolean_correctness_reads_as_incorrect() {
        let payload: ResponsePayload =
            serde_json::from_value(json!({ "correct": "yes", "response_time": 12.0 })).unwrap();
        assert!(!payload.correct);

        let payload: ResponsePayload = serde_json::from_value(json!({ "correct": true })).unwrap();
        assert!(payload.correct);
    }

    #[test]
    fn missing_correctness_is_rejected() {
        let result = serde_json::from_value::<ResponsePayload>(json!({ "response_time": 3.0 }));
        assert!(result.is_err());
    }

    #[test]
    fn project_status_round_trips_labels() {
        for status in [
            ProjectStatus::NotStarted,
            ProjectStatus::InProgress,
            ProjectStatus::Submitted,
            ProjectStatus::Completed,
        ] {
            assert_eq!(ProjectStatus::parse(status.as_str()), status);
        }
        assert_eq!(ProjectStatus::parse("archived"), ProjectStatus::NotStarted);
    }
}
