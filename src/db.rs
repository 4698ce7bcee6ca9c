use std::collections::{BTreeMap, HashSet};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::hybrid::MasteryEngine;
use crate::models::{
    ClassAnalyticsSnapshot, ClassRecord, HistoryEntry, Observation, ProjectStatus,
    StudentAnalyticsSnapshot, StudentRecord,
};
use crate::projection::{self, ActivityEvent};
use crate::store::{Dashboard, HistoryAccessor, PersistenceSink, SnapshotStore};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, admin_shutdown, cannot_connect_now
                Some("40001" | "40P01" | "57P01" | "57P03") => {
                    StoreError::Unavailable(e.to_string())
                }
                _ => StoreError::Rejected(e.to_string()),
            },
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::RowNotFound => StoreError::Corrupt(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed store. Snapshot refreshes lock the owning student or
/// class row for the duration of the read-fold-upsert.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn student_snapshot_from_row(row: &PgRow) -> Result<StudentAnalyticsSnapshot, sqlx::Error> {
    let status: String = row.try_get("project_status")?;
    Ok(StudentAnalyticsSnapshot {
        student_id: row.try_get("student_id")?,
        class_id: row.try_get("class_id")?,
        mastery_avg: row.try_get("mastery_avg")?,
        engagement_avg: row.try_get("engagement_avg")?,
        engagement_events: row.try_get("engagement_events")?,
        project_status: ProjectStatus::parse(&status),
        project_updated_at: row.try_get("project_updated_at")?,
        total_responses: row.try_get("total_responses")?,
        timed_responses: row.try_get("timed_responses")?,
        avg_response_time: row.try_get("avg_response_time")?,
        last_activity: row.try_get("last_activity")?,
    })
}

fn class_snapshot_from_row(row: &PgRow) -> Result<ClassAnalyticsSnapshot, sqlx::Error> {
    Ok(ClassAnalyticsSnapshot {
        class_id: row.try_get("class_id")?,
        avg_mastery: row.try_get("avg_mastery")?,
        avg_engagement: row.try_get("avg_engagement")?,
        student_count: row.try_get("student_count")?,
        active_students: row.try_get("active_students")?,
        completed_projects: row.try_get("completed_projects")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const STUDENT_SNAPSHOT_COLUMNS: &str = "snap.student_id, snap.class_id, snap.mastery_avg, \
     snap.engagement_avg, snap.engagement_events, snap.project_status, snap.project_updated_at, \
     snap.total_responses, snap.timed_responses, snap.avg_response_time, snap.last_activity";

#[async_trait]
impl HistoryAccessor for PgStore {
    async fn get_history(
        &self,
        student_id: Uuid,
        concept_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT correct, response_time, mastery_score, occurred_at
            FROM (
                SELECT correct, response_time, mastery_score, occurred_at, recorded_at
                FROM classroom_analytics.observations
                WHERE student_id = $1 AND ($2::text IS NULL OR concept_id = $2)
                ORDER BY occurred_at DESC, recorded_at DESC
                LIMIT $3
            ) recent
            ORDER BY occurred_at ASC, recorded_at ASC
            "#,
        )
        .bind(student_id)
        .bind(concept_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            history.push(HistoryEntry {
                correct: row.try_get("correct")?,
                response_time: row.try_get("response_time")?,
                score: row.try_get("mastery_score")?,
                timestamp: row.try_get("occurred_at")?,
            });
        }
        Ok(history)
    }
}

#[async_trait]
impl PersistenceSink for PgStore {
    async fn record_mastery(
        &self,
        observation: &Observation,
        score: f64,
    ) -> Result<(), StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO classroom_analytics.observations
            (id, student_id, concept_id, correct, response_time, mastery_score, occurred_at, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(observation.student_id)
        .bind(observation.concept_id.as_deref())
        .bind(observation.correct)
        .bind(observation.response_time)
        .bind(score)
        .bind(observation.occurred_at)
        .bind(format!("response-{id}"))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_engagement(
        &self,
        student_id: Uuid,
        score: f64,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO classroom_analytics.engagement_events (id, student_id, score, occurred_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(score)
        .bind(occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn refresh_student(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<StudentAnalyticsSnapshot>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(student) = sqlx::query(
            "SELECT class_id FROM classroom_analytics.students WHERE id = $1 FOR UPDATE",
        )
        .bind(student_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let class_id: Option<Uuid> = student.try_get("class_id")?;

        let mut events = Vec::new();

        let observations = sqlx::query(
            r#"
            SELECT mastery_score, response_time
            FROM classroom_analytics.observations
            WHERE student_id = $1
            ORDER BY occurred_at ASC, recorded_at ASC
            "#,
        )
        .bind(student_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in observations {
            events.push(ActivityEvent::Mastery {
                score: row.try_get("mastery_score")?,
                response_time: row.try_get("response_time")?,
            });
        }

        let engagement = sqlx::query(
            r#"
            SELECT score
            FROM classroom_analytics.engagement_events
            WHERE student_id = $1
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(student_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in engagement {
            events.push(ActivityEvent::Engagement {
                score: row.try_get("score")?,
            });
        }

        let projects = sqlx::query(
            "SELECT status, updated_at FROM classroom_analytics.projects WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in projects {
            let status: String = row.try_get("status")?;
            events.push(ActivityEvent::Project {
                status: ProjectStatus::parse(&status),
                updated_at: row.try_get("updated_at")?,
            });
        }

        let snapshot = projection::project_student(student_id, class_id, &events, now);

        sqlx::query(
            r#"
            INSERT INTO classroom_analytics.student_analytics_snapshots
            (student_id, class_id, mastery_avg, engagement_avg, engagement_events, project_status,
             project_updated_at, total_responses, timed_responses, avg_response_time, last_activity)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (student_id) DO UPDATE
            SET class_id = EXCLUDED.class_id,
                mastery_avg = EXCLUDED.mastery_avg,
                engagement_avg = EXCLUDED.engagement_avg,
                engagement_events = EXCLUDED.engagement_events,
                project_status = EXCLUDED.project_status,
                project_updated_at = EXCLUDED.project_updated_at,
                total_responses = EXCLUDED.total_responses,
                timed_responses = EXCLUDED.timed_responses,
                avg_response_time = EXCLUDED.avg_response_time,
                last_activity = EXCLUDED.last_activity
            "#,
        )
        .bind(snapshot.student_id)
        .bind(snapshot.class_id)
        .bind(snapshot.mastery_avg)
        .bind(snapshot.engagement_avg)
        .bind(snapshot.engagement_events)
        .bind(snapshot.project_status.as_str())
        .bind(snapshot.project_updated_at)
        .bind(snapshot.total_responses)
        .bind(snapshot.timed_responses)
        .bind(snapshot.avg_response_time)
        .bind(snapshot.last_activity)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(snapshot))
    }

    async fn refresh_class(
        &self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT id FROM classroom_analytics.classes WHERE id = $1 FOR UPDATE")
            .bind(class_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let query = format!(
            "SELECT {STUDENT_SNAPSHOT_COLUMNS} \
             FROM classroom_analytics.student_analytics_snapshots snap \
             JOIN classroom_analytics.students s ON s.id = snap.student_id \
             WHERE s.class_id = $1"
        );
        let rows = sqlx::query(&query)
            .bind(class_id)
            .fetch_all(&mut *tx)
            .await?;
        let mut members = Vec::with_capacity(rows.len());
        for row in &rows {
            members.push(student_snapshot_from_row(row)?);
        }

        let completed: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS completed
            FROM classroom_analytics.projects p
            JOIN classroom_analytics.students s ON s.id = p.student_id
            WHERE s.class_id = $1 AND p.status = 'completed'
            "#,
        )
        .bind(class_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("completed")?;

        let snapshot = projection::project_class(class_id, &members, completed, now);

        sqlx::query(
            r#"
            INSERT INTO classroom_analytics.class_analytics_snapshots
            (class_id, avg_mastery, avg_engagement, student_count, active_students,
             completed_projects, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (class_id) DO UPDATE
            SET avg_mastery = EXCLUDED.avg_mastery,
                avg_engagement = EXCLUDED.avg_engagement,
                student_count = EXCLUDED.student_count,
                active_students = EXCLUDED.active_students,
                completed_projects = EXCLUDED.completed_projects,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(snapshot.class_id)
        .bind(snapshot.avg_mastery)
        .bind(snapshot.avg_engagement)
        .bind(snapshot.student_count)
        .bind(snapshot.active_students)
        .bind(snapshot.completed_projects)
        .bind(snapshot.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(snapshot))
    }

    async fn student_snapshot(
        &self,
        student_id: Uuid,
    ) -> Result<Option<StudentAnalyticsSnapshot>, StoreError> {
        let query = format!(
            "SELECT {STUDENT_SNAPSHOT_COLUMNS} \
             FROM classroom_analytics.student_analytics_snapshots snap \
             WHERE snap.student_id = $1"
        );
        let row = sqlx::query(&query)
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(student_snapshot_from_row).transpose()?)
    }

    async fn class_snapshot(
        &self,
        class_id: Uuid,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM classroom_analytics.class_analytics_snapshots WHERE class_id = $1",
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(class_snapshot_from_row).transpose()?)
    }

    async fn class_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT id FROM classroom_analytics.classes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }

    async fn student_ids(&self, class_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM classroom_analytics.students WHERE class_id = $1 ORDER BY full_name",
        )
        .bind(class_id)
        .fetch_all(&self.pool)
        .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }

    async fn dashboard(&self, class_id: Uuid) -> Result<Option<Dashboard>, StoreError> {
        let Some(class) = sqlx::query("SELECT id, name FROM classroom_analytics.classes WHERE id = $1")
            .bind(class_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let class = ClassRecord {
            id: class.try_get("id")?,
            name: class.try_get("name")?,
        };

        let snapshot = self.class_snapshot(class_id).await?;

        let query = format!(
            "SELECT s.id, s.full_name, s.email, s.class_id AS roster_class_id, \
             {STUDENT_SNAPSHOT_COLUMNS} \
             FROM classroom_analytics.student_analytics_snapshots snap \
             JOIN classroom_analytics.students s ON s.id = snap.student_id \
             WHERE s.class_id = $1 \
             ORDER BY s.full_name"
        );
        let rows = sqlx::query(&query)
            .bind(class_id)
            .fetch_all(&self.pool)
            .await?;

        let mut students = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = StudentRecord {
                id: row.try_get("id")?,
                full_name: row.try_get("full_name")?,
                email: row.try_get("email")?,
                class_id: row.try_get("roster_class_id")?,
            };
            students.push((record, student_snapshot_from_row(row)?));
        }

        Ok(Some(Dashboard {
            class,
            snapshot,
            students,
        }))
    }
}

pub async fn find_student_by_email(
    pool: &PgPool,
    email: &str,
) -> anyhow::Result<Option<StudentRecord>> {
    let row = sqlx::query(
        "SELECT id, full_name, email, class_id FROM classroom_analytics.students WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| StudentRecord {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        class_id: row.get("class_id"),
    }))
}

pub async fn find_class_by_name(pool: &PgPool, name: &str) -> anyhow::Result<Option<Uuid>> {
    let row = sqlx::query("SELECT id FROM classroom_analytics.classes WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| row.get("id")))
}

async fn upsert_class(pool: &PgPool, name: &str) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO classroom_analytics.classes (id, name)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_student(
    pool: &PgPool,
    id: Uuid,
    full_name: &str,
    email: &str,
    class_id: Option<Uuid>,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO classroom_analytics.students (id, full_name, email, class_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name, class_id = EXCLUDED.class_id
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(full_name)
    .bind(email)
    .bind(class_id)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Inserts an observation keyed by `source_key`. Returns `false` if it was
/// already present.
async fn insert_observation(
    pool: &PgPool,
    observation: &Observation,
    score: f64,
    source_key: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO classroom_analytics.observations
        (id, student_id, concept_id, correct, response_time, mastery_score, occurred_at, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(observation.student_id)
    .bind(observation.concept_id.as_deref())
    .bind(observation.correct)
    .bind(observation.response_time)
    .bind(score)
    .bind(observation.occurred_at)
    .bind(source_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Scores `observation` against the stored history, the same way a mastery
/// job does, and inserts it.
async fn score_and_insert(
    store: &PgStore,
    engine: &MasteryEngine,
    history_limit: usize,
    observation: &Observation,
    source_key: &str,
) -> anyhow::Result<bool> {
    let history = store
        .get_history(
            observation.student_id,
            observation.concept_id.as_deref(),
            history_limit,
        )
        .await?;
    let estimate = engine.estimate(&history, observation);
    insert_observation(&store.pool, observation, estimate.score(), source_key).await
}

pub async fn seed(pool: &PgPool, engine: &MasteryEngine, history_limit: usize) -> anyhow::Result<()> {
    let class_id = upsert_class(pool, "Period 2 Algebra").await?;

    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery Lee",
            "avery.lee@northfield.edu",
            0.85,
            ProjectStatus::Completed,
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules Moreno",
            "jules.moreno@northfield.edu",
            0.55,
            ProjectStatus::InProgress,
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara Patel",
            "kiara.patel@northfield.edu",
            0.3,
            ProjectStatus::NotStarted,
        ),
    ];

    let store = PgStore::new(pool.clone());
    let start = Utc
        .with_ymd_and_hms(2026, 2, 2, 14, 0, 0)
        .single()
        .context("invalid seed timestamp")?;

    for (id, name, email, accuracy, project_status) in students {
        let student_id = upsert_student(pool, id, name, email, Some(class_id)).await?;

        for i in 0..14u32 {
            // deterministic spread: the first `accuracy` share of every ten answers is correct
            let correct = f64::from(i % 10) < accuracy * 10.0;
            let observation = Observation {
                student_id,
                concept_id: Some("linear-equations".to_string()),
                correct,
                response_time: Some(18.0 + f64::from((i * 7) % 30)),
                occurred_at: start + Duration::hours(i64::from(i) * 6),
            };
            let source_key = format!("seed-{email}-{i:02}");
            score_and_insert(&store, engine, history_limit, &observation, &source_key).await?;
        }

        for (day, score) in [(0i64, 62.0), (3, 74.0), (6, 81.0)] {
            let engagement = accuracy * 100.0 * 0.5 + score * 0.5;
            sqlx::query(
                r#"
                INSERT INTO classroom_analytics.engagement_events (id, student_id, score, occurred_at)
                SELECT $1, $2, $3, $4
                WHERE NOT EXISTS (
                    SELECT 1 FROM classroom_analytics.engagement_events
                    WHERE student_id = $2 AND occurred_at = $4
                )
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(engagement)
            .bind(start + Duration::days(day))
            .execute(pool)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO classroom_analytics.projects (id, student_id, title, status, updated_at)
            SELECT $1, $2, $3, $4, $5
            WHERE NOT EXISTS (
                SELECT 1 FROM classroom_analytics.projects WHERE student_id = $2 AND title = $3
            )
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind("Bridge load model")
        .bind(project_status.as_str())
        .bind(start + Duration::days(5))
        .execute(pool)
        .await?;

        store.refresh_student(student_id, Utc::now()).await?;
    }

    store.refresh_class(class_id, Utc::now()).await?;
    Ok(())
}

/// Result of a CSV import.
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped: usize,
    pub students: Vec<Uuid>,
}

/// Imports observations from CSV. Rows are scored per student in time order;
/// rows whose `source_key` was already imported are skipped.
pub async fn import_csv(
    pool: &PgPool,
    engine: &MasteryEngine,
    history_limit: usize,
    csv_path: &std::path::Path,
) -> anyhow::Result<ImportSummary> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        full_name: String,
        email: String,
        class_name: Option<String>,
        concept_id: Option<String>,
        correct: bool,
        response_time: Option<f64>,
        occurred_at: DateTime<Utc>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut by_email: BTreeMap<String, Vec<CsvRow>> = BTreeMap::new();
    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        by_email.entry(row.email.clone()).or_default().push(row);
    }

    let store = PgStore::new(pool.clone());
    let mut summary = ImportSummary::default();
    let mut touched = HashSet::new();

    for (email, mut rows) in by_email {
        rows.sort_by_key(|row| row.occurred_at);
        let Some(first) = rows.first() else {
            continue;
        };

        let class_id = match first.class_name.as_deref() {
            Some(name) if !name.trim().is_empty() => Some(upsert_class(pool, name.trim()).await?),
            _ => None,
        };
        let student_id =
            upsert_student(pool, Uuid::new_v4(), &first.full_name, &email, class_id).await?;

        for row in rows {
            let observation = Observation {
                student_id,
                concept_id: row.concept_id.filter(|c| !c.is_empty()),
                correct: row.correct,
                response_time: row.response_time,
                occurred_at: row.occurred_at,
            };
            let source_key = row
                .source_key
                .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

            if score_and_insert(&store, engine, history_limit, &observation, &source_key).await? {
                summary.inserted += 1;
                touched.insert(student_id);
            } else {
                summary.skipped += 1;
            }
        }
    }

    summary.students = touched.into_iter().collect();
    Ok(summary)
}
