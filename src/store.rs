//! Persistence interfaces the engine depends on, plus an in-process store.
//!
//! [`MemoryStore`] keeps everything behind one mutex, so each refresh is
//! trivially atomic. It can be switched to "unreachable" to exercise the
//! dispatcher's retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    ClassAnalyticsSnapshot, ClassRecord, HistoryEntry, Observation, ProjectStatus,
    StudentAnalyticsSnapshot, StudentRecord,
};
use crate::projection::{self, ActivityEvent};

/// Read access to a student's graded history.
#[async_trait]
pub trait HistoryAccessor: Send + Sync {
    /// At most `limit` entries, most-recent-last, optionally for one concept.
    async fn get_history(
        &self,
        student_id: Uuid,
        concept_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Append-only writes feeding the snapshot updater.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record_mastery(&self, observation: &Observation, score: f64)
        -> Result<(), StoreError>;

    async fn record_engagement(
        &self,
        student_id: Uuid,
        score: f64,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Everything a class dashboard needs, read from snapshot rows.
#[derive(Debug, Clone)]
pub struct Dashboard {
    pub class: ClassRecord,
    pub snapshot: Option<ClassAnalyticsSnapshot>,
    pub students: Vec<(StudentRecord, StudentAnalyticsSnapshot)>,
}

/// Materialized analytics rows.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Recomputes and upserts one student's snapshot from raw rows in a single
    /// transaction. `None` if the student does not exist.
    async fn refresh_student(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<StudentAnalyticsSnapshot>, StoreError>;

    /// Recomputes and upserts a class snapshot from committed student
    /// snapshots. `None` if the class does not exist.
    async fn refresh_class(
        &self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError>;

    async fn student_snapshot(
        &self,
        student_id: Uuid,
    ) -> Result<Option<StudentAnalyticsSnapshot>, StoreError>;

    async fn class_snapshot(
        &self,
        class_id: Uuid,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError>;

    async fn class_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn student_ids(&self, class_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    async fn dashboard(&self, class_id: Uuid) -> Result<Option<Dashboard>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    classes: HashMap<Uuid, ClassRecord>,
    students: HashMap<Uuid, StudentRecord>,
    observations: Vec<(Observation, f64)>,
    engagement: Vec<(Uuid, Option<f64>, DateTime<Utc>)>,
    projects: Vec<(Uuid, ProjectStatus, DateTime<Utc>)>,
    student_snapshots: HashMap<Uuid, StudentAnalyticsSnapshot>,
    class_snapshots: HashMap<Uuid, ClassAnalyticsSnapshot>,
}

impl MemoryState {
    fn events_for(&self, student_id: Uuid) -> Vec<ActivityEvent> {
        let mastery = self
            .observations
            .iter()
            .filter(|(obs, _)| obs.student_id == student_id)
            .map(|(obs, score)| ActivityEvent::Mastery {
                score: *score,
                response_time: obs.response_time,
            });
        let engagement = self
            .engagement
            .iter()
            .filter(|(id, _, _)| *id == student_id)
            .map(|(_, score, _)| ActivityEvent::Engagement { score: *score });
        let projects = self
            .projects
            .iter()
            .filter(|(id, _, _)| *id == student_id)
            .map(|(_, status, updated_at)| ActivityEvent::Project {
                status: *status,
                updated_at: *updated_at,
            });
        mastery.chain(engagement).chain(projects).collect()
    }

    fn members(&self, class_id: Uuid) -> Vec<&StudentRecord> {
        let mut members: Vec<&StudentRecord> = self
            .students
            .values()
            .filter(|s| s.class_id == Some(class_id))
            .collect();
        members.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        members
    }
}

/// In-process store used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    reads_down: AtomicBool,
    writes_down: AtomicBool,
    failing_writes: AtomicU32,
    sink_calls: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, down: bool) {
        self.reads_down.store(down, Ordering::SeqCst);
        self.writes_down.store(down, Ordering::SeqCst);
    }

    /// Makes only the append-only sink unreachable.
    pub fn set_sink_unavailable(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    /// Fails the next `count` sink writes, then recovers.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of sink writes attempted, failed or not.
    pub fn sink_calls(&self) -> u32 {
        self.sink_calls.load(Ordering::SeqCst)
    }

    pub fn add_class(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().classes.insert(
            id,
            ClassRecord {
                id,
                name: name.to_string(),
            },
        );
        id
    }

    pub fn add_student(&self, full_name: &str, email: &str, class_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().students.insert(
            id,
            StudentRecord {
                id,
                full_name: full_name.to_string(),
                email: email.to_string(),
                class_id,
            },
        );
        id
    }

    /// Reassigns a student on the roster. Snapshots are left for the updater.
    pub fn move_student(&self, student_id: Uuid, class_id: Option<Uuid>) {
        if let Some(student) = self.lock().students.get_mut(&student_id) {
            student.class_id = class_id;
        }
    }

    pub fn remove_student(&self, student_id: Uuid) {
        self.lock().students.remove(&student_id);
    }

    pub fn set_project_status(
        &self,
        student_id: Uuid,
        status: ProjectStatus,
        updated_at: DateTime<Utc>,
    ) {
        self.lock().projects.push((student_id, status, updated_at));
    }

    /// Records an engagement row with no score, as some activity sources do.
    pub fn record_unscored_engagement(&self, student_id: Uuid, occurred_at: DateTime<Utc>) {
        self.lock().engagement.push((student_id, None, occurred_at));
    }

    pub fn observation_count(&self, student_id: Uuid) -> usize {
        self.lock()
            .observations
            .iter()
            .filter(|(obs, _)| obs.student_id == student_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // a poisoned lock only means a test panicked mid-write
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.reads_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        self.sink_calls.fetch_add(1, Ordering::SeqCst);
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory sink is offline".into()));
        }
        let pending = self.failing_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_writes.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("memory sink dropped the write".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryAccessor for MemoryStore {
    async fn get_history(
        &self,
        student_id: Uuid,
        concept_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        self.check_reads()?;
        let state = self.lock();
        let mut entries: Vec<HistoryEntry> = state
            .observations
            .iter()
            .filter(|(obs, _)| obs.student_id == student_id)
            .filter(|(obs, _)| concept_id.map_or(true, |c| obs.concept_id.as_deref() == Some(c)))
            .map(|(obs, score)| HistoryEntry::from_observation(obs, Some(*score)))
            .collect();
        entries.sort_by_key(|entry| entry.timestamp);
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }
}

#[async_trait]
impl PersistenceSink for MemoryStore {
    async fn record_mastery(
        &self,
        observation: &Observation,
        score: f64,
    ) -> Result<(), StoreError> {
        self.check_writes()?;
        let mut state = self.lock();
        if !state.students.contains_key(&observation.student_id) {
            return Err(StoreError::Rejected(format!(
                "unknown student {}",
                observation.student_id
            )));
        }
        state.observations.push((observation.clone(), score));
        Ok(())
    }

    async fn record_engagement(
        &self,
        student_id: Uuid,
        score: f64,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writes()?;
        let mut state = self.lock();
        if !state.students.contains_key(&student_id) {
            return Err(StoreError::Rejected(format!("unknown student {student_id}")));
        }
        state.engagement.push((student_id, Some(score), occurred_at));
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn refresh_student(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<StudentAnalyticsSnapshot>, StoreError> {
        self.check_reads()?;
        let mut state = self.lock();
        let Some(student) = state.students.get(&student_id) else {
            return Ok(None);
        };
        let events = state.events_for(student_id);
        let snapshot = projection::project_student(student_id, student.class_id, &events, now);
        state.student_snapshots.insert(student_id, snapshot.clone());
        Ok(Some(snapshot))
    }

    async fn refresh_class(
        &self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError> {
        self.check_reads()?;
        let mut state = self.lock();
        if !state.classes.contains_key(&class_id) {
            return Ok(None);
        }
        let member_ids: Vec<Uuid> = state.members(class_id).iter().map(|s| s.id).collect();
        let members: Vec<StudentAnalyticsSnapshot> = member_ids
            .iter()
            .filter_map(|id| state.student_snapshots.get(id).cloned())
            .collect();
        let completed = state
            .projects
            .iter()
            .filter(|(id, status, _)| {
                *status == ProjectStatus::Completed && member_ids.contains(id)
            })
            .count() as i64;

        let snapshot = projection::project_class(class_id, &members, completed, now);
        state.class_snapshots.insert(class_id, snapshot.clone());
        Ok(Some(snapshot))
    }

    async fn student_snapshot(
        &self,
        student_id: Uuid,
    ) -> Result<Option<StudentAnalyticsSnapshot>, StoreError> {
        self.check_reads()?;
        Ok(self.lock().student_snapshots.get(&student_id).cloned())
    }

    async fn class_snapshot(
        &self,
        class_id: Uuid,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError> {
        self.check_reads()?;
        Ok(self.lock().class_snapshots.get(&class_id).cloned())
    }

    async fn class_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        self.check_reads()?;
        Ok(self.lock().classes.keys().copied().collect())
    }

    async fn student_ids(&self, class_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.check_reads()?;
        Ok(self.lock().members(class_id).iter().map(|s| s.id).collect())
    }

    async fn dashboard(&self, class_id: Uuid) -> Result<Option<Dashboard>, StoreError> {
        self.check_reads()?;
        let state = self.lock();
        let Some(class) = state.classes.get(&class_id).cloned() else {
            return Ok(None);
        };
        let students = state
            .members(class_id)
            .into_iter()
            .filter_map(|student| {
                state
                    .student_snapshots
                    .get(&student.id)
                    .map(|snapshot| (student.clone(), snapshot.clone()))
            })
            .collect();
        Ok(Some(Dashboard {
            class,
            snapshot: state.class_snapshots.get(&class_id).cloned(),
            students,
        }))
    }
}
