//! Keeps per-student and per-class analytics snapshots current.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ClassAnalyticsSnapshot, StudentAnalyticsSnapshot};
use crate::store::SnapshotStore;

/// What a refresh touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshOutcome {
    pub student: Option<StudentAnalyticsSnapshot>,
    pub class: Option<ClassAnalyticsSnapshot>,
}

/// Recomputes snapshots after raw activity has been recorded.
///
/// Missing students or classes are logged and skipped; only store
/// unavailability is returned as an error.
#[derive(Clone)]
pub struct SnapshotUpdater {
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotUpdater {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    /// Refreshes the student's snapshot, then the owning class's snapshot.
    /// If the student changed class since the last refresh, the former class
    /// is recomputed as well.
    pub async fn refresh(&self, student_id: Uuid) -> Result<RefreshOutcome, StoreError> {
        let previous_class = self
            .store
            .student_snapshot(student_id)
            .await?
            .and_then(|snapshot| snapshot.class_id);

        let Some(student) = self.store.refresh_student(student_id, Utc::now()).await? else {
            tracing::warn!(%student_id, "student not found, skipping snapshot refresh");
            return Ok(RefreshOutcome::default());
        };

        if let Some(former) = previous_class.filter(|id| Some(*id) != student.class_id) {
            tracing::info!(%student_id, class_id = %former, "student left class, refreshing it");
            self.refresh_class(former).await?;
        }

        let class = match student.class_id {
            Some(class_id) => self.refresh_class(class_id).await?,
            None => {
                tracing::debug!(%student_id, "student has no class, class snapshot untouched");
                None
            }
        };

        Ok(RefreshOutcome {
            student: Some(student),
            class,
        })
    }

    pub async fn refresh_class(
        &self,
        class_id: Uuid,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError> {
        let snapshot = self.store.refresh_class(class_id, Utc::now()).await?;
        if snapshot.is_none() {
            tracing::warn!(%class_id, "class not found, skipping class snapshot refresh");
        }
        Ok(snapshot)
    }

    /// Full rebuild of every member snapshot followed by the class snapshot.
    pub async fn rebuild_class(
        &self,
        class_id: Uuid,
    ) -> Result<Option<ClassAnalyticsSnapshot>, StoreError> {
        let now = Utc::now();
        let students = self.store.student_ids(class_id).await?;
        for student_id in &students {
            if self.store.refresh_student(*student_id, now).await?.is_none() {
                tracing::warn!(%student_id, "student vanished during rebuild");
            }
        }
        let snapshot = self.refresh_class(class_id).await?;
        tracing::info!(%class_id, students = students.len(), "rebuilt class snapshots");
        Ok(snapshot)
    }

    pub async fn rebuild_all(&self) -> Result<usize, StoreError> {
        let classes = self.store.class_ids().await?;
        for class_id in &classes {
            self.rebuild_class(*class_id).await?;
        }
        Ok(classes.len())
    }
}
