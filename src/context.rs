//! Process-wide engine context, built once and shared by reference.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::EstimationConfig;
use crate::error::StoreError;
use crate::hybrid::{Estimate, MasteryEngine};
use crate::models::Observation;
use crate::snapshot::SnapshotUpdater;
use crate::store::{HistoryAccessor, PersistenceSink, SnapshotStore};

/// Estimator plus the collaborators a mastery or engagement update needs.
///
/// The only state shared between workers is the read-only model weights held
/// by the engine; everything mutable lives behind the store.
#[derive(Clone)]
pub struct EngineContext {
    pub engine: MasteryEngine,
    pub history: Arc<dyn HistoryAccessor>,
    pub sink: Arc<dyn PersistenceSink>,
    pub snapshots: SnapshotUpdater,
    pub history_limit: usize,
}

impl EngineContext {
    pub fn new(
        engine: MasteryEngine,
        history: Arc<dyn HistoryAccessor>,
        sink: Arc<dyn PersistenceSink>,
        snapshot_store: Arc<dyn SnapshotStore>,
        history_limit: usize,
    ) -> Self {
        Self {
            engine,
            history,
            sink,
            snapshots: SnapshotUpdater::new(snapshot_store),
            history_limit,
        }
    }

    /// Wires every collaborator to one store.
    pub fn with_store<S>(engine: MasteryEngine, store: Arc<S>, history_limit: usize) -> Self
    where
        S: HistoryAccessor + PersistenceSink + SnapshotStore + 'static,
    {
        Self::new(engine, store.clone(), store.clone(), store, history_limit)
    }

    pub fn from_config<S>(config: &EstimationConfig, store: Arc<S>) -> Self
    where
        S: HistoryAccessor + PersistenceSink + SnapshotStore + 'static,
    {
        Self::with_store(
            MasteryEngine::from_config(config),
            store,
            config.history_limit,
        )
    }

    /// Estimates `observation` against the student's stored history.
    /// Only the history read can fail.
    pub async fn estimate_response(
        &self,
        observation: &Observation,
    ) -> Result<Estimate, StoreError> {
        let history = self
            .history
            .get_history(
                observation.student_id,
                observation.concept_id.as_deref(),
                self.history_limit,
            )
            .await?;
        Ok(self.engine.estimate(&history, observation))
    }

    /// Re-estimates the student's latest recorded observation against the
    /// history before it, without writing anything. `None` with no history.
    pub async fn current_estimate(
        &self,
        student_id: Uuid,
        concept_id: Option<&str>,
    ) -> Result<Option<Estimate>, StoreError> {
        let mut history = self
            .history
            .get_history(student_id, concept_id, self.history_limit + 1)
            .await?;
        let Some(latest) = history.pop() else {
            return Ok(None);
        };
        let observation = Observation {
            student_id,
            concept_id: concept_id.map(str::to_string),
            correct: latest.correct,
            response_time: latest.response_time,
            occurred_at: latest.timestamp,
        };
        Ok(Some(self.engine.estimate(&history, &observation)))
    }
}
