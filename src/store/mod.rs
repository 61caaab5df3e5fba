//! Storage port.
//!
//! The engine reads and writes state exclusively through [`Store`]. Mutable rows
//! carry a `version`: writing a row with version 0 inserts it, any other version
//! is a conditional update that fails with [`StoreError::Conflict`] when the row
//! moved underneath the caller. Per-key serialization is the store's job, never
//! an in-process lock.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use schema::{split_sql_statements, ENGINE_SCHEMA_SQL};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::graph::CourseDefinition;
use crate::ids::{
    AttemptId, ConceptId, CourseId, ItemId, LearnerId, MisconceptionId, NodeId, ScheduleId,
};
use crate::types::{CourseProgress, InteractionAttempt, MasteryState, Misconception, ReviewSchedule};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on {entity} {key}")]
    Conflict { entity: &'static str, key: String },
    /// Authoring-time uniqueness violation, not retryable.
    #[error("duplicate {entity} {key}")]
    Duplicate { entity: &'static str, key: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // ── Course graph (immutable during playback) ──

    async fn load_course(&self, course_id: &CourseId) -> StoreResult<Option<CourseDefinition>>;
    /// Authoring-time write; replaces the whole course. Node ids are unique
    /// across courses, a node id owned by another course is `Duplicate`.
    async fn save_course(&self, definition: &CourseDefinition) -> StoreResult<()>;
    async fn list_course_ids(&self) -> StoreResult<Vec<CourseId>>;

    // ── Mastery ──

    async fn get_mastery(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> StoreResult<Option<MasteryState>>;
    /// Returns the row as stored, with its new version.
    async fn put_mastery(&self, state: &MasteryState) -> StoreResult<MasteryState>;

    // ── Misconceptions ──

    async fn find_misconception(
        &self,
        concept_id: &ConceptId,
        label: &str,
    ) -> StoreResult<Option<Misconception>>;
    async fn save_misconception(&self, misconception: &Misconception) -> StoreResult<()>;
    /// Counts one occurrence per attempt. Returns false when this attempt was
    /// already counted.
    async fn record_misconception_occurrence(
        &self,
        misconception_id: MisconceptionId,
        attempt_id: AttemptId,
    ) -> StoreResult<bool>;

    // ── Interaction attempts ──

    /// Appends the attempt, assigning the next 1-based attempt number for the
    /// (learner, node) pair. Re-recording an existing attempt id returns the
    /// stored attempt unchanged.
    async fn record_attempt(
        &self,
        attempt: &InteractionAttempt,
    ) -> StoreResult<InteractionAttempt>;
    /// Like [`Store::record_attempt`] for an attempt that takes a remediation
    /// detour. The attempt is stored flagged only while fewer than `budget`
    /// flagged attempts exist for the pair; otherwise nothing is written and
    /// the call fails with `Conflict` on `remediation_budget`. Check and
    /// insert happen as one atomic step.
    async fn record_remediation_attempt(
        &self,
        attempt: &InteractionAttempt,
        budget: u32,
    ) -> StoreResult<InteractionAttempt>;
    async fn count_remediation_attempts(
        &self,
        learner_id: &LearnerId,
        node_id: &NodeId,
    ) -> StoreResult<u32>;

    // ── Review schedules ──

    async fn get_schedule(&self, schedule_id: ScheduleId) -> StoreResult<Option<ReviewSchedule>>;
    async fn get_active_schedule(
        &self,
        learner_id: &LearnerId,
        item_id: &ItemId,
    ) -> StoreResult<Option<ReviewSchedule>>;
    async fn put_schedule(&self, schedule: &ReviewSchedule) -> StoreResult<ReviewSchedule>;
    /// Active schedules due at `now`, earliest first, ties by item id.
    async fn list_due_schedules(
        &self,
        learner_id: &LearnerId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReviewSchedule>>;
    async fn list_concept_schedules(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> StoreResult<Vec<ReviewSchedule>>;

    // ── Course progress ──

    async fn get_progress(
        &self,
        learner_id: &LearnerId,
        course_id: &CourseId,
    ) -> StoreResult<Option<CourseProgress>>;
    async fn put_progress(&self, progress: &CourseProgress) -> StoreResult<CourseProgress>;
}

pub(crate) fn mastery_key(learner_id: &LearnerId, concept_id: &ConceptId) -> String {
    format!("{learner_id}/{concept_id}")
}

pub(crate) fn progress_key(learner_id: &LearnerId, course_id: &CourseId) -> String {
    format!("{learner_id}/{course_id}")
}

pub(crate) fn attempt_key(learner_id: &LearnerId, node_id: &NodeId) -> String {
    format!("{learner_id}/{node_id}")
}

pub(crate) fn schedule_key(learner_id: &LearnerId, item_id: &ItemId) -> String {
    format!("{learner_id}/{item_id}")
}
