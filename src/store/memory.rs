use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    attempt_key, mastery_key, progress_key, schedule_key, Store, StoreError, StoreResult,
};
use crate::graph::CourseDefinition;
use crate::ids::{
    AttemptId, ConceptId, CourseId, ItemId, LearnerId, MisconceptionId, NodeId, ScheduleId,
};
use crate::types::{CourseProgress, InteractionAttempt, MasteryState, Misconception, ReviewSchedule};

#[derive(Default)]
struct Inner {
    courses: BTreeMap<CourseId, CourseDefinition>,
    mastery: HashMap<(LearnerId, ConceptId), MasteryState>,
    misconceptions: HashMap<MisconceptionId, Misconception>,
    occurrences: HashSet<(MisconceptionId, AttemptId)>,
    attempts: Vec<InteractionAttempt>,
    schedules: HashMap<ScheduleId, ReviewSchedule>,
    progress: HashMap<(LearnerId, CourseId), CourseProgress>,
}

/// In-process [`Store`] for tests and local demos.
///
/// Applies the same version and uniqueness rules as the SQL backend so the
/// engine's conflict handling is exercised without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts_for(
        &self,
        learner_id: &LearnerId,
        node_id: &NodeId,
    ) -> Vec<InteractionAttempt> {
        self.inner
            .lock()
            .attempts
            .iter()
            .filter(|a| &a.learner_id == learner_id && &a.node_id == node_id)
            .cloned()
            .collect()
    }
}

impl Inner {
    fn find_attempt(&self, id: AttemptId) -> Option<&InteractionAttempt> {
        self.attempts.iter().find(|a| a.id == id)
    }

    fn flagged_attempts(&self, learner_id: &LearnerId, node_id: &NodeId) -> u32 {
        self.attempts
            .iter()
            .filter(|a| {
                &a.learner_id == learner_id && &a.node_id == node_id && a.triggered_remediation
            })
            .count() as u32
    }

    fn push_attempt(&mut self, attempt: &InteractionAttempt) -> InteractionAttempt {
        let previous = self
            .attempts
            .iter()
            .filter(|a| a.learner_id == attempt.learner_id && a.node_id == attempt.node_id)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0);

        let mut stored = attempt.clone();
        stored.attempt_number = previous + 1;
        self.attempts.push(stored.clone());
        stored
    }
}

fn check_version(
    entity: &'static str,
    key: String,
    stored: Option<i64>,
    incoming: i64,
) -> StoreResult<()> {
    let matches = match stored {
        None => incoming == 0,
        Some(current) => incoming == current,
    };
    if matches {
        Ok(())
    } else {
        Err(StoreError::Conflict { entity, key })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_course(&self, course_id: &CourseId) -> StoreResult<Option<CourseDefinition>> {
        Ok(self.inner.lock().courses.get(course_id).cloned())
    }

    async fn save_course(&self, definition: &CourseDefinition) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let course_id = &definition.course.id;
        for node in &definition.nodes {
            let taken = inner
                .courses
                .iter()
                .filter(|(id, _)| *id != course_id)
                .any(|(_, other)| other.nodes.iter().any(|n| n.id == node.id));
            if taken {
                return Err(StoreError::Duplicate {
                    entity: "learning_node",
                    key: node.id.to_string(),
                });
            }
        }
        inner.courses.insert(course_id.clone(), definition.clone());
        Ok(())
    }

    async fn list_course_ids(&self) -> StoreResult<Vec<CourseId>> {
        Ok(self.inner.lock().courses.keys().cloned().collect())
    }

    async fn get_mastery(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> StoreResult<Option<MasteryState>> {
        let key = (learner_id.clone(), concept_id.clone());
        Ok(self.inner.lock().mastery.get(&key).cloned())
    }

    async fn put_mastery(&self, state: &MasteryState) -> StoreResult<MasteryState> {
        let mut inner = self.inner.lock();
        let key = (state.learner_id.clone(), state.concept_id.clone());
        check_version(
            "mastery_state",
            mastery_key(&state.learner_id, &state.concept_id),
            inner.mastery.get(&key).map(|s| s.version),
            state.version,
        )?;

        let mut stored = state.clone();
        stored.version += 1;
        inner.mastery.insert(key, stored.clone());
        Ok(stored)
    }

    async fn find_misconception(
        &self,
        concept_id: &ConceptId,
        label: &str,
    ) -> StoreResult<Option<Misconception>> {
        Ok(self
            .inner
            .lock()
            .misconceptions
            .values()
            .find(|m| &m.concept_id == concept_id && m.label == label)
            .cloned())
    }

    async fn save_misconception(&self, misconception: &Misconception) -> StoreResult<()> {
        self.inner
            .lock()
            .misconceptions
            .insert(misconception.id, misconception.clone());
        Ok(())
    }

    async fn record_misconception_occurrence(
        &self,
        misconception_id: MisconceptionId,
        attempt_id: AttemptId,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.misconceptions.contains_key(&misconception_id) {
            return Ok(false);
        }
        if !inner.occurrences.insert((misconception_id, attempt_id)) {
            return Ok(false);
        }
        if let Some(m) = inner.misconceptions.get_mut(&misconception_id) {
            m.occurrence_count += 1;
        }
        Ok(true)
    }

    async fn record_attempt(
        &self,
        attempt: &InteractionAttempt,
    ) -> StoreResult<InteractionAttempt> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.find_attempt(attempt.id) {
            return Ok(existing.clone());
        }
        Ok(inner.push_attempt(attempt))
    }

    async fn record_remediation_attempt(
        &self,
        attempt: &InteractionAttempt,
        budget: u32,
    ) -> StoreResult<InteractionAttempt> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.find_attempt(attempt.id) {
            return Ok(existing.clone());
        }
        if inner.flagged_attempts(&attempt.learner_id, &attempt.node_id) >= budget {
            return Err(StoreError::Conflict {
                entity: "remediation_budget",
                key: attempt_key(&attempt.learner_id, &attempt.node_id),
            });
        }

        let mut flagged = attempt.clone();
        flagged.triggered_remediation = true;
        Ok(inner.push_attempt(&flagged))
    }

    async fn count_remediation_attempts(
        &self,
        learner_id: &LearnerId,
        node_id: &NodeId,
    ) -> StoreResult<u32> {
        Ok(self.inner.lock().flagged_attempts(learner_id, node_id))
    }

    async fn get_schedule(&self, schedule_id: ScheduleId) -> StoreResult<Option<ReviewSchedule>> {
        Ok(self.inner.lock().schedules.get(&schedule_id).cloned())
    }

    async fn get_active_schedule(
        &self,
        learner_id: &LearnerId,
        item_id: &ItemId,
    ) -> StoreResult<Option<ReviewSchedule>> {
        Ok(self
            .inner
            .lock()
            .schedules
            .values()
            .find(|s| s.is_active && &s.learner_id == learner_id && &s.item_id == item_id)
            .cloned())
    }

    async fn put_schedule(&self, schedule: &ReviewSchedule) -> StoreResult<ReviewSchedule> {
        let mut inner = self.inner.lock();
        let key = schedule_key(&schedule.learner_id, &schedule.item_id);
        check_version(
            "review_schedule",
            key.clone(),
            inner.schedules.get(&schedule.id).map(|s| s.version),
            schedule.version,
        )?;

        if schedule.is_active {
            let clash = inner.schedules.values().any(|s| {
                s.id != schedule.id
                    && s.is_active
                    && s.learner_id == schedule.learner_id
                    && s.item_id == schedule.item_id
            });
            if clash {
                return Err(StoreError::Conflict {
                    entity: "review_schedule",
                    key,
                });
            }
        }

        let mut stored = schedule.clone();
        stored.version += 1;
        inner.schedules.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_due_schedules(
        &self,
        learner_id: &LearnerId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReviewSchedule>> {
        let mut due: Vec<ReviewSchedule> = self
            .inner
            .lock()
            .schedules
            .values()
            .filter(|s| &s.learner_id == learner_id && s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_review_at
                .cmp(&b.next_review_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn list_concept_schedules(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> StoreResult<Vec<ReviewSchedule>> {
        let mut schedules: Vec<ReviewSchedule> = self
            .inner
            .lock()
            .schedules
            .values()
            .filter(|s| {
                s.is_active
                    && &s.learner_id == learner_id
                    && s.concept_id.as_ref() == Some(concept_id)
            })
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(schedules)
    }

    async fn get_progress(
        &self,
        learner_id: &LearnerId,
        course_id: &CourseId,
    ) -> StoreResult<Option<CourseProgress>> {
        let key = (learner_id.clone(), course_id.clone());
        Ok(self.inner.lock().progress.get(&key).cloned())
    }

    async fn put_progress(&self, progress: &CourseProgress) -> StoreResult<CourseProgress> {
        let mut inner = self.inner.lock();
        let key = (progress.learner_id.clone(), progress.course_id.clone());
        check_version(
            "course_progress",
            progress_key(&progress.learner_id, &progress.course_id),
            inner.progress.get(&key).map(|p| p.version),
            progress.version,
        )?;

        let mut stored = progress.clone();
        stored.version += 1;
        inner.progress.insert(key, stored.clone());
        Ok(stored)
    }
}
