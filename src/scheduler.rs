//! SM-2 spaced-repetition scheduler.
//!
//! Schedules are per (learner, item) and independent of the course graph. The
//! only coupling to mastery is [`ReviewScheduler::sync_with_mastery`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::ids::{ConceptId, ItemId, LearnerId, ScheduleId};
use crate::store::{Store, StoreError};
use crate::types::ReviewSchedule;

/// Recall quality of one review, 0 (blackout) to 5 (perfect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub const MAX: u8 = 5;
    pub const PASSING: u8 = 3;

    pub fn new(value: u8) -> EngineResult<Self> {
        if value > Self::MAX {
            return Err(EngineError::validation(format!(
                "review quality {value} must be within [0, 5]"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_passing(self) -> bool {
        self.0 >= Self::PASSING
    }
}

impl TryFrom<u8> for Quality {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub schedule: ReviewSchedule,
    pub previous_interval_days: i64,
    pub graduated: bool,
}

pub fn next_easiness(ef: f64, quality: Quality, config: &SchedulerConfig) -> f64 {
    let miss = f64::from(Quality::MAX - quality.value());
    let delta = 0.1 - miss * (0.08 + miss * 0.02);
    (ef + delta).clamp(config.min_easiness, config.max_easiness)
}

/// Applies one SM-2 review to `schedule` in place; returns whether the item
/// graduated.
pub fn apply_review(
    schedule: &mut ReviewSchedule,
    quality: Quality,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> bool {
    let ef = next_easiness(schedule.easiness_factor, quality, config);

    if quality.is_passing() {
        schedule.interval_days = match schedule.repetition_number {
            0 => 1,
            1 => 6,
            _ => ((schedule.interval_days as f64) * ef).floor().max(1.0) as i64,
        };
        schedule.repetition_number += 1;
        schedule.streak += 1;
    } else {
        schedule.interval_days = 1;
        schedule.repetition_number = 0;
        schedule.streak = 0;
    }

    schedule.easiness_factor = ef;
    schedule.last_reviewed_at = Some(now);
    schedule.next_review_at = now + Duration::days(schedule.interval_days);
    schedule.interval_days >= config.graduation_interval_days
}

/// Round-robins due items across concept groups, earliest-due group first.
/// Items without a concept are each their own group.
pub fn interleave(items: Vec<ReviewSchedule>, limit: usize) -> Vec<ReviewSchedule> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, VecDeque<ReviewSchedule>> = HashMap::new();

    for item in items {
        let key = match &item.concept_id {
            Some(concept) => format!("concept:{concept}"),
            None => format!("item:{}", item.item_id),
        };
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            VecDeque::new()
        });
        group.push_back(item);
    }

    let mut queue = Vec::with_capacity(limit);
    while queue.len() < limit {
        let mut progressed = false;
        for key in &order {
            if queue.len() >= limit {
                break;
            }
            if let Some(item) = groups.get_mut(key).and_then(VecDeque::pop_front) {
                queue.push(item);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    queue
}

#[derive(Clone)]
pub struct ReviewScheduler {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
}

impl ReviewScheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns the active schedule for the item, creating it on first use.
    pub async fn schedule(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        item_id: &ItemId,
        concept_id: Option<&ConceptId>,
    ) -> EngineResult<ReviewSchedule> {
        if let Some(existing) = self.store.get_active_schedule(learner_id, item_id).await? {
            return Ok(existing);
        }

        let schedule = ReviewSchedule {
            id: ScheduleId::new(),
            learner_id: learner_id.clone(),
            item_id: item_id.clone(),
            concept_id: concept_id.cloned(),
            easiness_factor: self.config.initial_easiness,
            interval_days: 1,
            repetition_number: 0,
            next_review_at: ctx.now + Duration::days(1),
            last_reviewed_at: None,
            streak: 0,
            is_active: true,
            created_at: ctx.now,
            version: 0,
        };

        match self.store.put_schedule(&schedule).await {
            Ok(stored) => {
                tracing::debug!(
                    learner_id = %learner_id,
                    item_id = %item_id,
                    schedule_id = %stored.id,
                    "review scheduled"
                );
                Ok(stored)
            }
            // lost a creation race: the winner's row is the answer
            Err(StoreError::Conflict { .. }) => self
                .store
                .get_active_schedule(learner_id, item_id)
                .await?
                .ok_or_else(|| EngineError::ConcurrencyConflict {
                    entity: "review_schedule",
                    key: format!("{learner_id}/{item_id}"),
                }),
            Err(err) => Err(err.into()),
        }
    }

    /// Applies one review. Not idempotent: each real review must be submitted
    /// exactly once.
    pub async fn process_review(
        &self,
        ctx: &RequestContext,
        schedule_id: ScheduleId,
        quality: Quality,
    ) -> EngineResult<ReviewOutcome> {
        let mut schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("review schedule", schedule_id))?;
        if !schedule.is_active {
            return Err(EngineError::validation(format!(
                "review schedule {schedule_id} is no longer active"
            )));
        }

        let previous_interval_days = schedule.interval_days;
        let graduated = apply_review(&mut schedule, quality, &self.config, ctx.now);
        let stored = self.store.put_schedule(&schedule).await?;

        tracing::debug!(
            schedule_id = %schedule_id,
            quality = quality.value(),
            interval_days = stored.interval_days,
            easiness = stored.easiness_factor,
            graduated,
            "review processed"
        );

        Ok(ReviewOutcome {
            schedule: stored,
            previous_interval_days,
            graduated,
        })
    }

    pub async fn get_due_items(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        limit: u32,
    ) -> EngineResult<Vec<ReviewSchedule>> {
        Ok(self.store.list_due_schedules(learner_id, ctx.now, limit).await?)
    }

    pub async fn get_interleaved_queue(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        limit: u32,
    ) -> EngineResult<Vec<ReviewSchedule>> {
        // a wider pool than `limit` gives the round-robin something to mix
        let pool = limit.saturating_mul(4).max(limit);
        let due = self
            .store
            .list_due_schedules(learner_id, ctx.now, pool)
            .await?;
        Ok(interleave(due, limit as usize))
    }

    /// Deactivates a superseded schedule; a later `schedule` call starts fresh.
    pub async fn retire(&self, schedule_id: ScheduleId) -> EngineResult<ReviewSchedule> {
        let mut schedule = self
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("review schedule", schedule_id))?;
        if !schedule.is_active {
            return Ok(schedule);
        }
        schedule.is_active = false;
        Ok(self.store.put_schedule(&schedule).await?)
    }

    /// Aligns a concept's schedules with its mastery: strong concepts wait at
    /// least the floor interval, weak ones restart their learning curve.
    pub async fn sync_with_mastery(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> EngineResult<Vec<ReviewSchedule>> {
        let Some(mastery) = self.store.get_mastery(learner_id, concept_id).await? else {
            return Ok(Vec::new());
        };
        let score = mastery.mastery_score;

        let mut updated = Vec::new();
        let schedules = self
            .store
            .list_concept_schedules(learner_id, concept_id)
            .await?;
        for mut schedule in schedules {
            if score >= self.config.mastery_high {
                let floor = self.config.mastery_high_floor_days;
                if schedule.interval_days >= floor {
                    continue;
                }
                schedule.interval_days = floor;
                schedule.next_review_at =
                    schedule.next_review_at.max(ctx.now + Duration::days(floor));
            } else if score < self.config.mastery_low {
                if schedule.interval_days == 1 && schedule.repetition_number == 0 {
                    continue;
                }
                schedule.interval_days = 1;
                schedule.repetition_number = 0;
                schedule.next_review_at = ctx.now + Duration::days(1);
            } else {
                continue;
            }
            updated.push(self.store.put_schedule(&schedule).await?);
        }

        if !updated.is_empty() {
            tracing::debug!(
                learner_id = %learner_id,
                concept_id = %concept_id,
                mastery = score,
                schedules = updated.len(),
                "schedules synced with mastery"
            );
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn schedule(item: &str, concept: Option<&str>, due_offset_hours: i64) -> ReviewSchedule {
        ReviewSchedule {
            id: ScheduleId::new(),
            learner_id: LearnerId::from("u1"),
            item_id: ItemId::from(item),
            concept_id: concept.map(ConceptId::from),
            easiness_factor: 2.5,
            interval_days: 1,
            repetition_number: 0,
            next_review_at: now() + Duration::hours(due_offset_hours),
            last_reviewed_at: None,
            streak: 0,
            is_active: true,
            created_at: now(),
            version: 1,
        }
    }

    fn q(value: u8) -> Quality {
        Quality::new(value).unwrap()
    }

    #[test]
    fn perfect_reviews_follow_sm2_intervals() {
        let config = SchedulerConfig::default();
        let mut s = schedule("a", None, 0);
        let mut intervals = Vec::new();
        for _ in 0..4 {
            apply_review(&mut s, q(5), &config, now());
            intervals.push(s.interval_days);
            assert_eq!(s.easiness_factor, 2.5);
        }
        assert_eq!(intervals, vec![1, 6, 15, 37]);
        assert_eq!(s.streak, 4);
    }

    #[test]
    fn failing_review_resets_regardless_of_streak() {
        let config = SchedulerConfig::default();
        let mut s = schedule("a", None, 0);
        s.interval_days = 90;
        s.repetition_number = 7;
        s.streak = 7;
        let graduated = apply_review(&mut s, q(2), &config, now());
        assert!(!graduated);
        assert_eq!((s.interval_days, s.repetition_number, s.streak), (1, 0, 0));
        assert_eq!(s.next_review_at, now() + Duration::days(1));
    }

    #[test]
    fn easiness_never_drops_below_floor() {
        let config = SchedulerConfig::default();
        let mut s = schedule("a", None, 0);
        for _ in 0..20 {
            apply_review(&mut s, q(0), &config, now());
            assert!(s.easiness_factor >= 1.3);
        }
        assert_eq!(s.easiness_factor, 1.3);
    }

    #[test]
    fn long_intervals_graduate() {
        let config = SchedulerConfig::default();
        let mut s = schedule("a", None, 0);
        s.repetition_number = 3;
        s.interval_days = 15;
        assert!(apply_review(&mut s, q(4), &config, now()));
    }

    #[test]
    fn quality_above_five_is_rejected() {
        assert!(matches!(Quality::new(6), Err(EngineError::Validation(_))));
        assert!(Quality::new(0).is_ok());
    }

    #[test]
    fn interleave_alternates_concepts() {
        let items = vec![
            schedule("a1", Some("a"), -5),
            schedule("a2", Some("a"), -4),
            schedule("a3", Some("a"), -3),
            schedule("b1", Some("b"), -2),
            schedule("b2", Some("b"), -1),
            schedule("x", None, 0),
        ];
        let ids: Vec<String> = interleave(items, 10)
            .into_iter()
            .map(|s| s.item_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a1", "b1", "x", "a2", "b2", "a3"]);
    }

    fn scheduler() -> (ReviewScheduler, Arc<crate::store::MemoryStore>) {
        let store = Arc::new(crate::store::MemoryStore::new());
        (ReviewScheduler::new(store.clone(), SchedulerConfig::default()), store)
    }

    async fn set_mastery(store: &crate::store::MemoryStore, score: f64) {
        let mut state = crate::mastery::new_state(
            &LearnerId::from("u1"),
            &ConceptId::from("fractions"),
            &crate::config::MasteryConfig::default(),
            now(),
        );
        if let Some(existing) = store
            .get_mastery(&state.learner_id, &state.concept_id)
            .await
            .unwrap()
        {
            state = existing;
        }
        state.mastery_score = score;
        store.put_mastery(&state).await.unwrap();
    }

    #[tokio::test]
    async fn schedule_is_idempotent_until_retired() {
        let (scheduler, _) = scheduler();
        let ctx = RequestContext::at(now());
        let learner = LearnerId::from("u1");
        let item = ItemId::from("quiz");

        let first = scheduler
            .schedule(&ctx, &learner, &item, None)
            .await
            .unwrap();
        assert_eq!(first.easiness_factor, 2.5);
        assert_eq!(first.next_review_at, now() + Duration::days(1));
        let again = scheduler
            .schedule(&ctx, &learner, &item, None)
            .await
            .unwrap();
        assert_eq!(again.id, first.id);

        let retired = scheduler.retire(first.id).await.unwrap();
        assert!(!retired.is_active);
        let fresh = scheduler
            .schedule(&ctx, &learner, &item, None)
            .await
            .unwrap();
        assert_ne!(fresh.id, first.id);

        let err = scheduler
            .process_review(&ctx, first.id, q(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_schedule_is_not_found() {
        let (scheduler, _) = scheduler();
        let err = scheduler
            .process_review(&RequestContext::at(now()), ScheduleId::new(), q(4))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn mastery_sync_raises_and_resets_intervals() {
        let (scheduler, store) = scheduler();
        let ctx = RequestContext::at(now());
        let learner = LearnerId::from("u1");
        let concept = ConceptId::from("fractions");

        let created = scheduler
            .schedule(&ctx, &learner, &ItemId::from("quiz"), Some(&concept))
            .await
            .unwrap();
        assert!(scheduler.sync_with_mastery(&ctx, &learner, &concept).await.unwrap().is_empty());

        set_mastery(&store, 0.9).await;
        let raised = scheduler
            .sync_with_mastery(&ctx, &learner, &concept)
            .await
            .unwrap();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].interval_days, 14);
        assert_eq!(raised[0].next_review_at, now() + Duration::days(14));

        set_mastery(&store, 0.5).await;
        assert!(scheduler.sync_with_mastery(&ctx, &learner, &concept).await.unwrap().is_empty());

        set_mastery(&store, 0.1).await;
        let reset = scheduler
            .sync_with_mastery(&ctx, &learner, &concept)
            .await
            .unwrap();
        assert_eq!((reset[0].interval_days, reset[0].repetition_number), (1, 0));
        assert_eq!(reset[0].id, created.id);
    }

    #[test]
    fn interleave_respects_limit() {
        let items = vec![schedule("a1", Some("a"), 0), schedule("b1", Some("b"), 0)];
        assert_eq!(interleave(items, 1).len(), 1);
    }
}
