//! Per-(learner, concept) mastery estimate.
//!
//! An exponential-smoothing heuristic: every attempt pulls the score toward the
//! observed outcome with a learning rate that shrinks as confidence grows.
//! Stored scores are never decayed; forgetting is only applied when readiness
//! is read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MasteryConfig;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::ids::{AttemptId, ConceptId, LearnerId, MisconceptionId};
use crate::store::Store;
use crate::types::{MasteryState, Trend};

const MS_PER_DAY: f64 = 86_400_000.0;

/// One interaction outcome fed to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteryUpdate {
    pub is_correct: bool,
    /// Partial credit in [0, 1]; overrides the boolean outcome when present.
    pub score: Option<f64>,
    pub response_time_ms: Option<u64>,
    pub expected_time_ms: Option<u64>,
}

impl MasteryUpdate {
    pub fn correct() -> Self {
        Self {
            is_correct: true,
            ..Self::default()
        }
    }

    pub fn incorrect() -> Self {
        Self::default()
    }

    pub fn partial(score: f64) -> Self {
        Self {
            is_correct: score >= 0.5,
            score: Some(score),
            ..Self::default()
        }
    }

    pub fn with_timing(mut self, response_time_ms: u64, expected_time_ms: u64) -> Self {
        self.response_time_ms = Some(response_time_ms);
        self.expected_time_ms = Some(expected_time_ms);
        self
    }

    pub(crate) fn validate(&self) -> EngineResult<()> {
        match self.score {
            Some(s) if !s.is_finite() || !(0.0..=1.0).contains(&s) => Err(EngineError::validation(
                format!("partial-credit score {s} must be within [0, 1]"),
            )),
            _ => Ok(()),
        }
    }

    fn observed(&self) -> f64 {
        self.score
            .unwrap_or(if self.is_correct { 1.0 } else { 0.0 })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillReadiness {
    pub effective_mastery: f64,
    pub confidence: f64,
}

pub fn learning_rate(confidence: f64, min_rate: f64) -> f64 {
    (0.5 * (1.0 - confidence)).max(min_rate)
}

pub fn new_state(
    learner_id: &LearnerId,
    concept_id: &ConceptId,
    config: &MasteryConfig,
    now: DateTime<Utc>,
) -> MasteryState {
    MasteryState {
        learner_id: learner_id.clone(),
        concept_id: concept_id.clone(),
        mastery_score: config.initial_mastery,
        confidence: config.initial_confidence,
        attempts: 0,
        correct_count: 0,
        incorrect_count: 0,
        trend: Trend::Stable,
        recent_scores: Vec::new(),
        last_seen: now,
        version: 0,
    }
}

/// Applies one attempt to `state` in place. Caller validates `update`.
pub fn apply_update(
    state: &mut MasteryState,
    update: &MasteryUpdate,
    config: &MasteryConfig,
    now: DateTime<Utc>,
) {
    let previous = state.mastery_score;
    let observed = update.observed();
    let alpha = learning_rate(state.confidence, config.min_learning_rate);

    let mut mastery = previous * (1.0 - alpha) + observed * alpha;
    if update.is_correct {
        mastery += speed_bonus(update, config);
    }
    state.mastery_score = mastery.clamp(0.0, 1.0);
    state.confidence = (state.confidence + config.confidence_step).min(config.confidence_cap);

    state.attempts += 1;
    if update.is_correct {
        state.correct_count += 1;
    } else {
        state.incorrect_count += 1;
    }

    state.recent_scores.push(observed);
    let window = config.trend_window.max(1);
    if state.recent_scores.len() > window {
        let excess = state.recent_scores.len() - window;
        state.recent_scores.drain(..excess);
    }

    let margin = if update.score.is_some() {
        config.trend_margin_partial
    } else {
        config.trend_margin_binary
    };
    state.trend = classify_trend(state, previous, margin, config.trend_min_attempts);
    state.last_seen = now;
}

fn speed_bonus(update: &MasteryUpdate, config: &MasteryConfig) -> f64 {
    match (update.response_time_ms, update.expected_time_ms) {
        (Some(rt), Some(expected)) if expected > 0 && rt < expected => {
            config.speed_bonus_max * (1.0 - rt as f64 / expected as f64)
        }
        _ => 0.0,
    }
}

fn classify_trend(state: &MasteryState, previous: f64, margin: f64, min_attempts: u32) -> Trend {
    if state.attempts < min_attempts || state.recent_scores.is_empty() {
        return Trend::Stable;
    }
    let recent = state.recent_scores.iter().sum::<f64>() / state.recent_scores.len() as f64;
    if recent > previous + margin {
        Trend::Improving
    } else if recent < previous - margin {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

pub fn readiness(
    state: &MasteryState,
    config: &MasteryConfig,
    now: DateTime<Utc>,
) -> SkillReadiness {
    let elapsed_days = ((now - state.last_seen).num_milliseconds() as f64 / MS_PER_DAY).max(0.0);
    let retention = (-config.forgetting_rate * elapsed_days).exp();
    let uncertainty = 1.0 - state.confidence * retention;

    SkillReadiness {
        effective_mastery: (state.mastery_score * retention).clamp(0.0, 1.0),
        confidence: (1.0 - uncertainty).clamp(0.0, 1.0),
    }
}

#[derive(Clone)]
pub struct MasteryTracker {
    store: Arc<dyn Store>,
    config: MasteryConfig,
}

impl MasteryTracker {
    pub fn new(store: Arc<dyn Store>, config: MasteryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MasteryConfig {
        &self.config
    }

    pub async fn update(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
        update: MasteryUpdate,
    ) -> EngineResult<MasteryState> {
        update.validate()?;

        let mut state = self
            .store
            .get_mastery(learner_id, concept_id)
            .await?
            .unwrap_or_else(|| new_state(learner_id, concept_id, &self.config, ctx.now));
        apply_update(&mut state, &update, &self.config, ctx.now);

        let stored = self.store.put_mastery(&state).await?;
        tracing::debug!(
            learner_id = %learner_id,
            concept_id = %concept_id,
            mastery = stored.mastery_score,
            confidence = stored.confidence,
            trend = stored.trend.as_str(),
            "mastery updated"
        );
        Ok(stored)
    }

    pub async fn get(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> EngineResult<Option<MasteryState>> {
        Ok(self.store.get_mastery(learner_id, concept_id).await?)
    }

    /// Stored score without decay; unseen concepts report the initial score.
    pub async fn mastery_score(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> EngineResult<f64> {
        Ok(self
            .store
            .get_mastery(learner_id, concept_id)
            .await?
            .map(|s| s.mastery_score)
            .unwrap_or(self.config.initial_mastery))
    }

    pub async fn get_skill_readiness(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> EngineResult<SkillReadiness> {
        Ok(match self.store.get_mastery(learner_id, concept_id).await? {
            Some(state) => readiness(&state, &self.config, ctx.now),
            None => SkillReadiness {
                effective_mastery: 0.0,
                confidence: 0.0,
            },
        })
    }

    /// Counts a misconception signalled by a wrong answer. Never fails: unknown
    /// tags and storage errors are logged and dropped.
    pub async fn record_misconception(
        &self,
        concept_id: &ConceptId,
        tag: &str,
        attempt_id: AttemptId,
    ) -> Option<MisconceptionId> {
        let misconception = match self.store.find_misconception(concept_id, tag).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                tracing::warn!(concept_id = %concept_id, tag, "unrecognized misconception tag");
                return None;
            }
            Err(err) => {
                tracing::warn!(
                    concept_id = %concept_id,
                    tag,
                    error = %err,
                    "misconception lookup failed"
                );
                return None;
            }
        };

        match self
            .store
            .record_misconception_occurrence(misconception.id, attempt_id)
            .await
        {
            Ok(counted) => {
                tracing::debug!(
                    misconception_id = %misconception.id,
                    counted,
                    "misconception observed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    misconception_id = %misconception.id,
                    error = %err,
                    "failed to count misconception"
                );
            }
        }
        Some(misconception.id)
    }
}
