//! Playback facade.
//!
//! The orchestration layer talks to [`LearningEngine`] only. Each call takes a
//! [`RequestContext`]; the engine itself keeps nothing learner-specific between
//! calls, only the shared graph cache.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::graph::{CourseGraph, GraphCache, LearningNode};
use crate::ids::{AttemptId, CourseId, ItemId, LearnerId, NodeId, ScheduleId};
use crate::mastery::{MasteryTracker, MasteryUpdate};
use crate::navigation::{Candidate, NavigationEngine};
use crate::progress::ProgressTracker;
use crate::remediation::{FailureRoute, RemediationController};
use crate::scheduler::{Quality, ReviewOutcome, ReviewScheduler};
use crate::store::Store;
use crate::types::{CourseProgress, InteractionAttempt, MasteryState, ReviewSchedule};

/// Raw interaction payload forwarded by the playback layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InteractionInput {
    pub answer: serde_json::Value,
    pub is_correct: bool,
    pub score: Option<f64>,
    /// Misconception label carried by the chosen answer option.
    pub misconception_tag: Option<String>,
    pub response_time_ms: Option<u64>,
    pub expected_time_ms: Option<u64>,
    pub time_spent_secs: u64,
}

impl InteractionInput {
    pub fn new(answer: serde_json::Value, is_correct: bool) -> Self {
        Self {
            answer,
            is_correct,
            ..Self::default()
        }
    }

    pub fn with_misconception(mut self, tag: impl Into<String>) -> Self {
        self.misconception_tag = Some(tag.into());
        self
    }

    pub fn with_time_spent(mut self, secs: u64) -> Self {
        self.time_spent_secs = secs;
        self
    }

    fn mastery_update(&self) -> MasteryUpdate {
        MasteryUpdate {
            is_correct: self.is_correct,
            score: self.score,
            response_time_ms: self.response_time_ms,
            expected_time_ms: self.expected_time_ms,
        }
    }
}

/// Everything the playback layer needs after one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    /// `None` once the course is finished.
    pub next_node: Option<LearningNode>,
    pub candidates: Vec<Candidate>,
    pub mastery: Option<MasteryState>,
    pub attempt: Option<InteractionAttempt>,
    pub remediation: Option<FailureRoute>,
    pub progress: CourseProgress,
    pub due_reviews: Vec<ReviewSchedule>,
}

pub struct LearningEngine {
    store: Arc<dyn Store>,
    config: EngineConfig,
    graphs: GraphCache,
    mastery: MasteryTracker,
    navigation: NavigationEngine,
    scheduler: ReviewScheduler,
    remediation: RemediationController,
    progress: ProgressTracker,
}

impl LearningEngine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        let mastery = MasteryTracker::new(Arc::clone(&store), config.mastery.clone());
        let navigation = NavigationEngine::new(mastery.clone(), config.navigation.clone());
        let scheduler = ReviewScheduler::new(Arc::clone(&store), config.scheduler.clone());
        let remediation =
            RemediationController::new(Arc::clone(&store), config.remediation.clone());
        let progress = ProgressTracker::new(Arc::clone(&store));

        Self {
            store,
            config,
            graphs: GraphCache::new(),
            mastery,
            navigation,
            scheduler,
            remediation,
            progress,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn mastery(&self) -> &MasteryTracker {
        &self.mastery
    }

    pub fn navigation(&self) -> &NavigationEngine {
        &self.navigation
    }

    pub fn scheduler(&self) -> &ReviewScheduler {
        &self.scheduler
    }

    pub fn remediation(&self) -> &RemediationController {
        &self.remediation
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Loads (and validates) a course graph through the cache.
    pub async fn graph(&self, course_id: &CourseId) -> EngineResult<Arc<CourseGraph>> {
        self.graphs
            .get_or_load(
                self.store.as_ref(),
                course_id,
                self.config.remediation.max_remediation_hops,
            )
            .await
    }

    /// Drops a cached graph after the course was re-authored.
    pub fn invalidate_course(&self, course_id: &CourseId) {
        self.graphs.invalidate(course_id);
    }

    pub async fn enroll(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        course_id: &CourseId,
    ) -> EngineResult<CourseProgress> {
        let graph = self.graph(course_id).await?;
        self
            .progress
            .get_or_create_progress(ctx, &graph, learner_id)
            .await
    }

    /// Applies one answered interaction: mastery, routing, attempt log, review
    /// scheduling and progress, in that order. Everything that can reject the
    /// request is checked before the first write.
    pub async fn submit_interaction(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        course_id: &CourseId,
        node_id: &NodeId,
        input: InteractionInput,
    ) -> EngineResult<StepOutcome> {
        let graph = self.graph(course_id).await?;
        let node = graph.node(node_id)?;
        let update = input.mastery_update();
        update.validate()?;

        let enrolled = self.store.get_progress(learner_id, course_id).await?;
        if enrolled.as_ref().is_some_and(CourseProgress::is_completed) {
            return Err(EngineError::validation(format!(
                "course {course_id} is already completed, interaction on {node_id} rejected"
            )));
        }

        let attempt_id = AttemptId::new();

        let mastery = match &node.concept_id {
            Some(concept_id) => Some(
                self.mastery
                    .update(ctx, learner_id, concept_id, update)
                    .await?,
            ),
            None => None,
        };

        let misconception = match (&node.concept_id, &input.misconception_tag) {
            (Some(concept_id), Some(tag)) if !input.is_correct => {
                self.mastery
                    .record_misconception(concept_id, tag, attempt_id)
                    .await
            }
            _ => None,
        };

        let candidates = self
            .navigation
            .get_next_nodes(&graph, node_id, learner_id, Some(input.is_correct))
            .await?;

        let attempt = InteractionAttempt {
            id: attempt_id,
            learner_id: learner_id.clone(),
            node_id: node_id.clone(),
            answer: input.answer,
            is_correct: input.is_correct,
            attempt_number: 0,
            detected_misconception_id: misconception,
            triggered_remediation: false,
            created_at: ctx.now,
        };

        let (next_node, remediation, attempt) = if input.is_correct {
            let attempt = self.store.record_attempt(&attempt).await?;
            (candidates.first().map(|c| c.node.clone()), None, attempt)
        } else {
            let route = self
                .remediation
                .route_failure(&graph, node, learner_id, &candidates)
                .await?;
            let attempt = InteractionAttempt {
                triggered_remediation: route.detour,
                ..attempt
            };
            let (route, attempt) = self
                .remediation
                .commit_failure(&graph, node, route, &attempt)
                .await?;
            (route.next.clone(), Some(route), attempt)
        };

        self.scheduler
            .schedule(ctx, learner_id, &ItemId::from(node_id), node.concept_id.as_ref())
            .await?;
        if let Some(concept_id) = &node.concept_id {
            self.scheduler
                .sync_with_mastery(ctx, learner_id, concept_id)
                .await?;
        }

        let progress = self
            .progress
            .advance(
                ctx,
                &graph,
                learner_id,
                node_id,
                next_node.as_ref().map(|n| &n.id),
                input.time_spent_secs,
            )
            .await?;

        let due_reviews = self
            .scheduler
            .get_due_items(ctx, learner_id, self.config.scheduler.due_limit)
            .await?;

        tracing::info!(
            request_id = %ctx.request_id,
            learner_id = %learner_id,
            node_id = %node_id,
            correct = input.is_correct,
            attempt_number = attempt.attempt_number,
            next_node_id = ?next_node.as_ref().map(|n| n.id.as_str()),
            "interaction submitted"
        );

        Ok(StepOutcome {
            next_node,
            candidates,
            mastery,
            attempt: Some(attempt),
            remediation,
            progress,
            due_reviews,
        })
    }

    /// Advances past a node that has no interaction (hook, narrative, ...).
    pub async fn complete_node(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        course_id: &CourseId,
        node_id: &NodeId,
        time_spent_secs: u64,
    ) -> EngineResult<StepOutcome> {
        let graph = self.graph(course_id).await?;
        let candidates = self
            .navigation
            .get_next_nodes(&graph, node_id, learner_id, None)
            .await?;
        let next_node = candidates.first().map(|c| c.node.clone());

        let progress = self
            .progress
            .advance(
                ctx,
                &graph,
                learner_id,
                node_id,
                next_node.as_ref().map(|n| &n.id),
                time_spent_secs,
            )
            .await?;

        let due_reviews = self
            .scheduler
            .get_due_items(ctx, learner_id, self.config.scheduler.due_limit)
            .await?;

        tracing::debug!(
            request_id = %ctx.request_id,
            learner_id = %learner_id,
            node_id = %node_id,
            next_node_id = ?next_node.as_ref().map(|n| n.id.as_str()),
            "node completed"
        );

        Ok(StepOutcome {
            next_node,
            candidates,
            mastery: None,
            attempt: None,
            remediation: None,
            progress,
            due_reviews,
        })
    }

    /// Nodes likely to follow the learner's current position. Read-only: a
    /// learner who never enrolled is looked ahead from the entry node.
    pub async fn prefetch(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
        course_id: &CourseId,
        count: usize,
    ) -> EngineResult<Vec<LearningNode>> {
        let graph = self.graph(course_id).await?;
        let progress = self.store.get_progress(learner_id, course_id).await?;
        let current = match progress {
            Some(progress) => progress.current_node_id,
            None => Some(graph.entry_node().id.clone()),
        };
        let Some(current) = current else {
            return Ok(Vec::new());
        };

        let nodes = self
            .navigation
            .lookahead(&graph, &current, learner_id, count)
            .await?;
        tracing::debug!(
            request_id = %ctx.request_id,
            from = %current,
            found = nodes.len(),
            "prefetch"
        );
        Ok(nodes)
    }

    pub async fn review_queue(
        &self,
        ctx: &RequestContext,
        learner_id: &LearnerId,
    ) -> EngineResult<Vec<ReviewSchedule>> {
        self.scheduler
            .get_interleaved_queue(ctx, learner_id, self.config.scheduler.due_limit)
            .await
    }

    pub async fn submit_review(
        &self,
        ctx: &RequestContext,
        schedule_id: ScheduleId,
        quality: Quality,
    ) -> EngineResult<ReviewOutcome> {
        self
            .scheduler
            .process_review(ctx, schedule_id, quality)
            .await
    }
}
