//! Per-(learner, course) progress through a course graph.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::graph::CourseGraph;
use crate::ids::{LearnerId, NodeId};
use crate::store::{progress_key, Store, StoreError};
use crate::types::{CourseProgress, ProgressStatus};

pub fn completion_percentage(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((completed as f64) / (total as f64) * 100.0).min(100.0)
}

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn Store>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Enrolls the learner at the course entry node on first call.
    pub async fn get_or_create_progress(
        &self,
        ctx: &RequestContext,
        graph: &CourseGraph,
        learner_id: &LearnerId,
    ) -> EngineResult<CourseProgress> {
        let course_id = &graph.course().id;
        if let Some(progress) = self.store.get_progress(learner_id, course_id).await? {
            return Ok(progress);
        }

        let progress = CourseProgress {
            learner_id: learner_id.clone(),
            course_id: course_id.clone(),
            current_node_id: Some(graph.entry_node().id.clone()),
            completed_node_ids: BTreeSet::new(),
            completion_percentage: 0.0,
            status: ProgressStatus::InProgress,
            total_time_spent_secs: 0,
            started_at: ctx.now,
            updated_at: ctx.now,
            completed_at: None,
            version: 0,
        };

        match self.store.put_progress(&progress).await {
            Ok(stored) => {
                tracing::info!(
                    learner_id = %learner_id,
                    course_id = %course_id,
                    "learner enrolled"
                );
                Ok(stored)
            }
            Err(StoreError::Conflict { .. }) => self
                .store
                .get_progress(learner_id, course_id)
                .await?
                .ok_or_else(|| EngineError::ConcurrencyConflict {
                    entity: "course_progress",
                    key: progress_key(learner_id, course_id),
                }),
            Err(err) => Err(err.into()),
        }
    }

    /// Marks `completed` done and moves the learner to `next`; `None` finishes
    /// the course. Remediation nodes are never counted as completed.
    pub async fn advance(
        &self,
        ctx: &RequestContext,
        graph: &CourseGraph,
        learner_id: &LearnerId,
        completed: &NodeId,
        next: Option<&NodeId>,
        time_spent_secs: u64,
    ) -> EngineResult<CourseProgress> {
        let completed_node = graph.node(completed)?;
        if let Some(next) = next {
            graph.node(next)?;
        }

        let mut progress = self.get_or_create_progress(ctx, graph, learner_id).await?;
        if progress.is_completed() {
            return match next {
                None => Ok(progress),
                Some(next) => Err(EngineError::validation(format!(
                    "course {} is already completed, cannot move to {next}",
                    graph.course().id
                ))),
            };
        }

        if !completed_node.is_remediation() {
            progress.completed_node_ids.insert(completed.clone());
        }
        progress.current_node_id = next.cloned();
        progress.completion_percentage = completion_percentage(
            progress.completed_node_ids.len(),
            graph.total_non_remediation_nodes(),
        );
        progress.total_time_spent_secs = progress
            .total_time_spent_secs
            .saturating_add(time_spent_secs);
        progress.updated_at = ctx.now;
        if next.is_none() {
            progress.status = ProgressStatus::Completed;
            progress.completed_at = Some(ctx.now);
        }

        let stored = self.store.put_progress(&progress).await?;
        tracing::debug!(
            learner_id = %learner_id,
            course_id = %stored.course_id,
            completed_node_id = %completed,
            next_node_id = ?stored.current_node_id.as_ref().map(NodeId::as_str),
            completion = stored.completion_percentage,
            "progress advanced"
        );
        if stored.is_completed() {
            tracing::info!(
                learner_id = %learner_id,
                course_id = %stored.course_id,
                "course completed"
            );
        }
        Ok(stored)
    }
}
