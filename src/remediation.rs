//! Remediation budget accounting and failure routing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RemediationConfig;
use crate::error::{EngineError, EngineResult};
use crate::graph::{CourseGraph, LearningNode};
use crate::ids::LearnerId;
use crate::navigation::Candidate;
use crate::store::{Store, StoreError};
use crate::types::InteractionAttempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationDecision {
    pub eligible: bool,
    pub remaining_budget: u32,
}

/// Where a failed interaction goes next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRoute {
    pub next: Option<LearningNode>,
    /// True when a remediation node was chosen; the attempt must be flagged.
    pub detour: bool,
    pub decision: RemediationDecision,
}

#[derive(Clone)]
pub struct RemediationController {
    store: Arc<dyn Store>,
    config: RemediationConfig,
}

impl RemediationController {
    pub fn new(store: Arc<dyn Store>, config: RemediationConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RemediationConfig {
        &self.config
    }

    pub async fn should_trigger_remediation(
        &self,
        learner_id: &LearnerId,
        node: &LearningNode,
    ) -> EngineResult<RemediationDecision> {
        let used = self
            .store
            .count_remediation_attempts(learner_id, &node.id)
            .await?;
        let remaining_budget = node.remediation_budget.saturating_sub(used);
        Ok(RemediationDecision {
            eligible: remaining_budget > 0,
            remaining_budget,
        })
    }

    /// Exit taken once the budget is spent. Graphs are validated on load, so a
    /// missing fallback here means the course bypassed validation.
    pub fn get_fallback_node<'g>(
        &self,
        graph: &'g CourseGraph,
        node: &LearningNode,
    ) -> EngineResult<&'g LearningNode> {
        let fallback = node.fallback_node_id.as_ref().ok_or_else(|| {
            EngineError::Configuration(format!(
                "node {} in course {} has no fallback node",
                node.id, node.course_id
            ))
        })?;
        graph.node(fallback)
    }

    /// Applies the budget to a failed interaction's ranked candidates.
    pub async fn route_failure(
        &self,
        graph: &CourseGraph,
        node: &LearningNode,
        learner_id: &LearnerId,
        candidates: &[Candidate],
    ) -> EngineResult<FailureRoute> {
        let decision = self.should_trigger_remediation(learner_id, node).await?;

        let Some(best) = candidates.first() else {
            // nowhere to go on failure: the fallback keeps the learner moving,
            // otherwise the course ends here
            let next = match node.fallback_node_id {
                Some(_) => Some(self.get_fallback_node(graph, node)?.clone()),
                None => None,
            };
            return Ok(FailureRoute {
                next,
                detour: false,
                decision,
            });
        };

        if !best.node.is_remediation() {
            return Ok(FailureRoute {
                next: Some(best.node.clone()),
                detour: false,
                decision,
            });
        }

        if decision.eligible {
            tracing::debug!(
                learner_id = %learner_id,
                node_id = %node.id,
                remediation_node_id = %best.node.id,
                remaining_budget = decision.remaining_budget,
                "remediation detour"
            );
            return Ok(FailureRoute {
                next: Some(best.node.clone()),
                detour: true,
                decision,
            });
        }

        let fallback = self.get_fallback_node(graph, node)?;
        tracing::info!(
            learner_id = %learner_id,
            node_id = %node.id,
            fallback_node_id = %fallback.id,
            "remediation budget exhausted, taking fallback"
        );
        Ok(FailureRoute {
            next: Some(fallback.clone()),
            detour: false,
            decision,
        })
    }

    /// Persists a failed attempt under `route`. A detour is written through the
    /// store's budget-guarded insert; if a concurrent request spent the last
    /// unit of budget first, the route switches to the fallback and the
    /// attempt is stored unflagged.
    pub async fn commit_failure(
        &self,
        graph: &CourseGraph,
        node: &LearningNode,
        route: FailureRoute,
        attempt: &InteractionAttempt,
    ) -> EngineResult<(FailureRoute, InteractionAttempt)> {
        if !route.detour {
            let mut unflagged = attempt.clone();
            unflagged.triggered_remediation = false;
            let stored = self.store.record_attempt(&unflagged).await?;
            return Ok((route, stored));
        }

        match self
            .store
            .record_remediation_attempt(attempt, node.remediation_budget)
            .await
        {
            Ok(stored) => Ok((route, stored)),
            Err(StoreError::Conflict {
                entity: "remediation_budget",
                ..
            }) => {
                let fallback = self.get_fallback_node(graph, node)?;
                tracing::info!(
                    learner_id = %attempt.learner_id,
                    node_id = %node.id,
                    fallback_node_id = %fallback.id,
                    "remediation budget spent by a concurrent attempt, taking fallback"
                );
                let route = FailureRoute {
                    next: Some(fallback.clone()),
                    detour: false,
                    decision: RemediationDecision {
                        eligible: false,
                        remaining_budget: 0,
                    },
                };
                let mut unflagged = attempt.clone();
                unflagged.triggered_remediation = false;
                let stored = self.store.record_attempt(&unflagged).await?;
                Ok((route, stored))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether content generation may produce a deeper remediation hop below
    /// `node`.
    pub fn can_deepen(&self, node: &LearningNode) -> bool {
        node.remediation_hop < self.config.max_remediation_hops
    }
}
