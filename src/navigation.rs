//! Graph navigation: ranking outgoing edges and speculative lookahead.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::{MasteryGateSubject, NavigationConfig};
use crate::error::{EngineError, EngineResult};
use crate::graph::{CourseGraph, EdgeCondition, LearningNode};
use crate::ids::{ConceptId, LearnerId, NodeId};
use crate::mastery::MasteryTracker;

/// A reachable next node with its final weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub node: LearningNode,
    pub weight: f64,
}

/// How `Pass`/`Fail` edges are treated while ranking.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Known(Option<bool>),
    /// Lookahead: the interaction has not happened yet, both branches count.
    Speculative,
}

impl Outcome {
    fn allows(self, passed: bool) -> bool {
        match self {
            Self::Known(result) => result == Some(passed),
            Self::Speculative => true,
        }
    }
}

type MasteryMemo = HashMap<ConceptId, f64>;

#[derive(Clone)]
pub struct NavigationEngine {
    mastery: MasteryTracker,
    config: NavigationConfig,
}

impl NavigationEngine {
    pub fn new(mastery: MasteryTracker, config: NavigationConfig) -> Self {
        Self { mastery, config }
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    /// Eligible successors of `current`, heaviest first. Equal weights keep
    /// edge declaration order.
    pub async fn get_next_nodes(
        &self,
        graph: &CourseGraph,
        current: &NodeId,
        learner_id: &LearnerId,
        interaction_result: Option<bool>,
    ) -> EngineResult<Vec<Candidate>> {
        let idx = graph
            .index_of(current)
            .ok_or_else(|| EngineError::not_found("node", current))?;
        let mut memo = MasteryMemo::new();
        let ranked = self
            .rank(graph, idx, learner_id, Outcome::Known(interaction_result), &mut memo)
            .await?;

        Ok(ranked
            .into_iter()
            .map(|(target, weight)| Candidate {
                node: graph.node_at(target).clone(),
                weight,
            })
            .collect())
    }

    /// `None` marks the end of the path.
    pub async fn get_best_next_node(
        &self,
        graph: &CourseGraph,
        current: &NodeId,
        learner_id: &LearnerId,
        interaction_result: Option<bool>,
    ) -> EngineResult<Option<Candidate>> {
        let candidates = self
            .get_next_nodes(graph, current, learner_id, interaction_result)
            .await?;
        Ok(candidates.into_iter().next())
    }

    /// Breadth-first prefetch of up to `count` distinct nodes reachable from
    /// `start`. The start node itself is never returned.
    pub async fn lookahead(
        &self,
        graph: &CourseGraph,
        start: &NodeId,
        learner_id: &LearnerId,
        count: usize,
    ) -> EngineResult<Vec<LearningNode>> {
        let start = graph
            .index_of(start)
            .ok_or_else(|| EngineError::not_found("node", start))?;

        let mut found = Vec::new();
        if count == 0 {
            return Ok(found);
        }

        let mut memo = MasteryMemo::new();
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        'walk: while let Some(idx) = queue.pop_front() {
            let ranked = self
                .rank(graph, idx, learner_id, Outcome::Speculative, &mut memo)
                .await?;
            for (target, _) in ranked {
                if !visited.insert(target) {
                    continue;
                }
                found.push(graph.node_at(target).clone());
                if found.len() >= count {
                    break 'walk;
                }
                queue.push_back(target);
            }
        }

        Ok(found)
    }

    async fn rank(
        &self,
        graph: &CourseGraph,
        source: usize,
        learner_id: &LearnerId,
        outcome: Outcome,
        memo: &mut MasteryMemo,
    ) -> EngineResult<Vec<(usize, f64)>> {
        let mut ranked = Vec::new();

        for edge in graph.outgoing(source) {
            let Some(target) = graph.index_of(&edge.target_node_id) else {
                continue;
            };

            let multiplier = match edge.condition {
                EdgeCondition::Always => 1.0,
                EdgeCondition::Optional => self.config.optional_multiplier,
                EdgeCondition::Pass if outcome.allows(true) => 1.0,
                EdgeCondition::Fail if outcome.allows(false) => 1.0,
                EdgeCondition::Pass | EdgeCondition::Fail => continue,
                EdgeCondition::MasteryLow(threshold) => {
                    let threshold = threshold.unwrap_or(self.config.default_mastery_threshold);
                    let mastery = self
                        .gate_mastery(graph, source, target, learner_id, memo)
                        .await?;
                    match mastery {
                        Some(mastery) if mastery < threshold => 1.0,
                        _ => continue,
                    }
                }
                EdgeCondition::MasteryHigh(threshold) => {
                    let threshold = threshold.unwrap_or(self.config.default_mastery_threshold);
                    let mastery = self
                        .gate_mastery(graph, source, target, learner_id, memo)
                        .await?;
                    match mastery {
                        Some(mastery) if mastery >= threshold => 1.0,
                        _ => continue,
                    }
                }
            };

            ranked.push((target, edge.weight * multiplier));
        }

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked)
    }

    /// Mastery consulted by a gated edge, or `None` when the gate's node has
    /// no concept and the edge cannot be evaluated.
    async fn gate_mastery(
        &self,
        graph: &CourseGraph,
        source: usize,
        target: usize,
        learner_id: &LearnerId,
        memo: &mut MasteryMemo,
    ) -> EngineResult<Option<f64>> {
        let subject = match self.config.mastery_gate_subject {
            MasteryGateSubject::Target => graph.node_at(target),
            MasteryGateSubject::Source => graph.node_at(source),
        };
        let Some(concept_id) = &subject.concept_id else {
            tracing::debug!(
                node_id = %subject.id,
                "mastery gate on node without concept, edge skipped"
            );
            return Ok(None);
        };

        if let Some(&score) = memo.get(concept_id) {
            return Ok(Some(score));
        }
        let score = self.mastery.mastery_score(learner_id, concept_id).await?;
        memo.insert(concept_id.clone(), score);
        Ok(Some(score))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::MasteryConfig;
    use crate::context::RequestContext;
    use crate::graph::{
        Course, CourseDefinition, EdgeCondition as C, LearningEdge as E, LearningNode as N,
        NodeType,
    };
    use crate::ids::CourseId;
    use crate::mastery::MasteryUpdate;
    use crate::store::MemoryStore;

    fn engine(config: NavigationConfig) -> (NavigationEngine, MasteryTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = MasteryTracker::new(store, MasteryConfig::default());
        (NavigationEngine::new(tracker.clone(), config), tracker)
    }

    fn graph(nodes: Vec<N>, edges: Vec<E>) -> CourseGraph {
        let entry = nodes[0].id.clone();
        CourseGraph::build(
            CourseDefinition {
                course: Course {
                    id: CourseId::from("c1"),
                    title: "Nav".to_string(),
                    entry_node_id: Some(entry),
                },
                nodes,
                edges,
            },
            2,
        )
        .unwrap()
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.node.id.as_str()).collect()
    }

    #[tokio::test]
    async fn fail_only_edge_is_pruned_on_pass() {
        let (nav, _) = engine(NavigationConfig::default());
        let g = graph(
            vec![
                N::new("i", "c1", NodeType::Interaction),
                N::new("x", "c1", NodeType::Explanation),
            ],
            vec![E::new("i", "x", C::Fail, 1.0)],
        );
        let learner = LearnerId::from("u1");

        let next = nav
            .get_next_nodes(&g, &"i".into(), &learner, Some(true))
            .await
            .unwrap();
        assert!(next.is_empty());
        let best = nav
            .get_best_next_node(&g, &"i".into(), &learner, Some(true))
            .await
            .unwrap();
        assert!(best.is_none());
        let failed = nav
            .get_next_nodes(&g, &"i".into(), &learner, Some(false))
            .await
            .unwrap();
        assert_eq!(ids(&failed), vec!["x"]);
    }

    #[tokio::test]
    async fn ranks_by_weight_then_declaration_order() {
        let (nav, _) = engine(NavigationConfig::default());
        let g = graph(
            vec![
                N::new("a", "c1", NodeType::Hook),
                N::new("b", "c1", NodeType::Narrative),
                N::new("c", "c1", NodeType::Narrative),
                N::new("d", "c1", NodeType::Narrative),
                N::new("e", "c1", NodeType::Narrative),
            ],
            vec![
                E::new("a", "b", C::Optional, 2.0),
                E::new("a", "c", C::Always, 1.0),
                E::new("a", "d", C::Always, 3.0),
                E::new("a", "e", C::Always, 1.0),
            ],
        );
        let next = nav
            .get_next_nodes(&g, &"a".into(), &LearnerId::from("u1"), None)
            .await
            .unwrap();
        assert_eq!(ids(&next), vec!["d", "b", "c", "e"]);
        assert_eq!(next[1].weight, 1.0);
    }

    #[tokio::test]
    async fn mastery_gates_read_target_concept() {
        let (nav, tracker) = engine(NavigationConfig::default());
        let g = graph(
            vec![
                N::new("a", "c1", NodeType::Hook),
                N::new("easy", "c1", NodeType::Explanation).with_concept("fractions"),
                N::new("hard", "c1", NodeType::Interaction).with_concept("fractions"),
                N::new("blank", "c1", NodeType::Narrative),
            ],
            vec![
                E::new("a", "easy", C::MasteryLow(None), 1.0),
                E::new("a", "hard", C::MasteryHigh(Some(0.3)), 1.0),
                E::new("a", "blank", C::MasteryHigh(Some(0.0)), 1.0),
            ],
        );
        let learner = LearnerId::from("u1");

        let next = nav
            .get_next_nodes(&g, &"a".into(), &learner, None)
            .await
            .unwrap();
        assert_eq!(ids(&next), vec!["easy"]);

        let ctx = RequestContext::new();
        for _ in 0..3 {
            tracker
                .update(&ctx, &learner, &"fractions".into(), MasteryUpdate::correct())
                .await
                .unwrap();
        }
        let next = nav
            .get_next_nodes(&g, &"a".into(), &learner, None)
            .await
            .unwrap();
        assert_eq!(ids(&next), vec!["easy", "hard"]);
    }

    #[tokio::test]
    async fn source_gate_subject_reads_current_concept() {
        let config = NavigationConfig {
            mastery_gate_subject: MasteryGateSubject::Source,
            ..NavigationConfig::default()
        };
        let (nav, _) = engine(config);
        let g = graph(
            vec![
                N::new("a", "c1", NodeType::Interaction).with_concept("ratios"),
                N::new("b", "c1", NodeType::Narrative),
            ],
            vec![E::new("a", "b", C::MasteryLow(None), 1.0)],
        );
        let next = nav
            .get_next_nodes(&g, &"a".into(), &LearnerId::from("u1"), None)
            .await
            .unwrap();
        assert_eq!(ids(&next), vec!["b"]);
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let (nav, _) = engine(NavigationConfig::default());
        let g = graph(vec![N::new("a", "c1", NodeType::Hook)], vec![]);
        let err = nav
            .get_next_nodes(&g, &"zz".into(), &LearnerId::from("u1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "node", .. }));
    }

    #[tokio::test]
    async fn lookahead_terminates_on_cycles() {
        let (nav, _) = engine(NavigationConfig::default());
        let g = graph(
            vec![
                N::new("a", "c1", NodeType::Hook),
                N::new("b", "c1", NodeType::Interaction),
                N::new("c", "c1", NodeType::Summary),
            ],
            vec![
                E::new("a", "b", C::Always, 1.0),
                E::new("b", "a", C::Fail, 1.0),
                E::new("b", "c", C::Pass, 1.0),
            ],
        );
        let found = nav
            .lookahead(&g, &"a".into(), &LearnerId::from("u1"), 10)
            .await
            .unwrap();
        let found: Vec<&str> = found.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(found, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn lookahead_stops_at_count() {
        let (nav, _) = engine(NavigationConfig::default());
        let g = graph(
            vec![
                N::new("a", "c1", NodeType::Hook),
                N::new("b", "c1", NodeType::Narrative),
                N::new("c", "c1", NodeType::Narrative),
            ],
            vec![E::new("a", "b", C::Always, 1.0), E::new("b", "c", C::Always, 1.0)],
        );
        let learner = LearnerId::from("u1");
        assert_eq!(nav.lookahead(&g, &"a".into(), &learner, 1).await.unwrap().len(), 1);
        assert!(nav.lookahead(&g, &"a".into(), &learner, 0).await.unwrap().is_empty());
    }
}
