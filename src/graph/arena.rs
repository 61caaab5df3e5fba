use std::collections::HashMap;
use std::fmt;

use super::{Course, CourseDefinition, EdgeCondition, LearningEdge, LearningNode, NodeType};
use crate::error::{EngineError, EngineResult};
use crate::ids::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphIssue {
    pub rule: &'static str,
    pub message: String,
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Validated, immutable course graph.
///
/// Nodes live in an arena addressed by index; each node keeps the indices of its
/// outgoing edges in declaration order. Traversals track visited indices
/// explicitly and never recurse.
#[derive(Debug, Clone)]
pub struct CourseGraph {
    course: Course,
    entry: usize,
    nodes: Vec<LearningNode>,
    index: HashMap<NodeId, usize>,
    edges: Vec<LearningEdge>,
    outgoing: Vec<Vec<usize>>,
    non_remediation_total: usize,
}

impl CourseGraph {
    /// Builds the arena, rejecting any authoring mistake that would surface
    /// during playback.
    pub fn build(definition: CourseDefinition, max_remediation_hops: u32) -> EngineResult<Self> {
        let issues = validate(&definition, max_remediation_hops);
        if !issues.is_empty() {
            let joined = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::Configuration(format!(
                "course {}: {joined}",
                definition.course.id
            )));
        }

        let CourseDefinition {
            course,
            nodes,
            edges,
        } = definition;

        let index: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();

        let mut outgoing = vec![Vec::new(); nodes.len()];
        for (edge_idx, edge) in edges.iter().enumerate() {
            // endpoints were checked by validate
            if let Some(&source) = index.get(&edge.source_node_id) {
                outgoing[source].push(edge_idx);
            }
        }

        let entry = course
            .entry_node_id
            .as_ref()
            .and_then(|id| index.get(id).copied())
            .ok_or_else(|| {
                EngineError::Configuration(format!("course {} has no entry node", course.id))
            })?;

        let non_remediation_total = nodes.iter().filter(|n| !n.is_remediation()).count();

        Ok(Self {
            course,
            entry,
            nodes,
            index,
            edges,
            outgoing,
            non_remediation_total,
        })
    }

    pub fn course(&self) -> &Course {
        &self.course
    }

    pub fn entry_node(&self) -> &LearningNode {
        &self.nodes[self.entry]
    }

    pub fn nodes(&self) -> &[LearningNode] {
        &self.nodes
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node_at(&self, idx: usize) -> &LearningNode {
        &self.nodes[idx]
    }

    pub fn node(&self, id: &NodeId) -> EngineResult<&LearningNode> {
        self.index_of(id)
            .map(|idx| &self.nodes[idx])
            .ok_or_else(|| EngineError::not_found("node", id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Outgoing edges of the node at `idx`, in declaration order.
    pub fn outgoing(&self, idx: usize) -> impl Iterator<Item = &LearningEdge> + '_ {
        self.outgoing[idx].iter().map(move |&e| &self.edges[e])
    }

    pub fn total_non_remediation_nodes(&self) -> usize {
        self.non_remediation_total
    }
}

fn validate(definition: &CourseDefinition, max_remediation_hops: u32) -> Vec<GraphIssue> {
    let mut issues = Vec::new();
    let course = &definition.course;

    let mut nodes: HashMap<&NodeId, &LearningNode> = HashMap::new();
    for node in &definition.nodes {
        if nodes.insert(&node.id, node).is_some() {
            issues.push(issue("G1", format!("duplicate node id {}", node.id)));
        }
        if node.course_id != course.id {
            issues.push(issue(
                "G2",
                format!("node {} belongs to course {}", node.id, node.course_id),
            ));
        }
    }

    match &course.entry_node_id {
        None => issues.push(issue("G3", "missing entry node".to_string())),
        Some(entry) if !nodes.contains_key(entry) => {
            issues.push(issue("G3", format!("entry node {entry} does not exist")));
        }
        Some(_) => {}
    }

    for edge in &definition.edges {
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            if !nodes.contains_key(endpoint) {
                issues.push(issue(
                    "G4",
                    format!(
                        "edge {} -> {} references unknown node {endpoint}",
                        edge.source_node_id, edge.target_node_id
                    ),
                ));
            }
        }
        if !edge.weight.is_finite() || edge.weight <= 0.0 {
            issues.push(issue(
                "G5",
                format!(
                    "edge {} -> {} has invalid weight {}",
                    edge.source_node_id, edge.target_node_id, edge.weight
                ),
            ));
        }
        if let Some(t) = edge.condition.threshold() {
            if !(0.0..=1.0).contains(&t) {
                issues.push(issue(
                    "G6",
                    format!(
                        "edge {} -> {} has mastery threshold {t} outside [0, 1]",
                        edge.source_node_id, edge.target_node_id
                    ),
                ));
            }
        }
    }

    for node in &definition.nodes {
        if let Some(fallback) = &node.fallback_node_id {
            if !nodes.contains_key(fallback) {
                issues.push(issue(
                    "G7",
                    format!("node {} falls back to unknown node {fallback}", node.id),
                ));
            }
        } else if routes_to_remediation(definition, &nodes, &node.id) {
            issues.push(issue(
                "G8",
                format!(
                    "node {} routes failures to remediation (budget {}) but has no fallback node",
                    node.id, node.remediation_budget
                ),
            ));
        }

        if node.node_type == NodeType::Remediation {
            match &node.parent_node_id {
                None => issues.push(issue(
                    "G9",
                    format!("remediation node {} has no parent node", node.id),
                )),
                Some(parent) if !nodes.contains_key(parent) => issues.push(issue(
                    "G9",
                    format!("remediation node {} has unknown parent {parent}", node.id),
                )),
                Some(_) => {}
            }
            if node.remediation_hop == 0 || node.remediation_hop > max_remediation_hops {
                issues.push(issue(
                    "G10",
                    format!(
                        "remediation node {} has hop {} outside 1..={max_remediation_hops}",
                        node.id, node.remediation_hop
                    ),
                ));
            }
        }
    }

    issues
}

fn routes_to_remediation(
    definition: &CourseDefinition,
    nodes: &HashMap<&NodeId, &LearningNode>,
    node_id: &NodeId,
) -> bool {
    definition.edges.iter().any(|edge| {
        &edge.source_node_id == node_id
            && edge.condition == EdgeCondition::Fail
            && nodes
                .get(&edge.target_node_id)
                .is_some_and(|target| target.is_remediation())
    })
}

fn issue(rule: &'static str, message: String) -> GraphIssue {
    GraphIssue { rule, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeCondition as C, LearningEdge as E, LearningNode as N};
    use crate::ids::CourseId;

    fn course(entry: Option<&str>) -> Course {
        Course {
            id: CourseId::from("c1"),
            title: "Fractions".to_string(),
            entry_node_id: entry.map(NodeId::from),
        }
    }

    fn linear() -> CourseDefinition {
        CourseDefinition {
            course: course(Some("h")),
            nodes: vec![
                N::new("h", "c1", NodeType::Hook),
                N::new("i", "c1", NodeType::Interaction)
                    .with_concept("fractions")
                    .with_remediation(1, "s"),
                N::new("r", "c1", NodeType::Remediation).remediating("i", 1),
                N::new("s", "c1", NodeType::Summary),
            ],
            edges: vec![
                E::new("h", "i", C::Always, 1.0),
                E::new("i", "s", C::Pass, 1.0),
                E::new("i", "r", C::Fail, 1.0),
                E::new("r", "i", C::Always, 1.0),
            ],
        }
    }

    fn config_error(result: EngineResult<CourseGraph>) -> String {
        match result {
            Err(EngineError::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn builds_arena_with_declaration_ordered_edges() {
        let graph = CourseGraph::build(linear(), 2).unwrap();
        assert_eq!(graph.entry_node().id, NodeId::from("h"));
        assert_eq!(graph.total_non_remediation_nodes(), 3);

        let i = graph.index_of(&NodeId::from("i")).unwrap();
        let targets: Vec<&str> = graph
            .outgoing(i)
            .map(|e| e.target_node_id.as_str())
            .collect();
        assert_eq!(targets, vec!["s", "r"]);
    }

    #[test]
    fn missing_entry_node_fails_at_load() {
        let mut def = linear();
        def.course = course(None);
        assert!(config_error(CourseGraph::build(def, 2)).contains("missing entry node"));
    }

    #[test]
    fn edge_to_unknown_node_fails_at_load() {
        let mut def = linear();
        def.edges.push(E::new("s", "ghost", C::Always, 1.0));
        assert!(config_error(CourseGraph::build(def, 2)).contains("ghost"));
    }

    #[test]
    fn remediation_route_without_fallback_fails_at_load() {
        let mut def = linear();
        def.nodes[1].fallback_node_id = None;
        def.nodes[1].remediation_budget = 0;
        assert!(config_error(CourseGraph::build(def, 2)).contains("[G8]"));
    }

    #[test]
    fn remediation_hop_above_limit_fails_at_load() {
        let mut def = linear();
        def.nodes[2].remediation_hop = 3;
        assert!(config_error(CourseGraph::build(def, 2)).contains("[G10]"));
    }

    #[test]
    fn non_positive_weight_fails_at_load() {
        let mut def = linear();
        def.edges[0].weight = 0.0;
        assert!(config_error(CourseGraph::build(def, 2)).contains("[G5]"));
    }

    #[test]
    fn unknown_node_lookup_is_not_found() {
        let graph = CourseGraph::build(linear(), 2).unwrap();
        assert!(matches!(
            graph.node(&NodeId::from("nope")),
            Err(EngineError::NotFound { kind: "node", .. })
        ));
    }
}
