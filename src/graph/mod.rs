//! Learning-content graph: authored nodes and conditional edges.
//!
//! Contains:
//! - node and edge types as authored
//! - `CourseGraph`, the validated arena navigation runs on
//! - `GraphCache`, a read-through cache of immutable graphs

mod arena;
mod cache;

pub use arena::{CourseGraph, GraphIssue};
pub use cache::GraphCache;

use serde::{Deserialize, Serialize};

use crate::ids::{ConceptId, CourseId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Hook,
    Narrative,
    Explanation,
    Interaction,
    Remediation,
    Summary,
}

impl NodeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hook => "hook",
            Self::Narrative => "narrative",
            Self::Explanation => "explanation",
            Self::Interaction => "interaction",
            Self::Remediation => "remediation",
            Self::Summary => "summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hook" => Some(Self::Hook),
            "narrative" => Some(Self::Narrative),
            "explanation" => Some(Self::Explanation),
            "interaction" => Some(Self::Interaction),
            "remediation" => Some(Self::Remediation),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningNode {
    pub id: NodeId,
    pub course_id: CourseId,
    pub node_type: NodeType,
    pub concept_id: Option<ConceptId>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub remediation_budget: u32,
    pub fallback_node_id: Option<NodeId>,
    /// Set on remediation nodes: the node whose failure they remediate.
    pub parent_node_id: Option<NodeId>,
    #[serde(default)]
    pub remediation_hop: u32,
}

impl LearningNode {
    pub fn new(id: impl Into<NodeId>, course_id: impl Into<CourseId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            course_id: course_id.into(),
            node_type,
            concept_id: None,
            content: serde_json::Value::Null,
            remediation_budget: 0,
            fallback_node_id: None,
            parent_node_id: None,
            remediation_hop: 0,
        }
    }

    pub fn with_concept(mut self, concept_id: impl Into<ConceptId>) -> Self {
        self.concept_id = Some(concept_id.into());
        self
    }

    pub fn with_remediation(mut self, budget: u32, fallback: impl Into<NodeId>) -> Self {
        self.remediation_budget = budget;
        self.fallback_node_id = Some(fallback.into());
        self
    }

    pub fn remediating(mut self, parent: impl Into<NodeId>, hop: u32) -> Self {
        self.parent_node_id = Some(parent.into());
        self.remediation_hop = hop;
        self
    }

    pub fn is_remediation(&self) -> bool {
        self.node_type == NodeType::Remediation
    }
}

/// Predicate gating a transition. Mastery thresholds left unset fall back to
/// the navigation default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "threshold", rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    Pass,
    Fail,
    Optional,
    MasteryLow(Option<f64>),
    MasteryHigh(Option<f64>),
}

impl EdgeCondition {
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Optional => "optional",
            Self::MasteryLow(_) => "mastery_low",
            Self::MasteryHigh(_) => "mastery_high",
        }
    }

    pub fn threshold(&self) -> Option<f64> {
        match self {
            Self::MasteryLow(t) | Self::MasteryHigh(t) => *t,
            _ => None,
        }
    }

    /// Rebuilds a condition from its persisted columns.
    pub fn from_parts(tag: &str, threshold: Option<f64>) -> Option<Self> {
        match tag {
            "always" => Some(Self::Always),
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "optional" => Some(Self::Optional),
            "mastery_low" => Some(Self::MasteryLow(threshold)),
            "mastery_high" => Some(Self::MasteryHigh(threshold)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEdge {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub condition: EdgeCondition,
    pub weight: f64,
}

impl LearningEdge {
    pub fn new(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        condition: EdgeCondition,
        weight: f64,
    ) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            condition,
            weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub title: String,
    pub entry_node_id: Option<NodeId>,
}

/// Everything authored for one course; edges are kept in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseDefinition {
    pub course: Course,
    pub nodes: Vec<LearningNode>,
    pub edges: Vec<LearningEdge>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_round_trips_through_parts() {
        let conditions = [
            EdgeCondition::Always,
            EdgeCondition::Fail,
            EdgeCondition::MasteryLow(Some(0.4)),
            EdgeCondition::MasteryHigh(None),
        ];
        for condition in conditions {
            let rebuilt = EdgeCondition::from_parts(condition.tag(), condition.threshold());
            assert_eq!(rebuilt, Some(condition));
        }
    }

    #[test]
    fn unknown_condition_tag_is_rejected() {
        assert_eq!(EdgeCondition::from_parts("sometimes", None), None);
    }

    #[test]
    fn node_type_parse_matches_as_str() {
        for ty in [NodeType::Hook, NodeType::Remediation, NodeType::Summary] {
            assert_eq!(NodeType::parse(ty.as_str()), Some(ty));
        }
    }
}
