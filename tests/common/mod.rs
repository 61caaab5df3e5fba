#![allow(dead_code)]

use std::sync::Arc;

use danci_course_engine::config::EngineConfig;
use danci_course_engine::graph::{
    Course, CourseDefinition, EdgeCondition, LearningEdge, LearningNode, NodeType,
};
use danci_course_engine::ids::{CourseId, NodeId};
use danci_course_engine::store::{MemoryStore, Store};
use danci_course_engine::LearningEngine;

pub const COURSE: &str = "fractions-101";
pub const CONCEPT: &str = "fractions";

/// Hook -> narrative -> interaction -> summary, with one remediation node
/// hanging off the interaction (budget 1, fallback to the summary).
pub fn fractions_course() -> CourseDefinition {
    CourseDefinition {
        course: Course {
            id: CourseId::from(COURSE),
            title: "Adding fractions".to_string(),
            entry_node_id: Some(NodeId::from("hook")),
        },
        nodes: vec![
            LearningNode::new("hook", COURSE, NodeType::Hook),
            LearningNode::new("story", COURSE, NodeType::Narrative).with_concept(CONCEPT),
            LearningNode::new("quiz", COURSE, NodeType::Interaction)
                .with_concept(CONCEPT)
                .with_remediation(1, "wrap-up"),
            LearningNode::new("retry", COURSE, NodeType::Remediation).remediating("quiz", 1),
            LearningNode::new("wrap-up", COURSE, NodeType::Summary),
        ],
        edges: vec![
            LearningEdge::new("hook", "story", EdgeCondition::Always, 1.0),
            LearningEdge::new("story", "quiz", EdgeCondition::Always, 1.0),
            LearningEdge::new("quiz", "wrap-up", EdgeCondition::Pass, 1.0),
            LearningEdge::new("quiz", "retry", EdgeCondition::Fail, 1.0),
            LearningEdge::new("retry", "quiz", EdgeCondition::Always, 1.0),
        ],
    }
}

pub async fn memory_engine() -> (LearningEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store
        .save_course(&fractions_course())
        .await
        .expect("save course");
    let engine = LearningEngine::new(store.clone(), EngineConfig::default());
    (engine, store)
}
