use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    AttemptId, ConceptId, CourseId, ItemId, LearnerId, MisconceptionId, NodeId, ScheduleId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    #[default]
    Stable,
}

impl Trend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Declining => "declining",
            Self::Stable => "stable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "improving" => Some(Self::Improving),
            "declining" => Some(Self::Declining),
            "stable" => Some(Self::Stable),
            _ => None,
        }
    }
}

/// Per-(learner, concept) mastery estimate. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteryState {
    pub learner_id: LearnerId,
    pub concept_id: ConceptId,
    pub mastery_score: f64,
    pub confidence: f64,
    pub attempts: u32,
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub trend: Trend,
    /// Most recent observed scores, oldest first.
    pub recent_scores: Vec<f64>,
    pub last_seen: DateTime<Utc>,
    /// Optimistic-lock version; 0 means not yet persisted.
    pub version: i64,
}

/// SM-2 schedule for one (learner, item) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSchedule {
    pub id: ScheduleId,
    pub learner_id: LearnerId,
    pub item_id: ItemId,
    pub concept_id: Option<ConceptId>,
    pub easiness_factor: f64,
    pub interval_days: i64,
    pub repetition_number: u32,
    pub next_review_at: DateTime<Utc>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub streak: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl ReviewSchedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_review_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
}

impl ProgressStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgress {
    pub learner_id: LearnerId,
    pub course_id: CourseId,
    /// `None` once the course is complete.
    pub current_node_id: Option<NodeId>,
    pub completed_node_ids: BTreeSet<NodeId>,
    pub completion_percentage: f64,
    pub status: ProgressStatus,
    pub total_time_spent_secs: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl CourseProgress {
    pub fn is_completed(&self) -> bool {
        self.status == ProgressStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionAttempt {
    pub id: AttemptId,
    pub learner_id: LearnerId,
    pub node_id: NodeId,
    pub answer: serde_json::Value,
    pub is_correct: bool,
    /// 1-based per (learner, node); assigned by the store.
    pub attempt_number: u32,
    pub detected_misconception_id: Option<MisconceptionId>,
    pub triggered_remediation: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Misconception {
    pub id: MisconceptionId,
    pub concept_id: ConceptId,
    pub label: String,
    pub occurrence_count: u64,
}
