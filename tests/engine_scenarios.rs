mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use common::{memory_engine, COURSE, CONCEPT};
use danci_course_engine::ids::{ConceptId, CourseId, ItemId, LearnerId, MisconceptionId, NodeId};
use danci_course_engine::mastery::MasteryUpdate;
use danci_course_engine::remediation::RemediationDecision;
use danci_course_engine::scheduler::Quality;
use danci_course_engine::store::Store;
use danci_course_engine::types::{Misconception, ProgressStatus, Trend};
use danci_course_engine::{EngineError, InteractionInput, RequestContext};

fn current(progress: &danci_course_engine::types::CourseProgress) -> Option<&str> {
    progress.current_node_id.as_ref().map(NodeId::as_str)
}

#[tokio::test]
async fn walkthrough_with_one_remediation_detour() {
    let (engine, store) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("ada");
    let course = CourseId::from(COURSE);
    let mut visited = Vec::new();

    let progress = engine.enroll(&ctx, &learner, &course).await.unwrap();
    visited.push(current(&progress).unwrap().to_string());

    for node in ["hook", "story"] {
        let step = engine
            .complete_node(&ctx, &learner, &course, &node.into(), 10)
            .await
            .unwrap();
        visited.push(current(&step.progress).unwrap().to_string());
    }

    let failed = engine
        .submit_interaction(
            &ctx,
            &learner,
            &course,
            &"quiz".into(),
            InteractionInput::new(json!({"choice": "2/6"}), false),
        )
        .await
        .unwrap();
    let route = failed.remediation.clone().unwrap();
    assert!(route.detour);
    assert_eq!(route.decision, RemediationDecision { eligible: true, remaining_budget: 1 });
    assert!(failed.attempt.as_ref().unwrap().triggered_remediation);
    visited.push(current(&failed.progress).unwrap().to_string());

    let back = engine
        .complete_node(&ctx, &learner, &course, &"retry".into(), 30)
        .await
        .unwrap();
    visited.push(current(&back.progress).unwrap().to_string());

    let passed = engine
        .submit_interaction(
            &ctx,
            &learner,
            &course,
            &"quiz".into(),
            InteractionInput::new(json!({"choice": "1/2"}), true),
        )
        .await
        .unwrap();
    assert!(passed.remediation.is_none());
    assert_eq!(passed.attempt.as_ref().unwrap().attempt_number, 2);
    visited.push(current(&passed.progress).unwrap().to_string());

    let done = engine
        .complete_node(&ctx, &learner, &course, &"wrap-up".into(), 5)
        .await
        .unwrap();

    assert_eq!(visited, vec!["hook", "story", "quiz", "retry", "quiz", "wrap-up"]);
    assert!(done.next_node.is_none());
    assert_eq!(done.progress.status, ProgressStatus::Completed);
    assert_eq!(done.progress.completion_percentage, 100.0);
    assert!(!done.progress.completed_node_ids.contains(&NodeId::from("retry")));
    assert_eq!(done.progress.total_time_spent_secs, 55);

    let attempts = store.attempts_for(&learner, &NodeId::from("quiz"));
    assert_eq!(attempts.len(), 2);
}

#[tokio::test]
async fn exhausted_budget_routes_to_fallback() {
    let (engine, _) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("bo");
    let course = CourseId::from(COURSE);
    engine.enroll(&ctx, &learner, &course).await.unwrap();

    let wrong = || InteractionInput::new(json!({"choice": "3/5"}), false);

    let first = engine
        .submit_interaction(&ctx, &learner, &course, &"quiz".into(), wrong())
        .await
        .unwrap();
    assert_eq!(first.next_node.unwrap().id.as_str(), "retry");

    let second = engine
        .submit_interaction(&ctx, &learner, &course, &"quiz".into(), wrong())
        .await
        .unwrap();
    let route = second.remediation.unwrap();
    assert_eq!(route.decision, RemediationDecision { eligible: false, remaining_budget: 0 });
    assert!(!route.detour);
    assert_eq!(second.next_node.unwrap().id.as_str(), "wrap-up");
    assert!(!second.attempt.unwrap().triggered_remediation);

    let graph = engine.graph(&course).await.unwrap();
    let quiz = graph.node(&"quiz".into()).unwrap();
    let decision = engine
        .remediation()
        .should_trigger_remediation(&learner, quiz)
        .await
        .unwrap();
    assert_eq!(decision, RemediationDecision { eligible: false, remaining_budget: 0 });
    let fallback = engine
        .remediation()
        .get_fallback_node(&graph, quiz)
        .unwrap();
    assert_eq!(fallback.id.as_str(), "wrap-up");
}

#[tokio::test]
async fn five_correct_answers_build_mastery() {
    let (engine, _) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("cy");
    let concept = ConceptId::from("decimals");

    let mut previous = engine
        .mastery()
        .mastery_score(&learner, &concept)
        .await
        .unwrap();
    let mut last = None;
    for _ in 0..5 {
        let state = engine
            .mastery()
            .update(&ctx, &learner, &concept, MasteryUpdate::correct())
            .await
            .unwrap();
        assert!(state.mastery_score > previous);
        previous = state.mastery_score;
        last = Some(state);
    }

    let state = last.unwrap();
    assert!((state.confidence - 0.55).abs() < 1e-9);
    assert_eq!(state.attempts, 5);
    assert_eq!(state.correct_count, 5);
    assert_eq!(state.trend, Trend::Improving);
}

#[tokio::test]
async fn misconception_is_linked_to_attempt() {
    let (engine, store) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("di");
    let course = CourseId::from(COURSE);
    let misconception = Misconception {
        id: MisconceptionId::new(),
        concept_id: ConceptId::from(CONCEPT),
        label: "adds-denominators".to_string(),
        occurrence_count: 0,
    };
    store.save_misconception(&misconception).await.unwrap();

    let step = engine
        .submit_interaction(
            &ctx,
            &learner,
            &course,
            &"quiz".into(),
            InteractionInput::new(json!({"choice": "2/6"}), false)
                .with_misconception("adds-denominators"),
        )
        .await
        .unwrap();
    assert_eq!(
        step.attempt.unwrap().detected_misconception_id,
        Some(misconception.id)
    );

    let stored = store
        .find_misconception(&ConceptId::from(CONCEPT), "adds-denominators")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.occurrence_count, 1);

    // unknown tags never fail the learner-facing flow
    let step = engine
        .submit_interaction(
            &ctx,
            &learner,
            &course,
            &"quiz".into(),
            InteractionInput::new(json!({"choice": "9"}), false).with_misconception("no-such-tag"),
        )
        .await
        .unwrap();
    assert!(step.attempt.unwrap().detected_misconception_id.is_none());
}

#[tokio::test]
async fn invalid_partial_credit_is_rejected_before_any_write() {
    let (engine, store) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("ed");
    let course = CourseId::from(COURSE);

    let mut input = InteractionInput::new(json!(null), true);
    input.score = Some(1.5);
    let err = engine
        .submit_interaction(&ctx, &learner, &course, &"quiz".into(), input)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(store.attempts_for(&learner, &NodeId::from("quiz")).is_empty());
    assert!(store
        .get_mastery(&learner, &ConceptId::from(CONCEPT))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn completed_course_rejects_interactions_without_writing() {
    let (engine, store) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("eli");
    let course = CourseId::from(COURSE);
    let quiz = NodeId::from("quiz");

    engine.enroll(&ctx, &learner, &course).await.unwrap();
    engine
        .submit_interaction(
            &ctx,
            &learner,
            &course,
            &quiz,
            InteractionInput::new(json!({"choice": "1/2"}), true),
        )
        .await
        .unwrap();
    let done = engine
        .complete_node(&ctx, &learner, &course, &"wrap-up".into(), 5)
        .await
        .unwrap();
    assert_eq!(done.progress.status, ProgressStatus::Completed);

    let mastery_before = store
        .get_mastery(&learner, &ConceptId::from(CONCEPT))
        .await
        .unwrap();
    let schedule_before = store
        .get_active_schedule(&learner, &ItemId::from("quiz"))
        .await
        .unwrap();

    let err = engine
        .submit_interaction(
            &ctx,
            &learner,
            &course,
            &quiz,
            InteractionInput::new(json!({"choice": "2/6"}), false),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mastery_after = store
        .get_mastery(&learner, &ConceptId::from(CONCEPT))
        .await
        .unwrap();
    assert_eq!(mastery_after, mastery_before);
    assert_eq!(store.attempts_for(&learner, &quiz).len(), 1);
    let flagged = store
        .count_remediation_attempts(&learner, &quiz)
        .await
        .unwrap();
    assert_eq!(flagged, 0);
    assert_eq!(
        store
            .get_active_schedule(&learner, &ItemId::from("quiz"))
            .await
            .unwrap(),
        schedule_before
    );
    let progress = store
        .get_progress(&learner, &course)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress, done.progress);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_never_overspend_the_budget() {
    let (engine, store) = memory_engine().await;
    let engine = Arc::new(engine);
    let learner = LearnerId::from("flo");
    let course = CourseId::from(COURSE);
    engine
        .enroll(&RequestContext::new(), &learner, &course)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        let learner = learner.clone();
        let course = course.clone();
        handles.push(tokio::spawn(async move {
            engine
                .submit_interaction(
                    &RequestContext::new(),
                    &learner,
                    &course,
                    &"quiz".into(),
                    InteractionInput::new(json!({ "choice": i }), false),
                )
                .await
        }));
    }

    let mut detours = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(step) => {
                if step.attempt.unwrap().triggered_remediation {
                    detours += 1;
                }
            }
            // losers of a mastery or progress race are asked to retry
            Err(err) => assert!(err.is_retryable(), "unexpected error: {err}"),
        }
    }

    let flagged = store
        .count_remediation_attempts(&learner, &NodeId::from("quiz"))
        .await
        .unwrap();
    assert!(flagged <= 1, "budget 1 but {flagged} flagged attempts");
    assert!(detours <= flagged);
}

#[tokio::test]
async fn prefetch_looks_ahead_from_current_node() {
    let (engine, _) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("fi");
    let course = CourseId::from(COURSE);

    let ahead = engine.prefetch(&ctx, &learner, &course, 3).await.unwrap();
    let ids: Vec<&str> = ahead.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["story", "quiz", "wrap-up"]);

    let ahead = engine.prefetch(&ctx, &learner, &course, 10).await.unwrap();
    assert_eq!(ahead.len(), 4);
}

#[tokio::test]
async fn answered_nodes_come_back_for_review() {
    let (engine, _) = memory_engine().await;
    let start = Utc::now();
    let learner = LearnerId::from("gu");
    let course = CourseId::from(COURSE);

    let step = engine
        .submit_interaction(
            &RequestContext::at(start),
            &learner,
            &course,
            &"quiz".into(),
            InteractionInput::new(json!({"choice": "1/2"}), true),
        )
        .await
        .unwrap();
    assert!(step.due_reviews.is_empty());

    let later = RequestContext::at(start + Duration::days(2));
    let queue = engine.review_queue(&later, &learner).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].item_id.as_str(), "quiz");

    let outcome = engine
        .submit_review(&later, queue[0].id, Quality::new(5).unwrap())
        .await
        .unwrap();
    assert_eq!(outcome.previous_interval_days, 1);
    assert_eq!(outcome.schedule.repetition_number, 1);
    assert!(engine.review_queue(&later, &learner).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_course_and_node_are_not_found() {
    let (engine, _) = memory_engine().await;
    let ctx = RequestContext::new();
    let learner = LearnerId::from("ha");

    let err = engine
        .enroll(&ctx, &learner, &CourseId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "course", .. }));

    let err = engine
        .complete_node(&ctx, &learner, &CourseId::from(COURSE), &"nowhere".into(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "node", .. }));
}
