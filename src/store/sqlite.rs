use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::schema::{split_sql_statements, ENGINE_SCHEMA_SQL, SCHEMA_VERSION};
use super::{
    attempt_key, mastery_key, progress_key, schedule_key, Store, StoreError, StoreResult,
};
use crate::config::SqliteConfig;
use crate::graph::{Course, CourseDefinition, EdgeCondition, LearningEdge, LearningNode, NodeType};
use crate::ids::{
    AttemptId, ConceptId, CourseId, ItemId, LearnerId, MisconceptionId, NodeId, ScheduleId,
};
use crate::types::{
    CourseProgress, InteractionAttempt, MasteryState, Misconception, ProgressStatus, ReviewSchedule,
    Trend,
};

/// [`Store`] backed by a SQLite database through `sqlx`.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(config: &SqliteConfig) -> StoreResult<Self> {
        Self::open(&config.path, config.busy_timeout, config.max_connections).await
    }

    pub async fn open(
        path: &Path,
        busy_timeout: Duration,
        max_connections: u32,
    ) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn find_attempt(&self, id: AttemptId) -> StoreResult<Option<InteractionAttempt>> {
        let row = sqlx::query(r#"SELECT * FROM "interaction_attempts" WHERE "id" = ?"#)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_attempt).transpose()
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        let version: Option<String> = sqlx::query_scalar(
            r#"SELECT "value" FROM "_db_metadata" WHERE "key" = 'schema_version'"#,
        )
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        if version.as_deref() == Some(SCHEMA_VERSION) {
            return Ok(());
        }

        tracing::info!(from = ?version, to = SCHEMA_VERSION, "applying engine schema");
        for stmt in split_sql_statements(ENGINE_SCHEMA_SQL) {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO "_db_metadata" ("key", "value")
            VALUES ('schema_version', ?)
            "#,
        )
        .bind(SCHEMA_VERSION)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_ms(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

fn from_ms(value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(value)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {value} out of range")))
}

fn opt_from_ms(value: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    value.map(from_ms).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn insert_error(err: sqlx::Error, entity: &'static str, key: String) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict { entity, key }
    } else {
        StoreError::Sqlx(err)
    }
}

fn map_node(row: &SqliteRow) -> StoreResult<LearningNode> {
    let raw_type: String = row.try_get("type")?;
    let node_type = NodeType::parse(&raw_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown node type {raw_type}")))?;
    let content: String = row.try_get("content")?;

    Ok(LearningNode {
        id: NodeId::new(row.try_get::<String, _>("id")?),
        course_id: CourseId::new(row.try_get::<String, _>("course_id")?),
        node_type,
        concept_id: row.try_get::<Option<String>, _>("concept_id")?.map(ConceptId::new),
        content: from_json("content", &content)?,
        remediation_budget: row.try_get::<i64, _>("remediation_budget")?.max(0) as u32,
        fallback_node_id: row.try_get::<Option<String>, _>("fallback_node_id")?.map(NodeId::new),
        parent_node_id: row.try_get::<Option<String>, _>("parent_node_id")?.map(NodeId::new),
        remediation_hop: row.try_get::<i64, _>("remediation_hop")?.max(0) as u32,
    })
}

fn map_mastery(row: &SqliteRow) -> StoreResult<MasteryState> {
    let raw_trend: String = row.try_get("trend")?;
    let recent: String = row.try_get("recent_scores")?;

    Ok(MasteryState {
        learner_id: LearnerId::new(row.try_get::<String, _>("learner_id")?),
        concept_id: ConceptId::new(row.try_get::<String, _>("concept_id")?),
        mastery_score: row.try_get("mastery_score")?,
        confidence: row.try_get("confidence")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        correct_count: row.try_get::<i64, _>("correct_count")? as u32,
        incorrect_count: row.try_get::<i64, _>("incorrect_count")? as u32,
        trend: Trend::parse(&raw_trend)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown trend {raw_trend}")))?,
        recent_scores: from_json("recent_scores", &recent)?,
        last_seen: from_ms(row.try_get("last_seen")?)?,
        version: row.try_get("version")?,
    })
}

fn map_misconception(row: &SqliteRow) -> StoreResult<Misconception> {
    let raw_id: String = row.try_get("id")?;
    Ok(Misconception {
        id: MisconceptionId::parse(&raw_id)
            .ok_or_else(|| StoreError::Corrupt(format!("misconception id {raw_id}")))?,
        concept_id: ConceptId::new(row.try_get::<String, _>("concept_id")?),
        label: row.try_get("label")?,
        occurrence_count: row.try_get::<i64, _>("occurrence_count")?.max(0) as u64,
    })
}

fn map_attempt(row: &SqliteRow) -> StoreResult<InteractionAttempt> {
    let raw_id: String = row.try_get("id")?;
    let answer: String = row.try_get("answer")?;
    let misconception = row
        .try_get::<Option<String>, _>("detected_misconception_id")?
        .and_then(|raw| MisconceptionId::parse(&raw));

    Ok(InteractionAttempt {
        id: AttemptId::parse(&raw_id)
            .ok_or_else(|| StoreError::Corrupt(format!("attempt id {raw_id}")))?,
        learner_id: LearnerId::new(row.try_get::<String, _>("learner_id")?),
        node_id: NodeId::new(row.try_get::<String, _>("node_id")?),
        answer: from_json("answer", &answer)?,
        is_correct: row.try_get("is_correct")?,
        attempt_number: row.try_get::<i64, _>("attempt_number")? as u32,
        detected_misconception_id: misconception,
        triggered_remediation: row.try_get("triggered_remediation")?,
        created_at: from_ms(row.try_get("created_at")?)?,
    })
}

fn map_schedule(row: &SqliteRow) -> StoreResult<ReviewSchedule> {
    let raw_id: String = row.try_get("id")?;
    Ok(ReviewSchedule {
        id: ScheduleId::parse(&raw_id)
            .ok_or_else(|| StoreError::Corrupt(format!("schedule id {raw_id}")))?,
        learner_id: LearnerId::new(row.try_get::<String, _>("learner_id")?),
        item_id: ItemId::new(row.try_get::<String, _>("item_id")?),
        concept_id: row.try_get::<Option<String>, _>("concept_id")?.map(ConceptId::new),
        easiness_factor: row.try_get("easiness_factor")?,
        interval_days: row.try_get("interval_days")?,
        repetition_number: row.try_get::<i64, _>("repetition_number")? as u32,
        next_review_at: from_ms(row.try_get("next_review_at")?)?,
        last_reviewed_at: opt_from_ms(row.try_get("last_reviewed_at")?)?,
        streak: row.try_get::<i64, _>("streak")? as u32,
        is_active: row.try_get("is_active")?,
        created_at: from_ms(row.try_get("created_at")?)?,
        version: row.try_get("version")?,
    })
}

fn map_progress(row: &SqliteRow) -> StoreResult<CourseProgress> {
    let raw_status: String = row.try_get("status")?;
    let completed: String = row.try_get("completed_node_ids")?;
    let completed: BTreeSet<NodeId> = from_json("completed_node_ids", &completed)?;

    Ok(CourseProgress {
        learner_id: LearnerId::new(row.try_get::<String, _>("learner_id")?),
        course_id: CourseId::new(row.try_get::<String, _>("course_id")?),
        current_node_id: row.try_get::<Option<String>, _>("current_node_id")?.map(NodeId::new),
        completed_node_ids: completed,
        completion_percentage: row.try_get("completion_percentage")?,
        status: ProgressStatus::parse(&raw_status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown progress status {raw_status}")))?,
        total_time_spent_secs: row.try_get::<i64, _>("total_time_spent_secs")?.max(0) as u64,
        started_at: from_ms(row.try_get("started_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
        completed_at: opt_from_ms(row.try_get("completed_at")?)?,
        version: row.try_get("version")?,
    })
}

const SCHEDULE_COLUMNS: &str = r#""id","learner_id","item_id","concept_id","easiness_factor",
    "interval_days","repetition_number","next_review_at","last_reviewed_at","streak",
    "is_active","created_at","version""#;

#[async_trait]
impl Store for SqliteStore {
    async fn load_course(&self, course_id: &CourseId) -> StoreResult<Option<CourseDefinition>> {
        let row =
            sqlx::query(r#"SELECT "id","title","entry_node_id" FROM "courses" WHERE "id" = ?"#)
                .bind(course_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let course = Course {
            id: CourseId::new(row.try_get::<String, _>("id")?),
            title: row.try_get("title")?,
            entry_node_id: row.try_get::<Option<String>, _>("entry_node_id")?.map(NodeId::new),
        };

        let node_rows = sqlx::query(
            r#"
            SELECT "id","course_id","type","concept_id","content","remediation_budget",
                   "fallback_node_id","parent_node_id","remediation_hop"
            FROM "learning_nodes"
            WHERE "course_id" = ?
            ORDER BY "position"
            "#,
        )
        .bind(course_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        let nodes = node_rows
            .iter()
            .map(map_node)
            .collect::<StoreResult<Vec<_>>>()?;

        let edge_rows = sqlx::query(
            r#"
            SELECT "source_id","target_id","condition","weight","mastery_threshold"
            FROM "learning_edges"
            WHERE "course_id" = ?
            ORDER BY "position"
            "#,
        )
        .bind(course_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut edges = Vec::with_capacity(edge_rows.len());
        for row in &edge_rows {
            let source: String = row.try_get("source_id")?;
            let target: String = row.try_get("target_id")?;
            let tag: String = row.try_get("condition")?;
            let threshold: Option<f64> = row.try_get("mastery_threshold")?;

            let Some(condition) = EdgeCondition::from_parts(&tag, threshold) else {
                tracing::warn!(
                    course_id = %course_id,
                    source = %source,
                    target = %target,
                    condition = %tag,
                    "ignoring edge with unknown condition"
                );
                continue;
            };

            edges.push(LearningEdge {
                source_node_id: NodeId::new(source),
                target_node_id: NodeId::new(target),
                condition,
                weight: row.try_get("weight")?,
            });
        }

        Ok(Some(CourseDefinition {
            course,
            nodes,
            edges,
        }))
    }

    async fn save_course(&self, definition: &CourseDefinition) -> StoreResult<()> {
        let course = &definition.course;
        let mut tx = self.pool.begin().await?;

        sqlx::query(r#"DELETE FROM "learning_edges" WHERE "course_id" = ?"#)
            .bind(course.id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(r#"DELETE FROM "learning_nodes" WHERE "course_id" = ?"#)
            .bind(course.id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"INSERT OR REPLACE INTO "courses" ("id","title","entry_node_id") VALUES (?, ?, ?)"#,
        )
        .bind(course.id.as_str())
        .bind(&course.title)
        .bind(course.entry_node_id.as_ref().map(|id| id.as_str().to_string()))
        .execute(&mut *tx)
        .await?;

        for (position, node) in definition.nodes.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO "learning_nodes"
                  ("id","course_id","type","concept_id","content","remediation_budget",
                   "fallback_node_id","parent_node_id","remediation_hop","position")
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(node.id.as_str())
            .bind(node.course_id.as_str())
            .bind(node.node_type.as_str())
            .bind(node.concept_id.as_ref().map(|id| id.as_str().to_string()))
            .bind(to_json(&node.content)?)
            .bind(i64::from(node.remediation_budget))
            .bind(node.fallback_node_id.as_ref().map(|id| id.as_str().to_string()))
            .bind(node.parent_node_id.as_ref().map(|id| id.as_str().to_string()))
            .bind(i64::from(node.remediation_hop))
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                // node ids are global, another course already owns this one
                if is_unique_violation(&err) {
                    StoreError::Duplicate {
                        entity: "learning_node",
                        key: node.id.to_string(),
                    }
                } else {
                    StoreError::Sqlx(err)
                }
            })?;
        }

        for (position, edge) in definition.edges.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO "learning_edges"
                  ("course_id","position","source_id","target_id","condition","weight",
                   "mastery_threshold")
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(course.id.as_str())
            .bind(position as i64)
            .bind(edge.source_node_id.as_str())
            .bind(edge.target_node_id.as_str())
            .bind(edge.condition.tag())
            .bind(edge.weight)
            .bind(edge.condition.threshold())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_course_ids(&self) -> StoreResult<Vec<CourseId>> {
        let ids: Vec<String> = sqlx::query_scalar(r#"SELECT "id" FROM "courses" ORDER BY "id""#)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(CourseId::new).collect())
    }

    async fn get_mastery(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> StoreResult<Option<MasteryState>> {
        let row = sqlx::query(
            r#"SELECT * FROM "mastery_states" WHERE "learner_id" = ? AND "concept_id" = ? LIMIT 1"#,
        )
        .bind(learner_id.as_str())
        .bind(concept_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_mastery).transpose()
    }

    async fn put_mastery(&self, state: &MasteryState) -> StoreResult<MasteryState> {
        let key = mastery_key(&state.learner_id, &state.concept_id);
        let recent = to_json(&state.recent_scores)?;

        if state.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO "mastery_states"
                  ("learner_id","concept_id","mastery_score","confidence","attempts",
                   "correct_count","incorrect_count","trend","recent_scores","last_seen",
                   "version")
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                "#,
            )
            .bind(state.learner_id.as_str())
            .bind(state.concept_id.as_str())
            .bind(state.mastery_score)
            .bind(state.confidence)
            .bind(i64::from(state.attempts))
            .bind(i64::from(state.correct_count))
            .bind(i64::from(state.incorrect_count))
            .bind(state.trend.as_str())
            .bind(&recent)
            .bind(to_ms(state.last_seen))
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "mastery_state", key))?;
        } else {
            let result = sqlx::query(
                r#"
                UPDATE "mastery_states"
                SET "mastery_score" = ?, "confidence" = ?, "attempts" = ?, "correct_count" = ?,
                    "incorrect_count" = ?, "trend" = ?, "recent_scores" = ?, "last_seen" = ?,
                    "version" = "version" + 1
                WHERE "learner_id" = ? AND "concept_id" = ? AND "version" = ?
                "#,
            )
            .bind(state.mastery_score)
            .bind(state.confidence)
            .bind(i64::from(state.attempts))
            .bind(i64::from(state.correct_count))
            .bind(i64::from(state.incorrect_count))
            .bind(state.trend.as_str())
            .bind(&recent)
            .bind(to_ms(state.last_seen))
            .bind(state.learner_id.as_str())
            .bind(state.concept_id.as_str())
            .bind(state.version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict {
                    entity: "mastery_state",
                    key,
                });
            }
        }

        let mut stored = state.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn find_misconception(
        &self,
        concept_id: &ConceptId,
        label: &str,
    ) -> StoreResult<Option<Misconception>> {
        let row = sqlx::query(
            r#"SELECT * FROM "misconceptions" WHERE "concept_id" = ? AND "label" = ? LIMIT 1"#,
        )
        .bind(concept_id.as_str())
        .bind(label)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_misconception).transpose()
    }

    async fn save_misconception(&self, misconception: &Misconception) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO "misconceptions" ("id","concept_id","label","occurrence_count")
            VALUES (?, ?, ?, ?)
            ON CONFLICT ("id") DO UPDATE SET
              "concept_id" = excluded."concept_id",
              "label" = excluded."label"
            "#,
        )
        .bind(misconception.id.to_string())
        .bind(misconception.concept_id.as_str())
        .bind(&misconception.label)
        .bind(misconception.occurrence_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            insert_error(
                e,
                "misconception",
                format!("{}/{}", misconception.concept_id, misconception.label),
            )
        })?;
        Ok(())
    }

    async fn record_misconception_occurrence(
        &self,
        misconception_id: MisconceptionId,
        attempt_id: AttemptId,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO "misconception_occurrences" ("misconception_id","attempt_id")
            VALUES (?, ?)
            "#,
        )
        .bind(misconception_id.to_string())
        .bind(attempt_id.to_string())
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"
            UPDATE "misconceptions" SET "occurrence_count" = "occurrence_count" + 1
            WHERE "id" = ?
            "#,
        )
        .bind(misconception_id.to_string())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_attempt(
        &self,
        attempt: &InteractionAttempt,
    ) -> StoreResult<InteractionAttempt> {
        if let Some(existing) = self.find_attempt(attempt.id).await? {
            return Ok(existing);
        }

        // numbering happens inside the insert so concurrent writers collide on
        // the unique key instead of sharing a number
        let number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO "interaction_attempts"
              ("id","learner_id","node_id","answer","is_correct","attempt_number",
               "detected_misconception_id","triggered_remediation","created_at")
            SELECT ?, ?, ?, ?, ?, COALESCE(MAX("attempt_number"), 0) + 1, ?, ?, ?
            FROM "interaction_attempts"
            WHERE "learner_id" = ? AND "node_id" = ?
            RETURNING "attempt_number"
            "#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.learner_id.as_str())
        .bind(attempt.node_id.as_str())
        .bind(to_json(&attempt.answer)?)
        .bind(attempt.is_correct)
        .bind(attempt.detected_misconception_id.map(|id| id.to_string()))
        .bind(attempt.triggered_remediation)
        .bind(to_ms(attempt.created_at))
        .bind(attempt.learner_id.as_str())
        .bind(attempt.node_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            insert_error(
                e,
                "interaction_attempt",
                attempt_key(&attempt.learner_id, &attempt.node_id),
            )
        })?;

        let mut stored = attempt.clone();
        stored.attempt_number = number as u32;
        Ok(stored)
    }

    async fn record_remediation_attempt(
        &self,
        attempt: &InteractionAttempt,
        budget: u32,
    ) -> StoreResult<InteractionAttempt> {
        if let Some(existing) = self.find_attempt(attempt.id).await? {
            return Ok(existing);
        }

        let key = attempt_key(&attempt.learner_id, &attempt.node_id);
        // the budget check is part of the insert, so two detours racing for
        // the last unit of budget cannot both land
        let number: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO "interaction_attempts"
              ("id","learner_id","node_id","answer","is_correct","attempt_number",
               "detected_misconception_id","triggered_remediation","created_at")
            SELECT ?, ?, ?, ?, ?,
                   (SELECT COALESCE(MAX("attempt_number"), 0) + 1 FROM "interaction_attempts"
                    WHERE "learner_id" = ? AND "node_id" = ?),
                   ?, 1, ?
            WHERE (SELECT COUNT(*) FROM "interaction_attempts"
                   WHERE "learner_id" = ? AND "node_id" = ? AND "triggered_remediation" = 1) < ?
            RETURNING "attempt_number"
            "#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.learner_id.as_str())
        .bind(attempt.node_id.as_str())
        .bind(to_json(&attempt.answer)?)
        .bind(attempt.is_correct)
        .bind(attempt.learner_id.as_str())
        .bind(attempt.node_id.as_str())
        .bind(attempt.detected_misconception_id.map(|id| id.to_string()))
        .bind(to_ms(attempt.created_at))
        .bind(attempt.learner_id.as_str())
        .bind(attempt.node_id.as_str())
        .bind(i64::from(budget))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| insert_error(e, "interaction_attempt", key.clone()))?;

        let Some(number) = number else {
            return Err(StoreError::Conflict {
                entity: "remediation_budget",
                key,
            });
        };

        let mut stored = attempt.clone();
        stored.attempt_number = number as u32;
        stored.triggered_remediation = true;
        Ok(stored)
    }

    async fn count_remediation_attempts(
        &self,
        learner_id: &LearnerId,
        node_id: &NodeId,
    ) -> StoreResult<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM "interaction_attempts"
            WHERE "learner_id" = ? AND "node_id" = ? AND "triggered_remediation" = 1
            "#,
        )
        .bind(learner_id.as_str())
        .bind(node_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }

    async fn get_schedule(&self, schedule_id: ScheduleId) -> StoreResult<Option<ReviewSchedule>> {
        let sql = format!(r#"SELECT {SCHEDULE_COLUMNS} FROM "review_schedules" WHERE "id" = ?"#);
        let row = sqlx::query(&sql)
            .bind(schedule_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_schedule).transpose()
    }

    async fn get_active_schedule(
        &self,
        learner_id: &LearnerId,
        item_id: &ItemId,
    ) -> StoreResult<Option<ReviewSchedule>> {
        let sql = format!(
            r#"SELECT {SCHEDULE_COLUMNS} FROM "review_schedules"
               WHERE "learner_id" = ? AND "item_id" = ? AND "is_active" = 1 LIMIT 1"#
        );
        let row = sqlx::query(&sql)
            .bind(learner_id.as_str())
            .bind(item_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_schedule).transpose()
    }

    async fn put_schedule(&self, schedule: &ReviewSchedule) -> StoreResult<ReviewSchedule> {
        let key = schedule_key(&schedule.learner_id, &schedule.item_id);
        let concept = schedule
            .concept_id
            .as_ref()
            .map(|id| id.as_str().to_string());
        let last_reviewed = schedule.last_reviewed_at.map(to_ms);

        if schedule.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO "review_schedules"
                  ("id","learner_id","item_id","concept_id","easiness_factor","interval_days",
                   "repetition_number","next_review_at","last_reviewed_at","streak","is_active",
                   "created_at","version")
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                "#,
            )
            .bind(schedule.id.to_string())
            .bind(schedule.learner_id.as_str())
            .bind(schedule.item_id.as_str())
            .bind(concept)
            .bind(schedule.easiness_factor)
            .bind(schedule.interval_days)
            .bind(i64::from(schedule.repetition_number))
            .bind(to_ms(schedule.next_review_at))
            .bind(last_reviewed)
            .bind(i64::from(schedule.streak))
            .bind(schedule.is_active)
            .bind(to_ms(schedule.created_at))
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "review_schedule", key))?;
        } else {
            let result = sqlx::query(
                r#"
                UPDATE "review_schedules"
                SET "easiness_factor" = ?, "interval_days" = ?, "repetition_number" = ?,
                    "next_review_at" = ?, "last_reviewed_at" = ?, "streak" = ?, "is_active" = ?,
                    "version" = "version" + 1
                WHERE "id" = ? AND "version" = ?
                "#,
            )
            .bind(schedule.easiness_factor)
            .bind(schedule.interval_days)
            .bind(i64::from(schedule.repetition_number))
            .bind(to_ms(schedule.next_review_at))
            .bind(last_reviewed)
            .bind(i64::from(schedule.streak))
            .bind(schedule.is_active)
            .bind(schedule.id.to_string())
            .bind(schedule.version)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "review_schedule", key.clone()))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict {
                    entity: "review_schedule",
                    key,
                });
            }
        }

        let mut stored = schedule.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn list_due_schedules(
        &self,
        learner_id: &LearnerId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReviewSchedule>> {
        let sql = format!(
            r#"SELECT {SCHEDULE_COLUMNS} FROM "review_schedules"
               WHERE "learner_id" = ? AND "is_active" = 1 AND "next_review_at" <= ?
               ORDER BY "next_review_at" ASC, "item_id" ASC
               LIMIT ?"#
        );
        let rows = sqlx::query(&sql)
            .bind(learner_id.as_str())
            .bind(to_ms(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_schedule).collect()
    }

    async fn list_concept_schedules(
        &self,
        learner_id: &LearnerId,
        concept_id: &ConceptId,
    ) -> StoreResult<Vec<ReviewSchedule>> {
        let sql = format!(
            r#"SELECT {SCHEDULE_COLUMNS} FROM "review_schedules"
               WHERE "learner_id" = ? AND "concept_id" = ? AND "is_active" = 1
               ORDER BY "item_id" ASC"#
        );
        let rows = sqlx::query(&sql)
            .bind(learner_id.as_str())
            .bind(concept_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_schedule).collect()
    }

    async fn get_progress(
        &self,
        learner_id: &LearnerId,
        course_id: &CourseId,
    ) -> StoreResult<Option<CourseProgress>> {
        let row = sqlx::query(
            r#"SELECT * FROM "course_progress" WHERE "learner_id" = ? AND "course_id" = ? LIMIT 1"#,
        )
        .bind(learner_id.as_str())
        .bind(course_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_progress).transpose()
    }

    async fn put_progress(&self, progress: &CourseProgress) -> StoreResult<CourseProgress> {
        let key = progress_key(&progress.learner_id, &progress.course_id);
        let current = progress
            .current_node_id
            .as_ref()
            .map(|id| id.as_str().to_string());
        let completed = to_json(&progress.completed_node_ids)?;
        let completed_at = progress.completed_at.map(to_ms);

        if progress.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO "course_progress"
                  ("learner_id","course_id","current_node_id","completed_node_ids",
                   "completion_percentage","status","total_time_spent_secs","started_at",
                   "updated_at","completed_at","version")
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                "#,
            )
            .bind(progress.learner_id.as_str())
            .bind(progress.course_id.as_str())
            .bind(current)
            .bind(&completed)
            .bind(progress.completion_percentage)
            .bind(progress.status.as_str())
            .bind(progress.total_time_spent_secs as i64)
            .bind(to_ms(progress.started_at))
            .bind(to_ms(progress.updated_at))
            .bind(completed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "course_progress", key))?;
        } else {
            let result = sqlx::query(
                r#"
                UPDATE "course_progress"
                SET "current_node_id" = ?, "completed_node_ids" = ?, "completion_percentage" = ?,
                    "status" = ?, "total_time_spent_secs" = ?, "updated_at" = ?, "completed_at" = ?,
                    "version" = "version" + 1
                WHERE "learner_id" = ? AND "course_id" = ? AND "version" = ?
                "#,
            )
            .bind(current)
            .bind(&completed)
            .bind(progress.completion_percentage)
            .bind(progress.status.as_str())
            .bind(progress.total_time_spent_secs as i64)
            .bind(to_ms(progress.updated_at))
            .bind(completed_at)
            .bind(progress.learner_id.as_str())
            .bind(progress.course_id.as_str())
            .bind(progress.version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict {
                    entity: "course_progress",
                    key,
                });
            }
        }

        let mut stored = progress.clone();
        stored.version += 1;
        Ok(stored)
    }
}
