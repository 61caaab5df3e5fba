use std::process::ExitCode;
use std::sync::Arc;

use danci_course_engine::config::Config;
use danci_course_engine::graph::CourseGraph;
use danci_course_engine::ids::CourseId;
use danci_course_engine::logging::init_tracing;
use danci_course_engine::store::{SqliteStore, Store};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = match init_tracing(&config.log) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialise tracing: {err}");
            return ExitCode::FAILURE;
        }
    };

    let store: Arc<dyn Store> = match SqliteStore::connect(&config.sqlite).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(
                error = %err,
                path = %config.sqlite.path.display(),
                "failed to open engine database"
            );
            return ExitCode::FAILURE;
        }
    };

    let requested: Vec<CourseId> = std::env::args().skip(1).map(CourseId::new).collect();
    let course_ids = if requested.is_empty() {
        match store.list_course_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::error!(error = %err, "failed to list courses");
                return ExitCode::FAILURE;
            }
        }
    } else {
        requested
    };

    let max_hops = config.engine.remediation.max_remediation_hops;
    let mut failures = 0usize;

    for course_id in &course_ids {
        let definition = match store.load_course(course_id).await {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                tracing::error!(course_id = %course_id, "course not found");
                failures += 1;
                continue;
            }
            Err(err) => {
                tracing::error!(course_id = %course_id, error = %err, "failed to load course");
                failures += 1;
                continue;
            }
        };

        match CourseGraph::build(definition, max_hops) {
            Ok(graph) => tracing::info!(
                course_id = %course_id,
                nodes = graph.nodes().len(),
                lessons = graph.total_non_remediation_nodes(),
                "course ok"
            ),
            Err(err) => {
                tracing::error!(course_id = %course_id, error = %err, "course failed validation");
                failures += 1;
            }
        }
    }

    tracing::info!(checked = course_ids.len(), failures, "course validation finished");

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
