use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::CourseGraph;
use crate::error::{EngineError, EngineResult};
use crate::ids::CourseId;
use crate::store::Store;

/// Read-through cache of validated course graphs.
///
/// Graphs are immutable once built, so entries are shared read-only across
/// concurrent requests. Nothing learner-specific is ever cached here.
#[derive(Default)]
pub struct GraphCache {
    graphs: RwLock<HashMap<CourseId, Arc<CourseGraph>>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load(
        &self,
        store: &dyn Store,
        course_id: &CourseId,
        max_remediation_hops: u32,
    ) -> EngineResult<Arc<CourseGraph>> {
        if let Some(graph) = self.graphs.read().get(course_id) {
            return Ok(Arc::clone(graph));
        }

        let definition = store
            .load_course(course_id)
            .await?
            .ok_or_else(|| EngineError::not_found("course", course_id))?;
        let graph = Arc::new(CourseGraph::build(definition, max_remediation_hops)?);

        tracing::debug!(course_id = %course_id, nodes = graph.nodes().len(), "course graph cached");

        // a concurrent loader may have won; either copy is equivalent
        let mut graphs = self.graphs.write();
        let entry = graphs
            .entry(course_id.clone())
            .or_insert_with(|| Arc::clone(&graph));
        Ok(Arc::clone(entry))
    }

    pub fn invalidate(&self, course_id: &CourseId) {
        self.graphs.write().remove(course_id);
    }

    pub fn len(&self) -> usize {
        self.graphs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.read().is_empty()
    }
}
