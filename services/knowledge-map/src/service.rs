use std::time::Instant;

use auth::SessionPolicy;
use graph::{GraphError, global_node_stats, student_knowledge_map};
use schema::{GraphEdgeView, GraphNodeView};
use store::{FileWal, InMemoryStore};
use tracing::error;

use crate::api::GlobalNodePayload;

/// Read-side runtime. Views are re-derived from current progress on every
/// request — nothing here caches a rendered map.
pub struct KnowledgeMapRuntime {
    store: InMemoryStore,
    /// When set, the store is re-replayed from this WAL before each view so a
    /// separate ingestion process's writes become visible.
    wal_path: Option<String>,
    session_policy: SessionPolicy,
    global_views_total: u64,
    student_views_total: u64,
    auth_failure_total: u64,
    authz_denied_total: u64,
    refresh_total: u64,
    refresh_error_total: u64,
    started_at: Instant,
}

impl KnowledgeMapRuntime {
    pub fn in_memory(store: InMemoryStore, session_policy: SessionPolicy) -> Self {
        Self {
            store,
            wal_path: None,
            session_policy,
            global_views_total: 0,
            student_views_total: 0,
            auth_failure_total: 0,
            authz_denied_total: 0,
            refresh_total: 0,
            refresh_error_total: 0,
            started_at: Instant::now(),
        }
    }

    pub fn with_wal_path(mut self, wal_path: Option<String>) -> Self {
        self.wal_path = wal_path;
        self
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut InMemoryStore {
        &mut self.store
    }

    pub fn session_policy(&self) -> &SessionPolicy {
        &self.session_policy
    }

    /// Reload durable state written by the ingestion process. A failed
    /// refresh keeps serving the previous state.
    pub fn refresh_if_configured(&mut self) {
        let Some(path) = self.wal_path.clone() else {
            return;
        };
        self.refresh_total += 1;
        let replayed = FileWal::open(&path).and_then(|wal| InMemoryStore::load_from_wal(&wal));
        match replayed {
            Ok(store) => self.store = store,
            Err(err) => {
                self.refresh_error_total += 1;
                error!(%path, %err, "knowledge-map wal refresh failed");
            }
        }
    }

    pub fn global_map(
        &mut self,
    ) -> Result<(Vec<GlobalNodePayload>, Vec<GraphEdgeView>), GraphError> {
        self.refresh_if_configured();
        let stats = global_node_stats(
            self.store.competency_nodes(),
            self.store.competency_edges(),
            self.store.all_progress(),
        )?;
        self.global_views_total += 1;
        Ok((
            stats.into_iter().map(GlobalNodePayload::from).collect(),
            edge_views(&self.store),
        ))
    }

    pub fn student_map(
        &mut self,
        student_id: &str,
    ) -> Result<(Vec<GraphNodeView>, Vec<GraphEdgeView>), GraphError> {
        self.refresh_if_configured();
        let progress = self.store.progress_for_student(student_id);
        let (nodes, edges) = student_knowledge_map(
            self.store.competency_nodes(),
            self.store.competency_edges(),
            &progress,
        )?;
        self.student_views_total += 1;
        Ok((nodes, edges))
    }

    pub fn observe_auth_failure(&mut self) {
        self.auth_failure_total += 1;
    }

    pub fn observe_authz_denied(&mut self) {
        self.authz_denied_total += 1;
    }

    pub fn metrics_text(&self) -> String {
        format!(
            "# TYPE atlas_kmap_global_views_total counter\n\
atlas_kmap_global_views_total {}\n\
# TYPE atlas_kmap_student_views_total counter\n\
atlas_kmap_student_views_total {}\n\
# TYPE atlas_kmap_auth_failure_total counter\n\
atlas_kmap_auth_failure_total {}\n\
# TYPE atlas_kmap_authz_denied_total counter\n\
atlas_kmap_authz_denied_total {}\n\
# TYPE atlas_kmap_refresh_total counter\n\
atlas_kmap_refresh_total {}\n\
# TYPE atlas_kmap_refresh_error_total counter\n\
atlas_kmap_refresh_error_total {}\n\
# TYPE atlas_kmap_nodes_total gauge\n\
atlas_kmap_nodes_total {}\n\
# TYPE atlas_kmap_uptime_seconds gauge\n\
atlas_kmap_uptime_seconds {:.4}\n",
            self.global_views_total,
            self.student_views_total,
            self.auth_failure_total,
            self.authz_denied_total,
            self.refresh_total,
            self.refresh_error_total,
            self.store.competency_nodes().len(),
            self.started_at.elapsed().as_secs_f64()
        )
    }
}

fn edge_views(store: &InMemoryStore) -> Vec<GraphEdgeView> {
    store
        .competency_edges()
        .iter()
        .map(|edge| GraphEdgeView {
            source_id: edge.source_id.clone(),
            target_id: edge.target_id.clone(),
        })
        .collect()
}
