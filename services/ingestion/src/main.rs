use auth::SessionPolicy;
use ingestion::{config, service::IngestionRuntime, transport_axum::serve_http_with_axum};
use schema::{CompetencyEdge, CompetencyNode, DiagnosticExam};
use serde::Deserialize;
use store::{CheckpointPolicy, FileWal, InMemoryStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Optional boot-time content: exams plus the competency graph, loaded from
/// the JSON file named by ATLAS_CONTENT_PATH. Upserts are idempotent, so
/// reseeding on every boot is safe.
#[derive(Debug, Default, Deserialize)]
struct ContentFixture {
    #[serde(default)]
    exams: Vec<DiagnosticExam>,
    #[serde(default)]
    nodes: Vec<CompetencyNode>,
    #[serde(default)]
    edges: Vec<CompetencyEdge>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind_addr = config::resolve_bind_addr();
    let session_policy = SessionPolicy::from_env(
        config::env_opt("ATLAS_TELEMETRY_SESSION_TOKENS").as_deref(),
    );
    if session_policy.is_empty() {
        warn!("ATLAS_TELEMETRY_SESSION_TOKENS is unset; every request will be rejected");
    }

    let runtime = match config::env_opt("ATLAS_TELEMETRY_WAL_PATH") {
        Some(path) => {
            let wal = match FileWal::open(&path) {
                Ok(wal) => wal,
                Err(err) => {
                    error!(%path, %err, "failed to open wal");
                    std::process::exit(1);
                }
            };
            let store = match InMemoryStore::load_from_wal(&wal) {
                Ok(store) => store,
                Err(err) => {
                    error!(%path, %err, "failed to replay wal");
                    std::process::exit(1);
                }
            };
            info!(
                %path,
                attempts = store.attempts_len(),
                exams = store.exams_len(),
                "replayed durable state"
            );
            let checkpoint_policy = CheckpointPolicy {
                max_wal_records: config::parse_env_usize("ATLAS_TELEMETRY_WAL_CHECKPOINT_RECORDS"),
            };
            IngestionRuntime::persistent(store, wal, checkpoint_policy, session_policy)
        }
        None => IngestionRuntime::in_memory(InMemoryStore::new(), session_policy),
    }
    .with_audit_log_path(config::env_opt("ATLAS_TELEMETRY_AUDIT_LOG_PATH"));

    let mut runtime = runtime;
    if let Some(content_path) = config::env_opt("ATLAS_CONTENT_PATH") {
        match load_content(&content_path) {
            Ok(content) => {
                let (exams, nodes, edges) =
                    (content.exams.len(), content.nodes.len(), content.edges.len());
                if let Err(err) = seed_content(&mut runtime, content) {
                    error!(%content_path, %err, "failed to seed content");
                    std::process::exit(1);
                }
                info!(%content_path, exams, nodes, edges, "seeded content");
            }
            Err(err) => {
                error!(%content_path, %err, "failed to load content fixture");
                std::process::exit(1);
            }
        }
    }

    info!(%bind_addr, "telemetry ingestion service listening");
    if let Err(err) = serve_http_with_axum(runtime, &bind_addr, config::resolve_http_workers()) {
        error!(%err, "telemetry ingestion service failed");
        std::process::exit(1);
    }
}

fn load_content(path: &str) -> Result<ContentFixture, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

fn seed_content(runtime: &mut IngestionRuntime, content: ContentFixture) -> Result<(), String> {
    for exam in content.exams {
        runtime.seed_exam(exam).map_err(|e| e.to_string())?;
    }
    for node in content.nodes {
        runtime.seed_node(node).map_err(|e| e.to_string())?;
    }
    for edge in content.edges {
        runtime.seed_edge(edge).map_err(|e| e.to_string())?;
    }
    Ok(())
}
