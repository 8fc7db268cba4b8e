use auth::SessionPolicy;
use knowledge_map::{KnowledgeMapRuntime, transport_axum::serve_http_with_axum};
use store::{FileWal, InMemoryStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8082";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind_addr = env_opt("ATLAS_KMAP_BIND").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
    let session_policy =
        SessionPolicy::from_env(env_opt("ATLAS_KMAP_SESSION_TOKENS").as_deref());
    if session_policy.is_empty() {
        warn!("ATLAS_KMAP_SESSION_TOKENS is unset; every request will be rejected");
    }

    let wal_path = env_opt("ATLAS_KMAP_WAL_PATH");
    let store = match wal_path.as_deref() {
        Some(path) => match FileWal::open(path).and_then(|wal| InMemoryStore::load_from_wal(&wal))
        {
            Ok(store) => {
                info!(%path, nodes = store.competency_nodes().len(), "replayed durable state");
                store
            }
            Err(err) => {
                error!(%path, %err, "failed to replay wal");
                std::process::exit(1);
            }
        },
        None => InMemoryStore::new(),
    };

    let runtime = KnowledgeMapRuntime::in_memory(store, session_policy).with_wal_path(wal_path);
    let workers = env_opt("ATLAS_KMAP_HTTP_WORKERS")
        .and_then(|value| value.parse().ok())
        .filter(|value: &usize| *value > 0)
        .unwrap_or(4);

    info!(%bind_addr, "knowledge-map service listening");
    if let Err(err) = serve_http_with_axum(runtime, &bind_addr, workers) {
        error!(%err, "knowledge-map service failed");
        std::process::exit(1);
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
