//! Administration CLI (added, ambient; grounded in `singaraiona-teide`'s
//! `teide-cli` binary — the teacher repo declares its own CLI bin targets
//! but ships no source for them in this pack, so the clap-derive shape is
//! borrowed from elsewhere in the retrieval set).
//!
//! Exposes the operations of spec.md §6 that don't fit `QueryEngine`'s
//! request/response shape: engine-pool disposal and the sync plane
//! (`sync run`/`abort`/`reset-stuck`/`status`/`logs`), plus a standalone
//! `api-sync` command for `HttpApi` datasources, which never carry a
//! `SyncTask` and so never go through `SyncCoordinator`.
//!
//! `engine dispose`/`dispose-all` call the *running* server's admin HTTP
//! endpoints rather than building a local `EnginePool`: the pool this CLI
//! would otherwise construct is a fresh, empty one, not the live process's
//! cache, so disposal has to cross the process boundary the same way any
//! other admin client would. The sync commands, in contrast, run directly
//! against the catalog and embedded store — they're an offline admin path,
//! and intentionally should not require a server to be up. Running them
//! against the same embedded file a live server has open will contend on
//! its single-writer connection (spec.md §4.11); that's an operational
//! constraint, not a bug.

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use queryhub_core::config::EngineConfig;
use queryhub_core::exec::embedded::{EmbeddedHandle, EmbeddedPragmas};
use queryhub_core::exec::pool::EnginePool;
use queryhub_core::store::postgres::PostgresStore;
use queryhub_core::store::MetadataStore;
use queryhub_core::sync::coordinator::SyncCoordinator;
use queryhub_core::sync::ingest;
use queryhub_core::sync::source::SqlSourceResolver;

#[derive(Parser)]
#[command(name = "queryctl", version, about = "Administration CLI for the query engine")]
struct Args {
    /// Postgres DSN backing the metadata store.
    #[arg(long, env = "QUERYHUB_CATALOG_DSN")]
    catalog_dsn: String,
    /// Base URL of the running `queryhub-server`, for `engine dispose*`.
    #[arg(long, env = "QUERYHUB_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dispose the pooled remote engine for one datasource.
    EngineDispose {
        #[arg(long)]
        datasource_id: String,
    },
    /// Dispose every pooled remote engine.
    EngineDisposeAll,
    /// Run one or more sync tasks as a coordinated batch.
    SyncRun {
        #[arg(long = "task", required = true)]
        task_ids: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Request cooperative cancellation of an in-progress task.
    SyncAbort {
        #[arg(long)]
        task_id: String,
    },
    /// Force-release locks/states orphaned by a crashed worker.
    SyncResetStuck,
    /// Print the current `SyncState` for a task.
    SyncStatus {
        #[arg(long)]
        task_id: String,
    },
    /// Print recent `SyncRun` history for a task.
    SyncLogs {
        #[arg(long)]
        task_id: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Run an `HttpApi` datasource's ingest directly (not a `SyncTask`).
    ApiSync {
        #[arg(long)]
        datasource_id: String,
        #[arg(long)]
        dest_table: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> queryhub_core::error::Result<()> {
    let config = EngineConfig::from_env();
    let store = Arc::new(PostgresStore::connect(&args.catalog_dsn).await?);

    match args.command {
        Command::EngineDispose { datasource_id } => {
            let url = format!("{}/datasources/{datasource_id}/engine/dispose", args.server_url);
            post_admin(&url).await?;
            println!("disposed engine for datasource {datasource_id}");
        }
        Command::EngineDisposeAll => {
            let url = format!("{}/datasources/engines/dispose-all", args.server_url);
            post_admin(&url).await?;
            println!("disposed all pooled engines");
        }
        Command::SyncRun { task_ids, force } => {
            let coordinator = build_coordinator(&config, store.clone()).await?;
            let outcomes = coordinator.run_batch(&task_ids, force).await?;
            for outcome in outcomes {
                println!(
                    "task {} rows={} aborted={} error={}",
                    outcome.task_id,
                    outcome.row_count,
                    outcome.aborted,
                    outcome.error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::SyncAbort { task_id } => {
            let mut state = store
                .get_sync_state(&task_id)
                .await?
                .ok_or_else(|| queryhub_core::EngineError::NotFound(format!("no sync state for task {task_id}")))?;
            state.cancel_requested = true;
            store.save_sync_state(&state).await?;
            println!("cancellation requested for task {task_id}");
        }
        Command::SyncResetStuck => {
            let coordinator = build_coordinator(&config, store.clone()).await?;
            let n = coordinator.reset_stuck().await?;
            println!("reset {n} stuck sync task(s)");
        }
        Command::SyncStatus { task_id } => match store.get_sync_state(&task_id).await? {
            Some(state) => println!("{}", serde_json::to_string_pretty(&state).unwrap_or_default()),
            None => println!("no sync state recorded for task {task_id}"),
        },
        Command::SyncLogs { task_id, limit } => {
            let runs = store.list_runs(&task_id, limit).await?;
            for run in runs {
                println!(
                    "{} started={} finished={} rows={} error={}",
                    run.id,
                    run.started_at,
                    run.finished_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                    run.row_count.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string()),
                    run.error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::ApiSync { datasource_id, dest_table } => {
            let ds = store
                .get_datasource(&datasource_id)
                .await?
                .ok_or_else(|| queryhub_core::EngineError::NotFound(format!("datasource {datasource_id} not found")))?;
            let cfg = ds.options.api_ingest.ok_or_else(|| {
                queryhub_core::EngineError::BadRequest(format!("datasource {datasource_id} has no api_ingest config"))
            })?;
            let embedded = Arc::new(open_embedded(&config)?);
            let client = reqwest::Client::new();
            let result = ingest::run_api_sync(&embedded, &client, &cfg, &dest_table, Utc::now()).await?;
            println!(
                "api sync into {dest_table}: rows={} window=[{:?}, {:?}]",
                result.row_count, result.window_start, result.window_end
            );
        }
    }
    Ok(())
}

async fn build_coordinator(
    config: &EngineConfig,
    store: Arc<PostgresStore>,
) -> queryhub_core::error::Result<SyncCoordinator<PostgresStore>> {
    let embedded = Arc::new(open_embedded(config)?);
    let pool = Arc::new(EnginePool::new());
    let resolver = Arc::new(SqlSourceResolver::new(pool, embedded.clone()));
    Ok(SyncCoordinator::new(store, embedded, resolver, config.sync_lock_stale_after))
}

async fn post_admin(url: &str) -> queryhub_core::error::Result<()> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .map_err(|e| queryhub_core::EngineError::BadGateway(format!("request to {url} failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(queryhub_core::EngineError::BadGateway(format!(
            "{url} returned HTTP {}",
            resp.status()
        )));
    }
    Ok(())
}

fn open_embedded(config: &EngineConfig) -> queryhub_core::error::Result<EmbeddedHandle> {
    let path = std::path::Path::new(&config.embedded_store_path);
    let marker_path = path.with_extension("active");
    let pragmas = EmbeddedPragmas {
        threads: config.embedded_store_threads,
        memory_limit_mb: config.embedded_store_memory_limit_mb,
        temp_dir: config.embedded_store_temp_dir.clone(),
    };
    EmbeddedHandle::open(path, marker_path, pragmas)
}
