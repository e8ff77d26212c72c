mod auth;
mod config;
mod middleware;

mod db;
mod error;
mod merge;
mod models;
mod routes;

use std::sync::Arc;

use crate::{
    config::Config,
    merge::{
        MergeService,
        audit::{CounterRegistry, MergeEventBus, MergeMetrics, NoopMetrics},
        pg_store::PgPatientStore,
    },
    models::AppState,
};

use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    if cfg.run_migrations {
        db::run_migrations(&pool).await?;
    }

    let registry = Arc::new(CounterRegistry::new());
    let metrics: Arc<dyn MergeMetrics> = if cfg.metrics_enabled {
        registry.clone()
    } else {
        Arc::new(NoopMetrics)
    };

    let events = MergeEventBus::new(cfg.merge_event_buffer);
    spawn_merge_event_logger(&events);

    let store = Arc::new(PgPatientStore::new(pool.clone(), cfg.merge_lock_timeout_ms));
    let merge = Arc::new(MergeService::new(
        store,
        metrics,
        events,
        cfg.name_match_threshold,
    ));

    let state = AppState {
        db: pool,
        merge,
        metrics: registry,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Downstream consumers hook in here; for now every merge is written to the
/// `merge_events` log target.
fn spawn_merge_event_logger(events: &MergeEventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::info!(
                    target: "merge_events",
                    source_patient_id = %event.source_patient_id,
                    target_patient_id = %event.target_patient_id,
                    strategy = event.strategy.as_str(),
                    merged_by_user_id = %event.merged_by_user_id,
                    merge_log_id = %event.merge_log_id,
                    "PatientMerged"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "merge_events", skipped, "merge event listener lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
