use crate::models::AppState;
use axum::Router;

pub mod merge_routes;
pub mod metrics_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", merge_routes::router())
        .merge(metrics_routes::router())
        .with_state(state)
}
