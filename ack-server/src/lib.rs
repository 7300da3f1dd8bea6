pub mod demo;
pub mod routes;
pub mod state;
pub mod webhook;

use axum::Router;

pub use state::AppState;

/// Webhook intake and the incident API on one router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(webhook::webhook_router())
        .merge(routes::api_router())
        .with_state(state)
}
