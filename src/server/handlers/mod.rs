use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::server::AppState;

mod lifecycle;
mod subscription;
mod usage;

#[cfg(test)]
mod test_support;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/accounts/{account_id}/features/{feature}/usage",
            get(usage::get_usage),
        )
        .route(
            "/accounts/{account_id}/features/{feature}/commit",
            post(usage::commit_usage),
        )
        .route(
            "/accounts/{account_id}/subscription",
            get(subscription::get_summary),
        )
        .route(
            "/accounts/{account_id}/subscription/activate",
            post(subscription::activate),
        )
        .route(
            "/accounts/{account_id}/subscription/cancel",
            post(subscription::cancel),
        )
        .route("/lifecycle/events", post(lifecycle::apply_event))
        .route("/lifecycle/sweep", post(lifecycle::sweep))
}
