pub mod handlers;
pub(crate) mod util;

use crate::config::Settings;
use crate::error::Result as AppResult;
use crate::lifecycle::LifecycleCoordinator;
use crate::plans::PlanCatalog;
use crate::quota::QuotaEvaluator;
use crate::storage::{PgStore, SqliteStore};
use crate::subscription::SubscriptionStore;
use crate::usage::UsageLedger;
use axum::Router;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Settings,
    pub evaluator: Arc<QuotaEvaluator>,
    pub lifecycle: Arc<LifecycleCoordinator>,
}

impl AppState {
    /// Wires evaluator and coordinator over the given stores and the configured catalog.
    pub fn new(
        config: Settings,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn UsageLedger>,
    ) -> AppResult<Self> {
        let catalog = Arc::new(PlanCatalog::with_overrides(&config.plans, &config.products)?);
        let evaluator = Arc::new(QuotaEvaluator::new(
            subscriptions.clone(),
            ledger.clone(),
            catalog.clone(),
            config.quota.enforcement,
        ));
        let lifecycle = Arc::new(LifecycleCoordinator::new(subscriptions, ledger, catalog));
        Ok(Self {
            config,
            evaluator,
            lifecycle,
        })
    }
}

pub async fn create_app(config: Settings) -> AppResult<Router> {
    // Choose stores based on Postgres availability
    let (subscriptions, ledger): (Arc<dyn SubscriptionStore>, Arc<dyn UsageLedger>) =
        if let Some(pg_url) = &config.storage.pg_url {
            let pool_size = config.storage.pg_pool_size.unwrap_or(4);
            let store = Arc::new(PgStore::connect(pg_url, &config.storage.pg_schema, pool_size).await?);
            tracing::info!(pool_size, "Using PostgreSQL for subscriptions and usage");
            (store.clone(), store)
        } else {
            let store = Arc::new(SqliteStore::new(&config.storage.database_path).await?);
            tracing::info!(path = %config.storage.database_path, "Using SQLite for subscriptions and usage");
            (store.clone(), store)
        };

    let app_state = Arc::new(AppState::new(config, subscriptions, ledger)?);

    if let Some(secs) = app_state.config.sweep.interval_secs.filter(|s| *s > 0) {
        spawn_sweeper(app_state.lifecycle.clone(), Duration::from_secs(secs));
    }

    Ok(app(app_state))
}

pub fn app(state: Arc<AppState>) -> Router {
    handlers::routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn spawn_sweeper(lifecycle: Arc<LifecycleCoordinator>, every: Duration) {
    tracing::info!(interval_secs = every.as_secs(), "in-process expiry sweep enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = lifecycle.sweep(Utc::now()).await {
                tracing::warn!(error = %e, "expiry sweep failed, retrying next tick");
            }
        }
    });
}
