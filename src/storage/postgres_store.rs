use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_postgres::{Client, NoTls};

use crate::error::QuotaError;

pub struct PgPool {
    clients: Vec<Arc<Client>>,
    next: AtomicUsize,
}

fn valid_schema_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl PgPool {
    async fn connect_many(
        pg_url: &str,
        schema: &Option<String>,
        size: usize,
    ) -> Result<Self, QuotaError> {
        if let Some(s) = schema {
            if !valid_schema_name(s) {
                return Err(QuotaError::Config(format!("invalid pg_schema: {s}")));
            }
        }
        let mut clients = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let (client, connection) = tokio_postgres::connect(pg_url, NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("postgres connection error: {}", e);
                }
            });
            if let Some(s) = schema {
                client
                    .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {s}; SET search_path TO {s}"))
                    .await?;
            }
            let client = Arc::new(client);
            crate::db::postgres::spawn_keepalive(Arc::clone(&client), 240, 420);
            clients.push(client);
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    pub fn pick(&self) -> Arc<Client> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len().max(1);
        Arc::clone(&self.clients[idx])
    }
}

/// Postgres-backed subscription store and usage ledger.
///
/// Clients are shared between tasks, so every write is a single statement;
/// nothing here relies on a multi-statement transaction.
#[derive(Clone)]
pub struct PgStore {
    pub pool: Arc<PgPool>,
}

impl PgStore {
    pub async fn connect(
        pg_url: &str,
        schema: &Option<String>,
        pool_size: usize,
    ) -> Result<Self, QuotaError> {
        let pool = PgPool::connect_many(pg_url, schema, pool_size).await?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.init_schema().await?;
        tracing::info!("PostgreSQL store ready (pool size {})", pool_size.max(1));
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), QuotaError> {
        let client = self.pool.pick();
        client
            .batch_execute(
                r#"CREATE TABLE IF NOT EXISTS subscriptions (
                    account_id TEXT PRIMARY KEY,
                    plan_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at TIMESTAMPTZ NOT NULL,
                    ends_at TIMESTAMPTZ NOT NULL,
                    external_membership_id TEXT,
                    external_product_id TEXT,
                    usage_reset_pending BOOLEAN NOT NULL DEFAULT FALSE,
                    version BIGINT NOT NULL DEFAULT 1,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_subscriptions_status_ends_at
                    ON subscriptions (status, ends_at);

                CREATE TABLE IF NOT EXISTS usage_records (
                    account_id TEXT NOT NULL,
                    feature_type TEXT NOT NULL,
                    period_start DATE NOT NULL,
                    period_end DATE NOT NULL,
                    usage_count BIGINT NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
                    last_reset_date DATE,
                    updated_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (account_id, feature_type, period_start)
                );"#,
            )
            .await?;
        Ok(())
    }
}
