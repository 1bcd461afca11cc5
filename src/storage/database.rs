use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::QuotaError;

/// SQLite-backed subscription store and usage ledger.
///
/// A single connection behind an async mutex: every statement runs alone,
/// and each trait method issues its write as one statement.
#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn new(database_path: &str) -> Result<Self, QuotaError> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        Self::init_schema(&conn)?;
        tracing::info!("Database initialized at: {}", database_path);

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "sqlite journal mode");
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                account_id TEXT PRIMARY KEY,
                plan_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                external_membership_id TEXT,
                external_product_id TEXT,
                usage_reset_pending INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_subscriptions_status_ends_at
                ON subscriptions (status, ends_at);

             CREATE TABLE IF NOT EXISTS usage_records (
                account_id TEXT NOT NULL,
                feature_type TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
                last_reset_date TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, feature_type, period_start)
             );",
        )
    }
}
