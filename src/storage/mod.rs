pub mod database;
pub mod database_subscription;
pub mod database_usage;
pub mod postgres_store;
pub mod postgres_subscription;
pub mod postgres_usage;
pub mod time;

pub use database::SqliteStore;
pub use postgres_store::PgStore;
