use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::OptionalExtension;

use crate::error::QuotaError;
use crate::plans::FeatureType;
use crate::storage::database::SqliteStore;
use crate::storage::time::{
    parse_date_string, parse_datetime_string, sql_conversion_error, to_date_string,
    to_iso8601_utc_string,
};
use crate::usage::{PeriodKey, UsageLedger, UsageRecord};

fn row_to_usage(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
    let feature_s: String = row.get(1)?;
    let feature_type = FeatureType::parse(&feature_s).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(1, "feature_type".into(), rusqlite::types::Type::Text)
    })?;
    let date = |idx: usize, raw: String| -> rusqlite::Result<NaiveDate> {
        parse_date_string(&raw).map_err(|e| sql_conversion_error(idx, e))
    };
    let last_reset_date = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(date(5, raw)?),
        None => None,
    };
    let updated_at_s: String = row.get(6)?;
    Ok(UsageRecord {
        account_id: row.get(0)?,
        feature_type,
        usage_count: row.get(2)?,
        period_start: date(3, row.get(3)?)?,
        period_end: date(4, row.get(4)?)?,
        last_reset_date,
        updated_at: parse_datetime_string(&updated_at_s).map_err(|e| sql_conversion_error(6, e))?,
    })
}

#[async_trait]
impl UsageLedger for SqliteStore {
    async fn get_usage(
        &self,
        account_id: &str,
        feature: FeatureType,
        period_start: NaiveDate,
    ) -> Result<Option<UsageRecord>, QuotaError> {
        let conn = self.connection.lock().await;
        let record = conn
            .query_row(
                "SELECT account_id, feature_type, usage_count, period_start, period_end,
                        last_reset_date, updated_at
                 FROM usage_records
                 WHERE account_id = ?1 AND feature_type = ?2 AND period_start = ?3",
                rusqlite::params![account_id, feature.as_str(), to_date_string(&period_start)],
                row_to_usage,
            )
            .optional()?;
        Ok(record)
    }

    async fn atomic_increment(
        &self,
        account_id: &str,
        feature: FeatureType,
        key: &PeriodKey,
    ) -> Result<i64, QuotaError> {
        let now_s = to_iso8601_utc_string(&Utc::now());
        let conn = self.connection.lock().await;
        let count = conn.query_row(
            "INSERT INTO usage_records (
                account_id, feature_type, period_start, period_end,
                usage_count, last_reset_date, updated_at
             ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
             ON CONFLICT(account_id, feature_type, period_start) DO UPDATE SET
                usage_count = usage_records.usage_count + 1,
                updated_at = excluded.updated_at
             RETURNING usage_count",
            rusqlite::params![
                account_id,
                feature.as_str(),
                to_date_string(&key.start),
                to_date_string(&key.end),
                key.last_reset_date.as_ref().map(to_date_string),
                &now_s,
            ],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    async fn atomic_increment_within(
        &self,
        account_id: &str,
        feature: FeatureType,
        key: &PeriodKey,
        limit: i64,
    ) -> Result<Option<i64>, QuotaError> {
        if limit <= 0 {
            return Ok(None);
        }
        let now_s = to_iso8601_utc_string(&Utc::now());
        let conn = self.connection.lock().await;
        let count = conn
            .query_row(
                "INSERT INTO usage_records (
                    account_id, feature_type, period_start, period_end,
                    usage_count, last_reset_date, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
                 ON CONFLICT(account_id, feature_type, period_start) DO UPDATE SET
                    usage_count = usage_records.usage_count + 1,
                    updated_at = excluded.updated_at
                 WHERE usage_records.usage_count < ?7
                 RETURNING usage_count",
                rusqlite::params![
                    account_id,
                    feature.as_str(),
                    to_date_string(&key.start),
                    to_date_string(&key.end),
                    key.last_reset_date.as_ref().map(to_date_string),
                    &now_s,
                    limit,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count)
    }

    async fn delete_all_for_account(&self, account_id: &str) -> Result<u64, QuotaError> {
        let conn = self.connection.lock().await;
        let removed = conn.execute("DELETE FROM usage_records WHERE account_id = ?1", [account_id])?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteStore::new(db_path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn monthly_key() -> PeriodKey {
        PeriodKey {
            start: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            last_reset_date: None,
        }
    }

    #[tokio::test]
    async fn increment_creates_row_lazily_then_counts_up() {
        let (_dir, db) = store().await;
        let key = monthly_key();
        assert!(db
            .get_usage("a1", FeatureType::DraftReply, key.start)
            .await
            .unwrap()
            .is_none());

        for expected in 1..=3 {
            let n = db
                .atomic_increment("a1", FeatureType::DraftReply, &key)
                .await
                .unwrap();
            assert_eq!(n, expected);
        }
        let row = db
            .get_usage("a1", FeatureType::DraftReply, key.start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.usage_count, 3);
        assert_eq!(row.period_end, key.end);
        assert_eq!(row.last_reset_date, None);

        // other features and periods are separate rows
        let daily = PeriodKey::daily(NaiveDate::from_ymd_opt(2026, 4, 2).unwrap());
        assert_eq!(
            db.atomic_increment("a1", FeatureType::AiChat, &daily).await.unwrap(),
            1
        );
        let daily_row = db
            .get_usage("a1", FeatureType::AiChat, daily.start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(daily_row.last_reset_date, Some(daily.start));
    }

    #[tokio::test]
    async fn conditional_increment_stops_at_limit() {
        let (_dir, db) = store().await;
        let key = monthly_key();
        for expected in 1..=2 {
            let n = db
                .atomic_increment_within("a1", FeatureType::DraftReply, &key, 2)
                .await
                .unwrap();
            assert_eq!(n, Some(expected));
        }
        let n = db
            .atomic_increment_within("a1", FeatureType::DraftReply, &key, 2)
            .await
            .unwrap();
        assert_eq!(n, None);
        let row = db
            .get_usage("a1", FeatureType::DraftReply, key.start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.usage_count, 2);

        assert_eq!(
            db.atomic_increment_within("a2", FeatureType::DraftReply, &key, 0)
                .await
                .unwrap(),
            None
        );
        assert!(db
            .get_usage("a2", FeatureType::DraftReply, key.start)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_lose_nothing() {
        let (_dir, db) = store().await;
        let db = Arc::new(db);
        let key = monthly_key();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.atomic_increment("a1", FeatureType::DraftReply, &key)
                    .await
                    .unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=100).collect::<Vec<i64>>());
        let row = db
            .get_usage("a1", FeatureType::DraftReply, key.start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.usage_count, 100);
    }

    #[tokio::test]
    async fn delete_all_only_touches_one_account() {
        let (_dir, db) = store().await;
        let key = monthly_key();
        db.atomic_increment("a1", FeatureType::DraftReply, &key).await.unwrap();
        db.atomic_increment("a1", FeatureType::BulkActions, &key).await.unwrap();
        db.atomic_increment("a2", FeatureType::DraftReply, &key).await.unwrap();

        assert_eq!(db.delete_all_for_account("a1").await.unwrap(), 2);
        assert_eq!(db.delete_all_for_account("a1").await.unwrap(), 0);
        assert!(db
            .get_usage("a2", FeatureType::DraftReply, key.start)
            .await
            .unwrap()
            .is_some());
    }
}
