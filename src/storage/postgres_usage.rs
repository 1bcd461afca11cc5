use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio_postgres::Row;

use crate::error::QuotaError;
use crate::plans::FeatureType;
use crate::storage::postgres_store::PgStore;
use crate::usage::{PeriodKey, UsageLedger, UsageRecord};

fn row_to_usage(row: &Row) -> Result<UsageRecord, QuotaError> {
    let feature_s: String = row.try_get(1)?;
    let feature_type = FeatureType::parse(&feature_s).ok_or_else(|| {
        QuotaError::StorageUnavailable(format!("invalid feature_type in row: {feature_s}"))
    })?;
    Ok(UsageRecord {
        account_id: row.try_get(0)?,
        feature_type,
        usage_count: row.try_get(2)?,
        period_start: row.try_get(3)?,
        period_end: row.try_get(4)?,
        last_reset_date: row.try_get(5)?,
        updated_at: row.try_get(6)?,
    })
}

#[async_trait]
impl UsageLedger for PgStore {
    async fn get_usage(
        &self,
        account_id: &str,
        feature: FeatureType,
        period_start: NaiveDate,
    ) -> Result<Option<UsageRecord>, QuotaError> {
        let client = self.pool.pick();
        let row = client
            .query_opt(
                "SELECT account_id, feature_type, usage_count, period_start, period_end,
                        last_reset_date, updated_at
                 FROM usage_records
                 WHERE account_id = $1 AND feature_type = $2 AND period_start = $3",
                &[&account_id, &feature.as_str(), &period_start],
            )
            .await?;
        row.as_ref().map(row_to_usage).transpose()
    }

    async fn atomic_increment(
        &self,
        account_id: &str,
        feature: FeatureType,
        key: &PeriodKey,
    ) -> Result<i64, QuotaError> {
        let now = Utc::now();
        let client = self.pool.pick();
        let row = client
            .query_one(
                "INSERT INTO usage_records (
                    account_id, feature_type, period_start, period_end,
                    usage_count, last_reset_date, updated_at
                 ) VALUES ($1, $2, $3, $4, 1, $5, $6)
                 ON CONFLICT (account_id, feature_type, period_start) DO UPDATE SET
                    usage_count = usage_records.usage_count + 1,
                    updated_at = EXCLUDED.updated_at
                 RETURNING usage_count",
                &[
                    &account_id,
                    &feature.as_str(),
                    &key.start,
                    &key.end,
                    &key.last_reset_date,
                    &now,
                ],
            )
            .await?;
        Ok(row.try_get(0)?)
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
        let now = Utc::now();
        let client = self.pool.pick();
        let row = client
            .query_opt(
                "INSERT INTO usage_records (
                    account_id, feature_type, period_start, period_end,
                    usage_count, last_reset_date, updated_at
                 ) VALUES ($1, $2, $3, $4, 1, $5, $6)
                 ON CONFLICT (account_id, feature_type, period_start) DO UPDATE SET
                    usage_count = usage_records.usage_count + 1,
                    updated_at = EXCLUDED.updated_at
                 WHERE usage_records.usage_count < $7
                 RETURNING usage_count",
                &[
                    &account_id,
                    &feature.as_str(),
                    &key.start,
                    &key.end,
                    &key.last_reset_date,
                    &now,
                    &limit,
                ],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }

    async fn delete_all_for_account(&self, account_id: &str) -> Result<u64, QuotaError> {
        let client = self.pool.pick();
        let removed = client
            .execute("DELETE FROM usage_records WHERE account_id = $1", &[&account_id])
            .await?;
        Ok(removed)
    }
}
