use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::QuotaError;
use crate::plans::PlanType;
use crate::storage::database::SqliteStore;
use crate::storage::time::{parse_datetime_string, sql_conversion_error, to_iso8601_utc_string};
use crate::subscription::{Subscription, SubscriptionStatus, SubscriptionStore};

const SELECT_COLUMNS: &str = "account_id, plan_type, status, started_at, ends_at, \
     external_membership_id, external_product_id, usage_reset_pending, version, \
     created_at, updated_at";

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_datetime_string(&raw).map_err(|e| sql_conversion_error(idx, e))
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let plan_s: String = row.get(1)?;
    let status_s: String = row.get(2)?;
    let plan_type = PlanType::parse(&plan_s).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(1, "plan_type".into(), rusqlite::types::Type::Text)
    })?;
    let status = SubscriptionStatus::parse(&status_s).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(2, "status".into(), rusqlite::types::Type::Text)
    })?;
    Ok(Subscription {
        account_id: row.get(0)?,
        plan_type,
        status,
        started_at: parse_ts(row, 3)?,
        ends_at: parse_ts(row, 4)?,
        external_membership_id: row.get(5)?,
        external_product_id: row.get(6)?,
        usage_reset_pending: row.get(7)?,
        version: row.get(8)?,
        created_at: parse_ts(row, 9)?,
        updated_at: parse_ts(row, 10)?,
    })
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn get_subscription(&self, account_id: &str) -> Result<Option<Subscription>, QuotaError> {
        let conn = self.connection.lock().await;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM subscriptions WHERE account_id = ?1");
        let sub = conn
            .query_row(&sql, [account_id], row_to_subscription)
            .optional()?;
        Ok(sub)
    }

    async fn upsert_subscription(&self, s: &Subscription) -> Result<(), QuotaError> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO subscriptions (
                account_id, plan_type, status, started_at, ends_at,
                external_membership_id, external_product_id, usage_reset_pending,
                version, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)
             ON CONFLICT(account_id) DO UPDATE SET
                plan_type = excluded.plan_type,
                status = excluded.status,
                started_at = excluded.started_at,
                ends_at = excluded.ends_at,
                external_membership_id = excluded.external_membership_id,
                external_product_id = excluded.external_product_id,
                usage_reset_pending = excluded.usage_reset_pending,
                version = subscriptions.version + 1,
                updated_at = excluded.updated_at",
            rusqlite::params![
                &s.account_id,
                s.plan_type.as_str(),
                s.status.as_str(),
                to_iso8601_utc_string(&s.started_at),
                to_iso8601_utc_string(&s.ends_at),
                &s.external_membership_id,
                &s.external_product_id,
                s.usage_reset_pending,
                to_iso8601_utc_string(&s.created_at),
                to_iso8601_utc_string(&s.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn compare_and_upsert_subscription(
        &self,
        s: &Subscription,
        expected_version: Option<i64>,
    ) -> Result<bool, QuotaError> {
        let conn = self.connection.lock().await;
        let changed = match expected_version {
            None => conn.execute(
                "INSERT INTO subscriptions (
                    account_id, plan_type, status, started_at, ends_at,
                    external_membership_id, external_product_id, usage_reset_pending,
                    version, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)
                 ON CONFLICT(account_id) DO NOTHING",
                rusqlite::params![
                    &s.account_id,
                    s.plan_type.as_str(),
                    s.status.as_str(),
                    to_iso8601_utc_string(&s.started_at),
                    to_iso8601_utc_string(&s.ends_at),
                    &s.external_membership_id,
                    &s.external_product_id,
                    s.usage_reset_pending,
                    to_iso8601_utc_string(&s.created_at),
                    to_iso8601_utc_string(&s.updated_at),
                ],
            )?,
            Some(expected) => conn.execute(
                "UPDATE subscriptions SET
                    plan_type = ?2,
                    status = ?3,
                    started_at = ?4,
                    ends_at = ?5,
                    external_membership_id = ?6,
                    external_product_id = ?7,
                    usage_reset_pending = ?8,
                    version = version + 1,
                    updated_at = ?9
                 WHERE account_id = ?1 AND version = ?10",
                rusqlite::params![
                    &s.account_id,
                    s.plan_type.as_str(),
                    s.status.as_str(),
                    to_iso8601_utc_string(&s.started_at),
                    to_iso8601_utc_string(&s.ends_at),
                    &s.external_membership_id,
                    &s.external_product_id,
                    s.usage_reset_pending,
                    to_iso8601_utc_string(&s.updated_at),
                    expected,
                ],
            )?,
        };
        Ok(changed == 1)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, QuotaError> {
        let now_s = to_iso8601_utc_string(&now);
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE subscriptions
             SET status = 'expired', version = version + 1, updated_at = ?1
             WHERE status = 'active' AND ends_at <= ?1",
            [&now_s],
        )?;
        Ok(changed as u64)
    }

    async fn finish_usage_reset(
        &self,
        account_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        let conn = self.connection.lock().await;
        let changed = conn.execute(
            "UPDATE subscriptions
             SET usage_reset_pending = 0, version = version + 1
             WHERE account_id = ?1 AND started_at = ?2 AND usage_reset_pending = 1",
            rusqlite::params![account_id, to_iso8601_utc_string(&started_at)],
        )?;
        Ok(changed == 1)
    }
}
