use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::error::QuotaError;
use crate::plans::PlanType;
use crate::storage::postgres_store::PgStore;
use crate::subscription::{Subscription, SubscriptionStatus, SubscriptionStore};

fn row_to_subscription(row: &Row) -> Result<Subscription, QuotaError> {
    let plan_s: String = row.try_get(1)?;
    let status_s: String = row.try_get(2)?;
    let plan_type = PlanType::parse(&plan_s)
        .ok_or_else(|| QuotaError::StorageUnavailable(format!("invalid plan_type in row: {plan_s}")))?;
    let status = SubscriptionStatus::parse(&status_s)
        .ok_or_else(|| QuotaError::StorageUnavailable(format!("invalid status in row: {status_s}")))?;
    Ok(Subscription {
        account_id: row.try_get(0)?,
        plan_type,
        status,
        started_at: row.try_get(3)?,
        ends_at: row.try_get(4)?,
        external_membership_id: row.try_get(5)?,
        external_product_id: row.try_get(6)?,
        usage_reset_pending: row.try_get(7)?,
        version: row.try_get(8)?,
        created_at: row.try_get(9)?,
        updated_at: row.try_get(10)?,
    })
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn get_subscription(&self, account_id: &str) -> Result<Option<Subscription>, QuotaError> {
        let client = self.pool.pick();
        let row = client
            .query_opt(
                "SELECT account_id, plan_type, status, started_at, ends_at,
                        external_membership_id, external_product_id, usage_reset_pending,
                        version, created_at, updated_at
                 FROM subscriptions WHERE account_id = $1",
                &[&account_id],
            )
            .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn upsert_subscription(&self, s: &Subscription) -> Result<(), QuotaError> {
        let client = self.pool.pick();
        client
            .execute(
                "INSERT INTO subscriptions (
                    account_id, plan_type, status, started_at, ends_at,
                    external_membership_id, external_product_id, usage_reset_pending,
                    version, created_at, updated_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, $10)
                 ON CONFLICT (account_id) DO UPDATE SET
                    plan_type = EXCLUDED.plan_type,
                    status = EXCLUDED.status,
                    started_at = EXCLUDED.started_at,
                    ends_at = EXCLUDED.ends_at,
                    external_membership_id = EXCLUDED.external_membership_id,
                    external_product_id = EXCLUDED.external_product_id,
                    usage_reset_pending = EXCLUDED.usage_reset_pending,
                    version = subscriptions.version + 1,
                    updated_at = EXCLUDED.updated_at",
                &[
                    &s.account_id,
                    &s.plan_type.as_str(),
                    &s.status.as_str(),
                    &s.started_at,
                    &s.ends_at,
                    &s.external_membership_id,
                    &s.external_product_id,
                    &s.usage_reset_pending,
                    &s.created_at,
                    &s.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn compare_and_upsert_subscription(
        &self,
        s: &Subscription,
        expected_version: Option<i64>,
    ) -> Result<bool, QuotaError> {
        let client = self.pool.pick();
        let changed = match expected_version {
            None => {
                client
                    .execute(
                        "INSERT INTO subscriptions (
                            account_id, plan_type, status, started_at, ends_at,
                            external_membership_id, external_product_id, usage_reset_pending,
                            version, created_at, updated_at
                         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, $10)
                         ON CONFLICT (account_id) DO NOTHING",
                        &[
                            &s.account_id,
                            &s.plan_type.as_str(),
                            &s.status.as_str(),
                            &s.started_at,
                            &s.ends_at,
                            &s.external_membership_id,
                            &s.external_product_id,
                            &s.usage_reset_pending,
                            &s.created_at,
                            &s.updated_at,
                        ],
                    )
                    .await?
            }
            Some(expected) => {
                client
                    .execute(
                        "UPDATE subscriptions SET
                            plan_type = $2,
                            status = $3,
                            started_at = $4,
                            ends_at = $5,
                            external_membership_id = $6,
                            external_product_id = $7,
                            usage_reset_pending = $8,
                            version = version + 1,
                            updated_at = $9
                         WHERE account_id = $1 AND version = $10",
                        &[
                            &s.account_id,
                            &s.plan_type.as_str(),
                            &s.status.as_str(),
                            &s.started_at,
                            &s.ends_at,
                            &s.external_membership_id,
                            &s.external_product_id,
                            &s.usage_reset_pending,
                            &s.updated_at,
                            &expected,
                        ],
                    )
                    .await?
            }
        };
        Ok(changed == 1)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, QuotaError> {
        let client = self.pool.pick();
        let changed = client
            .execute(
                "UPDATE subscriptions
                 SET status = 'expired', version = version + 1, updated_at = $1
                 WHERE status = 'active' AND ends_at <= $1",
                &[&now],
            )
            .await?;
        Ok(changed)
    }

    async fn finish_usage_reset(
        &self,
        account_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        let client = self.pool.pick();
        let changed = client
            .execute(
                "UPDATE subscriptions
                 SET usage_reset_pending = FALSE, version = version + 1
                 WHERE account_id = $1 AND started_at = $2 AND usage_reset_pending",
                &[&account_id, &started_at],
            )
            .await?;
        Ok(changed == 1)
    }
}
