use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::QuotaError;
use crate::plans::{FeatureType, QuotaPeriod};
use crate::subscription::Subscription;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub account_id: String,
    pub feature_type: FeatureType,
    pub usage_count: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    /// Calendar day the row applies to; daily features only.
    pub last_reset_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger address for one counting period.
///
/// Daily keys roll over by themselves at UTC midnight. Monthly keys follow
/// the subscription window and change only when the lifecycle coordinator
/// moves the subscription to a new period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeriodKey {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub last_reset_date: Option<NaiveDate>,
}

impl PeriodKey {
    pub fn daily(today: NaiveDate) -> Self {
        Self {
            start: today,
            end: today,
            last_reset_date: Some(today),
        }
    }

    pub fn monthly(subscription: &Subscription) -> Self {
        Self {
            start: subscription.started_at.date_naive(),
            end: subscription.ends_at.date_naive(),
            last_reset_date: None,
        }
    }

    pub fn derive(period: QuotaPeriod, subscription: &Subscription, now: DateTime<Utc>) -> Self {
        match period {
            QuotaPeriod::Daily => Self::daily(now.date_naive()),
            QuotaPeriod::Monthly => Self::monthly(subscription),
        }
    }
}

/// Per-(account, feature, period) consumption counters.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn get_usage(
        &self,
        account_id: &str,
        feature: FeatureType,
        period_start: NaiveDate,
    ) -> Result<Option<UsageRecord>, QuotaError>;

    /// One storage statement: insert the row at 1 or add 1 to it. Returns the new count.
    async fn atomic_increment(
        &self,
        account_id: &str,
        feature: FeatureType,
        key: &PeriodKey,
    ) -> Result<i64, QuotaError>;

    /// As `atomic_increment`, but the update only applies while `usage_count < limit`.
    /// `Ok(None)` means the limit was already reached and nothing changed.
    async fn atomic_increment_within(
        &self,
        account_id: &str,
        feature: FeatureType,
        key: &PeriodKey,
        limit: i64,
    ) -> Result<Option<i64>, QuotaError>;

    /// Drops every counter for the account. Returns rows removed.
    async fn delete_all_for_account(&self, account_id: &str) -> Result<u64, QuotaError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::PlanType;
    use crate::subscription::SubscriptionStatus;
    use chrono::TimeZone;

    fn subscription(start: DateTime<Utc>, end: DateTime<Utc>) -> Subscription {
        Subscription {
            account_id: "acc".into(),
            plan_type: PlanType::Starter,
            status: SubscriptionStatus::Active,
            started_at: start,
            ends_at: end,
            external_membership_id: None,
            external_product_id: None,
            usage_reset_pending: false,
            version: 1,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn daily_key_is_today_in_utc() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let sub = subscription(start, Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 23, 59, 59).unwrap();
        let key = PeriodKey::derive(QuotaPeriod::Daily, &sub, now);
        let day = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(key.start, day);
        assert_eq!(key.end, day);
        assert_eq!(key.last_reset_date, Some(day));

        let next = PeriodKey::derive(QuotaPeriod::Daily, &sub, now + chrono::Duration::seconds(1));
        assert_ne!(next.start, key.start);
    }

    #[test]
    fn monthly_key_follows_subscription_window() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        let sub = subscription(start, end);
        let a = PeriodKey::derive(QuotaPeriod::Monthly, &sub, start);
        let b = PeriodKey::derive(QuotaPeriod::Monthly, &sub, end - chrono::Duration::hours(1));
        assert_eq!(a, b);
        assert_eq!(a.start, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(a.end, NaiveDate::from_ymd_opt(2026, 3, 31).unwrap());
        assert_eq!(a.last_reset_date, None);
    }
}
