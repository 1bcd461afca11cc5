use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::plans::PlanType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }
}

/// A validated `[start, end)` billing window, truncated to whole seconds so
/// values compare equal after any storage round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, QuotaError> {
        let start = start.trunc_subsecs(0);
        let end = end.trunc_subsecs(0);
        if end <= start {
            return Err(QuotaError::BadRequest(format!(
                "period end {end} must be after start {start}"
            )));
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub account_id: String,
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub external_membership_id: Option<String>,
    pub external_product_id: Option<String>,
    /// Set when a new period was written but its ledger reset has not been confirmed.
    #[serde(skip)]
    pub usage_reset_pending: bool,
    /// Optimistic-concurrency counter, bumped by every row write.
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Status alone is not trusted: a lagging sweep can leave an ended row `Active`.
    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.ends_at > now
    }

    pub fn period(&self) -> BillingPeriod {
        BillingPeriod {
            start: self.started_at,
            end: self.ends_at,
        }
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.ends_at - now).num_days().max(0)
    }
}

/// Durable one-row-per-account subscription state.
///
/// Only the lifecycle coordinator writes through this trait.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, account_id: &str) -> Result<Option<Subscription>, QuotaError>;

    /// Whole-row replace keyed by `account_id`, last writer wins.
    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), QuotaError>;

    /// Writes the row only if the stored version still equals `expected_version`
    /// (`None` = row must not exist yet). Returns whether the write happened.
    async fn compare_and_upsert_subscription(
        &self,
        subscription: &Subscription,
        expected_version: Option<i64>,
    ) -> Result<bool, QuotaError>;

    /// Moves every `Active` row with `ends_at <= now` to `Expired`; returns rows changed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, QuotaError>;

    /// Clears `usage_reset_pending` if the row is still on the period starting at `started_at`.
    async fn finish_usage_reset(
        &self,
        account_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, QuotaError>;
}
