use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::settings::Enforcement;
use crate::error::QuotaError;
use crate::plans::{FeatureType, PlanCatalog, PlanType, QuotaDef, UNLIMITED};
use crate::subscription::{Subscription, SubscriptionStore};
use crate::usage::{PeriodKey, UsageLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoSubscription,
    SubscriptionExpired,
    InvalidPlan,
    UnknownFeature,
    UsageLimitReached,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NoSubscription => "no_subscription",
            DenyReason::SubscriptionExpired => "subscription_expired",
            DenyReason::InvalidPlan => "invalid_plan",
            DenyReason::UnknownFeature => "unknown_feature",
            DenyReason::UsageLimitReached => "usage_limit_reached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub usage: i64,
    /// `-1` when unlimited.
    pub limit: i64,
    /// `-1` when unlimited.
    pub remaining: i64,
    pub has_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    pub is_unlimited: bool,
}

impl UsageStatus {
    pub fn denied(reason: DenyReason) -> Self {
        Self {
            usage: 0,
            limit: 0,
            remaining: 0,
            has_access: false,
            reason: Some(reason),
            is_unlimited: false,
        }
    }

    fn unlimited() -> Self {
        Self {
            usage: 0,
            limit: UNLIMITED,
            remaining: UNLIMITED,
            has_access: true,
            reason: None,
            is_unlimited: true,
        }
    }

    fn metered(usage: i64, limit: i64) -> Self {
        let remaining = (limit - usage).max(0);
        let has_access = remaining > 0;
        Self {
            usage,
            limit,
            remaining,
            has_access,
            reason: (!has_access).then_some(DenyReason::UsageLimitReached),
            is_unlimited: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { new_usage: i64, remaining: i64 },
    /// Allowed without touching the ledger.
    Unlimited,
    Denied {
        reason: DenyReason,
        usage: i64,
        limit: i64,
    },
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CommitOutcome::Denied { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub has_active_subscription: bool,
    pub plan_type: PlanType,
    pub ends_at: Option<DateTime<Utc>>,
    pub days_remaining: i64,
    pub features: BTreeMap<FeatureType, UsageStatus>,
}

enum Resolution {
    Denied(UsageStatus),
    Unlimited,
    Metered {
        quota: QuotaDef,
        key: PeriodKey,
        status: UsageStatus,
    },
}

/// Read-side of the engine: access decisions and the usage increment.
pub struct QuotaEvaluator {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn UsageLedger>,
    catalog: Arc<PlanCatalog>,
    enforcement: Enforcement,
}

impl QuotaEvaluator {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn UsageLedger>,
        catalog: Arc<PlanCatalog>,
        enforcement: Enforcement,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            catalog,
            enforcement,
        }
    }

    pub async fn evaluate(
        &self,
        account_id: &str,
        feature: FeatureType,
    ) -> Result<UsageStatus, QuotaError> {
        self.evaluate_at(account_id, feature, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        account_id: &str,
        feature: FeatureType,
        now: DateTime<Utc>,
    ) -> Result<UsageStatus, QuotaError> {
        let subscription = self.subscriptions.get_subscription(account_id).await?;
        let resolution = self.resolve(subscription.as_ref(), feature, now).await?;
        Ok(match resolution {
            Resolution::Denied(status) => status,
            Resolution::Unlimited => UsageStatus::unlimited(),
            Resolution::Metered { status, .. } => status,
        })
    }

    pub async fn can_use(&self, account_id: &str, feature: FeatureType) -> Result<bool, QuotaError> {
        Ok(self.evaluate(account_id, feature).await?.has_access)
    }

    pub async fn commit(
        &self,
        account_id: &str,
        feature: FeatureType,
    ) -> Result<CommitOutcome, QuotaError> {
        self.commit_at(account_id, feature, Utc::now()).await
    }

    pub async fn commit_at(
        &self,
        account_id: &str,
        feature: FeatureType,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, QuotaError> {
        let subscription = self.subscriptions.get_subscription(account_id).await?;
        let (quota, key, status) = match self.resolve(subscription.as_ref(), feature, now).await? {
            Resolution::Denied(status) => {
                return Ok(denied(account_id, feature, &status));
            }
            Resolution::Unlimited => return Ok(CommitOutcome::Unlimited),
            Resolution::Metered { quota, key, status } => (quota, key, status),
        };
        if !status.has_access {
            return Ok(denied(account_id, feature, &status));
        }

        let new_usage = match self.enforcement {
            Enforcement::Strict => {
                match self
                    .ledger
                    .atomic_increment_within(account_id, feature, &key, quota.limit)
                    .await?
                {
                    Some(n) => n,
                    // another commit took the last unit between the check and the increment
                    None => {
                        let status = UsageStatus::metered(quota.limit, quota.limit);
                        return Ok(denied(account_id, feature, &status));
                    }
                }
            }
            Enforcement::Soft => self.ledger.atomic_increment(account_id, feature, &key).await?,
        };

        tracing::debug!(
            account_id,
            feature = feature.as_str(),
            usage = new_usage,
            limit = quota.limit,
            "usage committed"
        );
        Ok(CommitOutcome::Committed {
            new_usage,
            remaining: (quota.limit - new_usage).max(0),
        })
    }

    pub async fn subscription_summary(&self, account_id: &str) -> Result<SubscriptionSummary, QuotaError> {
        self.subscription_summary_at(account_id, Utc::now()).await
    }

    pub async fn subscription_summary_at(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionSummary, QuotaError> {
        let Some(subscription) = self.subscriptions.get_subscription(account_id).await? else {
            return Ok(SubscriptionSummary {
                has_active_subscription: false,
                plan_type: PlanType::None,
                ends_at: None,
                days_remaining: 0,
                features: BTreeMap::new(),
            });
        };

        let mut features = BTreeMap::new();
        if let Some(plan) = self.catalog.resolve(subscription.plan_type) {
            for feature in plan.features.keys().copied() {
                let status = match self.resolve(Some(&subscription), feature, now).await? {
                    Resolution::Denied(status) => status,
                    Resolution::Unlimited => UsageStatus::unlimited(),
                    Resolution::Metered { status, .. } => status,
                };
                features.insert(feature, status);
            }
        }

        let active = subscription.is_entitled(now);
        Ok(SubscriptionSummary {
            has_active_subscription: active,
            plan_type: subscription.plan_type,
            ends_at: Some(subscription.ends_at),
            days_remaining: if active { subscription.days_remaining(now) } else { 0 },
            features,
        })
    }

    async fn resolve(
        &self,
        subscription: Option<&Subscription>,
        feature: FeatureType,
        now: DateTime<Utc>,
    ) -> Result<Resolution, QuotaError> {
        let Some(subscription) = subscription else {
            return Ok(Resolution::Denied(UsageStatus::denied(DenyReason::NoSubscription)));
        };
        if !subscription.is_entitled(now) {
            return Ok(Resolution::Denied(UsageStatus::denied(
                DenyReason::SubscriptionExpired,
            )));
        }
        let Some(plan) = self.catalog.resolve(subscription.plan_type) else {
            return Ok(Resolution::Denied(UsageStatus::denied(DenyReason::InvalidPlan)));
        };
        let Some(quota) = plan.quota(feature) else {
            return Ok(Resolution::Denied(UsageStatus::denied(DenyReason::UnknownFeature)));
        };
        if quota.is_unlimited() {
            return Ok(Resolution::Unlimited);
        }

        let key = PeriodKey::derive(quota.period, subscription, now);
        let usage = self
            .ledger
            .get_usage(&subscription.account_id, feature, key.start)
            .await?
            .map(|r| r.usage_count)
            .unwrap_or(0);
        Ok(Resolution::Metered {
            quota,
            key,
            status: UsageStatus::metered(usage, quota.limit),
        })
    }
}

fn denied(account_id: &str, feature: FeatureType, status: &UsageStatus) -> CommitOutcome {
    let reason = status.reason.unwrap_or(DenyReason::UsageLimitReached);
    tracing::info!(
        account_id,
        feature = feature.as_str(),
        reason = reason.as_str(),
        usage = status.usage,
        limit = status.limit,
        "commit denied"
    );
    CommitOutcome::Denied {
        reason,
        usage: status.usage,
        limit: status.limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::QuotaPeriod;
    use crate::storage::SqliteStore;
    use crate::subscription::SubscriptionStatus;
    use chrono::{Duration, SubsecRound};
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<SqliteStore>,
        evaluator: Arc<QuotaEvaluator>,
    }

    async fn harness(enforcement: Enforcement) -> Harness {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Arc::new(SqliteStore::new(db_path.to_str().unwrap()).await.unwrap());
        let overrides = HashMap::from([(
            "starter".to_string(),
            crate::config::settings::PlanConfig {
                price: 9.99,
                features: HashMap::from([
                    ("draft_reply".to_string(), QuotaDef::new(5, QuotaPeriod::Monthly)),
                    ("ai_chat".to_string(), QuotaDef::new(200, QuotaPeriod::Daily)),
                    ("smart_categorize".to_string(), QuotaDef::new(UNLIMITED, QuotaPeriod::Monthly)),
                ]),
            },
        )]);
        let catalog = Arc::new(PlanCatalog::with_overrides(&overrides, &HashMap::new()).unwrap());
        let evaluator = Arc::new(QuotaEvaluator::new(
            db.clone(),
            db.clone(),
            catalog,
            enforcement,
        ));
        Harness {
            _dir: dir,
            db,
            evaluator,
        }
    }

    fn subscription(plan: PlanType, status: SubscriptionStatus, ends_in: Duration) -> Subscription {
        let now = Utc::now().trunc_subsecs(0);
        Subscription {
            account_id: "acc".into(),
            plan_type: plan,
            status,
            started_at: now - Duration::days(1),
            ends_at: now + ends_in,
            external_membership_id: Some("mem".into()),
            external_product_id: None,
            usage_reset_pending: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed(h: &Harness, sub: Subscription) {
        h.db.upsert_subscription(&sub).await.unwrap();
    }

    #[tokio::test]
    async fn missing_subscription_is_a_typed_denial() {
        let h = harness(Enforcement::Strict).await;
        let status = h.evaluator.evaluate("acc", FeatureType::DraftReply).await.unwrap();
        assert!(!status.has_access);
        assert_eq!(status.reason, Some(DenyReason::NoSubscription));
        assert!(!h.evaluator.can_use("acc", FeatureType::DraftReply).await.unwrap());
    }

    #[tokio::test]
    async fn active_status_with_past_end_is_expired() {
        let h = harness(Enforcement::Strict).await;
        seed(
            &h,
            subscription(PlanType::Starter, SubscriptionStatus::Active, -Duration::minutes(1)),
        )
        .await;
        let status = h.evaluator.evaluate("acc", FeatureType::DraftReply).await.unwrap();
        assert!(!status.has_access);
        assert_eq!(status.reason, Some(DenyReason::SubscriptionExpired));

        let outcome = h.evaluator.commit("acc", FeatureType::DraftReply).await.unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Denied { reason: DenyReason::SubscriptionExpired, .. }
        ));
    }

    #[tokio::test]
    async fn cancelled_subscription_loses_access() {
        let h = harness(Enforcement::Strict).await;
        seed(
            &h,
            subscription(PlanType::Starter, SubscriptionStatus::Cancelled, Duration::days(10)),
        )
        .await;
        let status = h.evaluator.evaluate("acc", FeatureType::DraftReply).await.unwrap();
        assert_eq!(status.reason, Some(DenyReason::SubscriptionExpired));
    }

    #[tokio::test]
    async fn unresolvable_plan_and_feature_are_denied() {
        let h = harness(Enforcement::Strict).await;
        seed(&h, subscription(PlanType::None, SubscriptionStatus::Active, Duration::days(10))).await;
        let status = h.evaluator.evaluate("acc", FeatureType::DraftReply).await.unwrap();
        assert_eq!(status.reason, Some(DenyReason::InvalidPlan));

        seed(&h, subscription(PlanType::Starter, SubscriptionStatus::Active, Duration::days(10))).await;
        let status = h.evaluator.evaluate("acc", FeatureType::BulkActions).await.unwrap();
        assert_eq!(status.reason, Some(DenyReason::UnknownFeature));
    }

    #[tokio::test]
    async fn unlimited_features_never_touch_the_ledger() {
        let h = harness(Enforcement::Strict).await;
        let sub = subscription(PlanType::Starter, SubscriptionStatus::Active, Duration::days(10));
        let month_start = sub.started_at.date_naive();
        seed(&h, sub).await;

        for _ in 0..3 {
            let status = h
                .evaluator
                .evaluate("acc", FeatureType::SmartCategorize)
                .await
                .unwrap();
            assert!(status.has_access);
            assert!(status.is_unlimited);
            let outcome = h
                .evaluator
                .commit("acc", FeatureType::SmartCategorize)
                .await
                .unwrap();
            assert_eq!(outcome, CommitOutcome::Unlimited);
        }
        assert!(h
            .db
            .get_usage("acc", FeatureType::SmartCategorize, month_start)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn commits_are_monotonic_and_stop_at_limit() {
        let h = harness(Enforcement::Strict).await;
        seed(&h, subscription(PlanType::Starter, SubscriptionStatus::Active, Duration::days(10))).await;

        for expected in 1..=5 {
            let outcome = h.evaluator.commit("acc", FeatureType::DraftReply).await.unwrap();
            assert_eq!(
                outcome,
                CommitOutcome::Committed {
                    new_usage: expected,
                    remaining: 5 - expected
                }
            );
        }
        let sixth = h.evaluator.commit("acc", FeatureType::DraftReply).await.unwrap();
        assert_eq!(
            sixth,
            CommitOutcome::Denied {
                reason: DenyReason::UsageLimitReached,
                usage: 5,
                limit: 5
            }
        );
        let status = h.evaluator.evaluate("acc", FeatureType::DraftReply).await.unwrap();
        assert_eq!(status.usage, 5);
        assert_eq!(status.remaining, 0);
        assert!(!status.has_access);
        assert_eq!(status.reason, Some(DenyReason::UsageLimitReached));
    }

    #[tokio::test]
    async fn daily_feature_rolls_over_at_midnight() {
        let h = harness(Enforcement::Strict).await;
        seed(&h, subscription(PlanType::Starter, SubscriptionStatus::Active, Duration::days(10))).await;
        let today = Utc::now();
        h.evaluator
            .commit_at("acc", FeatureType::AiChat, today)
            .await
            .unwrap();
        h.evaluator
            .commit_at("acc", FeatureType::AiChat, today)
            .await
            .unwrap();
        let status = h
            .evaluator
            .evaluate_at("acc", FeatureType::AiChat, today)
            .await
            .unwrap();
        assert_eq!(status.usage, 2);

        let tomorrow = today + Duration::days(1);
        let status = h
            .evaluator
            .evaluate_at("acc", FeatureType::AiChat, tomorrow)
            .await
            .unwrap();
        assert_eq!(status.usage, 0);
        assert_eq!(status.remaining, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_count_exactly() {
        let h = harness(Enforcement::Strict).await;
        seed(&h, subscription(PlanType::Starter, SubscriptionStatus::Active, Duration::days(10))).await;

        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let evaluator = h.evaluator.clone();
            handles.push(tokio::spawn(async move {
                evaluator.commit_at("acc", FeatureType::AiChat, now).await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }
        let status = h
            .evaluator
            .evaluate_at("acc", FeatureType::AiChat, now)
            .await
            .unwrap();
        assert_eq!(status.usage, 100);
        assert_eq!(status.remaining, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn strict_enforcement_never_overshoots_under_contention() {
        let h = harness(Enforcement::Strict).await;
        seed(&h, subscription(PlanType::Starter, SubscriptionStatus::Active, Duration::days(10))).await;

        let mut handles = Vec::new();
        for _ in 0..40 {
            let evaluator = h.evaluator.clone();
            handles.push(tokio::spawn(async move {
                evaluator.commit("acc", FeatureType::DraftReply).await.unwrap()
            }));
        }
        let mut committed = 0;
        for handle in handles {
            if handle.await.unwrap().is_success() {
                committed += 1;
            }
        }
        assert_eq!(committed, 5);
        let status = h.evaluator.evaluate("acc", FeatureType::DraftReply).await.unwrap();
        assert_eq!(status.usage, 5);
    }

    #[tokio::test]
    async fn soft_enforcement_still_denies_after_limit() {
        let h = harness(Enforcement::Soft).await;
        seed(&h, subscription(PlanType::Starter, SubscriptionStatus::Active, Duration::days(10))).await;
        for _ in 0..5 {
            assert!(h
                .evaluator
                .commit("acc", FeatureType::DraftReply)
                .await
                .unwrap()
                .is_success());
        }
        let outcome = h.evaluator.commit("acc", FeatureType::DraftReply).await.unwrap();
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn summary_lists_every_plan_feature() {
        let h = harness(Enforcement::Strict).await;
        let none = h.evaluator.subscription_summary("acc").await.unwrap();
        assert!(!none.has_active_subscription);
        assert_eq!(none.plan_type, PlanType::None);
        assert!(none.features.is_empty());

        seed(
            &h,
            subscription(
                PlanType::Starter,
                SubscriptionStatus::Active,
                Duration::days(12) + Duration::hours(2),
            ),
        )
        .await;
        h.evaluator.commit("acc", FeatureType::DraftReply).await.unwrap();

        let summary = h.evaluator.subscription_summary("acc").await.unwrap();
        assert!(summary.has_active_subscription);
        assert_eq!(summary.plan_type, PlanType::Starter);
        assert_eq!(summary.days_remaining, 12);
        assert_eq!(summary.features.len(), 3);
        assert_eq!(summary.features[&FeatureType::DraftReply].usage, 1);
        assert!(summary.features[&FeatureType::SmartCategorize].is_unlimited);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["features"]["draft_reply"]["remaining"], 4);
        assert_eq!(json["planType"], "starter");
    }
}
