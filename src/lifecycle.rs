use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::QuotaError;
use crate::plans::{PlanCatalog, PlanType};
use crate::subscription::{BillingPeriod, Subscription, SubscriptionStatus, SubscriptionStore};
use crate::usage::UsageLedger;

/// Bounded retries when a concurrent writer bumps the row version first.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// What caused an activation. Logged only; it never changes the reset decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    Purchase,
    Renewal,
    Reauth,
    Manual,
}

impl ActivationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivationSource::Purchase => "purchase",
            ActivationSource::Renewal => "renewal",
            ActivationSource::Reauth => "reauth",
            ActivationSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivationRequest {
    pub account_id: String,
    pub plan_type: PlanType,
    pub external_membership_id: Option<String>,
    pub external_product_id: Option<String>,
    pub period: BillingPeriod,
    pub source: ActivationSource,
}

/// Whether an activation opens a new usage period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationDecision {
    /// Fresh subscription, different plan or membership, or a later period: usage starts at zero.
    NewPeriod,
    /// Same period the account is already in (re-auth, duplicate delivery): usage untouched.
    SamePeriod,
    /// An earlier period than stored: out-of-order delivery, ignored whatever its plan.
    Stale,
}

impl ActivationDecision {
    pub fn decide(existing: Option<&Subscription>, request: &ActivationRequest) -> Self {
        let Some(prev) = existing else {
            return ActivationDecision::NewPeriod;
        };
        if request.period.start < prev.started_at {
            return ActivationDecision::Stale;
        }
        // A request without a membership id says nothing about the membership.
        let membership_changed = request
            .external_membership_id
            .as_ref()
            .is_some_and(|incoming| prev.external_membership_id.as_ref() != Some(incoming));
        if prev.plan_type != request.plan_type
            || membership_changed
            || request.period.start > prev.started_at
        {
            ActivationDecision::NewPeriod
        } else {
            ActivationDecision::SamePeriod
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivationDecision::NewPeriod => "new_period",
            ActivationDecision::SamePeriod => "same_period",
            ActivationDecision::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationResult {
    pub decision: ActivationDecision,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    #[serde(rename = "activated", alias = "membership.went_valid")]
    Activated,
    #[serde(rename = "renewed", alias = "membership.renewed")]
    Renewed,
    #[serde(rename = "invalidated", alias = "membership.went_invalid")]
    Invalidated,
    #[serde(rename = "cancelled", alias = "membership.cancelled")]
    Cancelled,
}

/// Inbound payment-provider event. Authenticity is checked before it gets here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub action: LifecycleAction,
    pub account_id: String,
    #[serde(default)]
    pub external_membership_id: Option<String>,
    #[serde(default)]
    pub external_product_id: Option<String>,
    /// Overrides the product-id lookup when present.
    #[serde(default)]
    pub plan_type: Option<PlanType>,
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Activated {
        #[serde(rename = "eventId")]
        event_id: String,
        decision: ActivationDecision,
        subscription: Subscription,
    },
    Cancelled {
        #[serde(rename = "eventId")]
        event_id: String,
        subscription: Subscription,
    },
    Ignored {
        #[serde(rename = "eventId")]
        event_id: String,
        reason: &'static str,
    },
}

/// Sole writer of subscription rows and sole authority for resetting usage.
pub struct LifecycleCoordinator {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn UsageLedger>,
    catalog: Arc<PlanCatalog>,
}

impl LifecycleCoordinator {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn UsageLedger>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            catalog,
        }
    }

    pub async fn activate(&self, request: ActivationRequest) -> Result<ActivationResult, QuotaError> {
        if self.catalog.resolve(request.plan_type).is_none() {
            return Err(QuotaError::InvalidPlan(request.plan_type.as_str().to_string()));
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let existing = self
                .subscriptions
                .get_subscription(&request.account_id)
                .await?;
            let decision = ActivationDecision::decide(existing.as_ref(), &request);
            let now = Utc::now();

            // `None` write means the stored row already matches the request.
            let (mut next, write) = match (decision, existing) {
                (ActivationDecision::Stale, Some(prev)) => {
                    tracing::warn!(
                        account_id = %request.account_id,
                        source = request.source.as_str(),
                        incoming_start = %request.period.start,
                        stored_start = %prev.started_at,
                        "ignoring activation for an earlier period"
                    );
                    return Ok(ActivationResult {
                        decision,
                        subscription: prev,
                    });
                }
                (ActivationDecision::SamePeriod, Some(prev)) => {
                    let product = request
                        .external_product_id
                        .clone()
                        .or_else(|| prev.external_product_id.clone());
                    if prev.status == SubscriptionStatus::Active
                        && prev.ends_at == request.period.end
                        && prev.external_product_id == product
                    {
                        (prev, None)
                    } else {
                        let version = prev.version;
                        let next = Subscription {
                            status: SubscriptionStatus::Active,
                            ends_at: request.period.end,
                            external_product_id: product,
                            updated_at: now,
                            ..prev
                        };
                        (next, Some(Some(version)))
                    }
                }
                (_, prev) => {
                    let next = Subscription {
                        account_id: request.account_id.clone(),
                        plan_type: request.plan_type,
                        status: SubscriptionStatus::Active,
                        started_at: request.period.start,
                        ends_at: request.period.end,
                        external_membership_id: request.external_membership_id.clone().or_else(
                            || prev.as_ref().and_then(|p| p.external_membership_id.clone()),
                        ),
                        external_product_id: request.external_product_id.clone(),
                        usage_reset_pending: true,
                        version: 0,
                        created_at: prev.as_ref().map(|p| p.created_at).unwrap_or(now),
                        updated_at: now,
                    };
                    (next, Some(prev.map(|p| p.version)))
                }
            };

            if let Some(expected_version) = write {
                if !self
                    .subscriptions
                    .compare_and_upsert_subscription(&next, expected_version)
                    .await?
                {
                    tracing::debug!(
                        account_id = %request.account_id,
                        "subscription changed concurrently, re-deciding activation"
                    );
                    continue;
                }
                next.version = expected_version.map(|v| v + 1).unwrap_or(1);
            }

            // A same-period call still finishes a reset an earlier attempt left half done,
            // but only if the flag survives a fresh read: once a concurrent call clears it,
            // commits already made in the new period must not be wiped. A reset racing a
            // commit between that read and the delete can still drop the commit.
            if next.usage_reset_pending && decision != ActivationDecision::NewPeriod {
                match self.subscriptions.get_subscription(&next.account_id).await? {
                    Some(current) if current.started_at == next.started_at => {
                        if !current.usage_reset_pending {
                            next = current;
                        }
                    }
                    _ => continue,
                }
            }
            if next.usage_reset_pending {
                self.reset_usage(&mut next).await?;
            }

            tracing::info!(
                account_id = %next.account_id,
                plan = next.plan_type.as_str(),
                source = request.source.as_str(),
                decision = decision.as_str(),
                ends_at = %next.ends_at,
                "subscription activated"
            );
            return Ok(ActivationResult {
                decision,
                subscription: next,
            });
        }

        Err(QuotaError::Conflict(format!(
            "activation for {} kept losing to concurrent writers",
            request.account_id
        )))
    }

    async fn reset_usage(&self, subscription: &mut Subscription) -> Result<(), QuotaError> {
        let removed = self
            .ledger
            .delete_all_for_account(&subscription.account_id)
            .await?;
        if self
            .subscriptions
            .finish_usage_reset(&subscription.account_id, subscription.started_at)
            .await?
        {
            subscription.version += 1;
        }
        subscription.usage_reset_pending = false;
        tracing::info!(
            account_id = %subscription.account_id,
            removed_rows = removed,
            period_start = %subscription.started_at,
            "usage reset for new period"
        );
        Ok(())
    }

    /// Moves an `Active` subscription to `Cancelled`. Usage rows are kept for audit.
    /// Returns `None` when the account never had a subscription.
    pub async fn cancel(&self, account_id: &str) -> Result<Option<Subscription>, QuotaError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(prev) = self.subscriptions.get_subscription(account_id).await? else {
                return Ok(None);
            };
            if prev.status != SubscriptionStatus::Active {
                return Ok(Some(prev));
            }
            let version = prev.version;
            let mut next = Subscription {
                status: SubscriptionStatus::Cancelled,
                updated_at: Utc::now(),
                ..prev
            };
            if self
                .subscriptions
                .compare_and_upsert_subscription(&next, Some(version))
                .await?
            {
                next.version = version + 1;
                tracing::info!(account_id, plan = next.plan_type.as_str(), "subscription cancelled");
                return Ok(Some(next));
            }
        }
        Err(QuotaError::Conflict(format!(
            "cancellation for {account_id} kept losing to concurrent writers"
        )))
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, QuotaError> {
        let expired = self.subscriptions.sweep_expired(now).await?;
        if expired > 0 {
            tracing::info!(expired, "expiry sweep moved subscriptions to expired");
        } else {
            tracing::debug!("expiry sweep found nothing to expire");
        }
        Ok(expired)
    }

    /// Applies a provider event. Safe under at-least-once delivery.
    pub async fn apply_external_event(&self, event: LifecycleEvent) -> Result<EventOutcome, QuotaError> {
        let event_id = event
            .event_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::info_span!(
            "lifecycle_event",
            event_id = %event_id,
            action = ?event.action,
            account_id = %event.account_id
        );
        self.apply_event_inner(event, event_id).instrument(span).await
    }

    async fn apply_event_inner(
        &self,
        event: LifecycleEvent,
        event_id: String,
    ) -> Result<EventOutcome, QuotaError> {
        match event.action {
            LifecycleAction::Activated | LifecycleAction::Renewed => {
                let (Some(start), Some(end)) = (event.period_start, event.period_end) else {
                    return Err(QuotaError::BadRequest(
                        "activation events need periodStart and periodEnd".into(),
                    ));
                };
                let plan_type = event
                    .plan_type
                    .or_else(|| {
                        event
                            .external_product_id
                            .as_deref()
                            .and_then(|p| self.catalog.plan_for_product(p))
                    })
                    .ok_or_else(|| {
                        QuotaError::InvalidPlan(format!(
                            "no plan for product {}",
                            event.external_product_id.as_deref().unwrap_or("<none>")
                        ))
                    })?;
                let source = if event.action == LifecycleAction::Renewed {
                    ActivationSource::Renewal
                } else {
                    ActivationSource::Purchase
                };
                let result = self
                    .activate(ActivationRequest {
                        account_id: event.account_id,
                        plan_type,
                        external_membership_id: event.external_membership_id,
                        external_product_id: event.external_product_id,
                        period: BillingPeriod::new(start, end)?,
                        source,
                    })
                    .await?;
                Ok(EventOutcome::Activated {
                    event_id,
                    decision: result.decision,
                    subscription: result.subscription,
                })
            }
            LifecycleAction::Invalidated | LifecycleAction::Cancelled => {
                let Some(current) = self.subscriptions.get_subscription(&event.account_id).await?
                else {
                    tracing::warn!("cancellation for an account without a subscription");
                    return Ok(EventOutcome::Ignored {
                        event_id,
                        reason: "no_subscription",
                    });
                };
                if let (Some(incoming), Some(stored)) = (
                    event.external_membership_id.as_deref(),
                    current.external_membership_id.as_deref(),
                ) {
                    if incoming != stored {
                        tracing::warn!(incoming, stored, "cancellation for a superseded membership");
                        return Ok(EventOutcome::Ignored {
                            event_id,
                            reason: "membership_mismatch",
                        });
                    }
                }
                if event.period_start.is_some_and(|start| start < current.started_at) {
                    tracing::warn!("cancellation for an earlier period");
                    return Ok(EventOutcome::Ignored {
                        event_id,
                        reason: "stale_period",
                    });
                }
                match self.cancel(&event.account_id).await? {
                    Some(subscription) => Ok(EventOutcome::Cancelled {
                        event_id,
                        subscription,
                    }),
                    None => Ok(EventOutcome::Ignored {
                        event_id,
                        reason: "no_subscription",
                    }),
                }
            }
        }
    }
}
