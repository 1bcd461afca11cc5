use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::QuotaError;
use crate::lifecycle::{ActivationRequest, ActivationResult, ActivationSource};
use crate::plans::PlanType;
use crate::quota::SubscriptionSummary;
use crate::server::AppState;
use crate::server::util::bounded;
use crate::subscription::{BillingPeriod, Subscription};

pub async fn get_summary(
    State(app_state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<SubscriptionSummary>, QuotaError> {
    let summary = bounded(
        app_state.config.storage.timeout(),
        app_state.evaluator.subscription_summary(&account_id),
    )
    .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub plan_type: String,
    #[serde(default)]
    pub external_membership_id: Option<String>,
    #[serde(default)]
    pub external_product_id: Option<String>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<ActivationSource>,
}

pub async fn activate(
    State(app_state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(payload): Json<ActivateRequest>,
) -> Result<Json<ActivationResult>, QuotaError> {
    let plan_type = PlanType::parse(&payload.plan_type)
        .ok_or_else(|| QuotaError::InvalidPlan(payload.plan_type.clone()))?;
    let request = ActivationRequest {
        account_id,
        plan_type,
        external_membership_id: payload.external_membership_id,
        external_product_id: payload.external_product_id,
        period: BillingPeriod::new(payload.period_start, payload.period_end)?,
        source: payload.source.unwrap_or(ActivationSource::Manual),
    };
    let result = bounded(
        app_state.config.storage.timeout(),
        app_state.lifecycle.activate(request),
    )
    .await?;
    Ok(Json(result))
}

pub async fn cancel(
    State(app_state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<Subscription>, QuotaError> {
    let cancelled = bounded(
        app_state.config.storage.timeout(),
        app_state.lifecycle.cancel(&account_id),
    )
    .await?;
    cancelled.map(Json).ok_or(QuotaError::NoSubscription)
}
