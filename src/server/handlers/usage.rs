use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::QuotaError;
use crate::plans::FeatureType;
use crate::quota::{CommitOutcome, UsageStatus};
use crate::server::AppState;
use crate::server::util::bounded;

fn parse_feature(raw: &str) -> Result<FeatureType, QuotaError> {
    FeatureType::parse(raw).ok_or_else(|| QuotaError::UnknownFeature(raw.to_string()))
}

pub async fn get_usage(
    State(app_state): State<Arc<AppState>>,
    Path((account_id, feature)): Path<(String, String)>,
) -> Result<Json<UsageStatus>, QuotaError> {
    let feature = parse_feature(&feature)?;
    let status = bounded(
        app_state.config.storage.timeout(),
        app_state.evaluator.evaluate(&account_id, feature),
    )
    .await?;
    Ok(Json(status))
}

pub async fn commit_usage(
    State(app_state): State<Arc<AppState>>,
    Path((account_id, feature)): Path<(String, String)>,
) -> Result<(StatusCode, Json<serde_json::Value>), QuotaError> {
    let feature = parse_feature(&feature)?;
    let outcome = bounded(
        app_state.config.storage.timeout(),
        app_state.evaluator.commit(&account_id, feature),
    )
    .await?;

    Ok(match outcome {
        CommitOutcome::Committed {
            new_usage,
            remaining,
        } => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "newUsage": new_usage,
                "remaining": remaining,
            })),
        ),
        CommitOutcome::Unlimited => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "remaining": crate::plans::UNLIMITED,
                "isUnlimited": true,
            })),
        ),
        CommitOutcome::Denied {
            reason,
            usage,
            limit,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "error": reason.as_str(),
                "usage": usage,
                "limit": limit,
            })),
        ),
    })
}
