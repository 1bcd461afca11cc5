use axum::{Json, body::Bytes, extract::State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::QuotaError;
use crate::lifecycle::{EventOutcome, LifecycleEvent};
use crate::server::AppState;
use crate::server::util::bounded;

/// Provider webhook ingress. Signature verification happens upstream.
pub async fn apply_event(
    State(app_state): State<Arc<AppState>>,
    Json(event): Json<LifecycleEvent>,
) -> Result<Json<EventOutcome>, QuotaError> {
    let outcome = bounded(
        app_state.config.storage.timeout(),
        app_state.lifecycle.apply_external_event(event),
    )
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

pub async fn sweep(
    State(app_state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, QuotaError> {
    // Body is optional; an empty POST sweeps at the current time.
    let request: SweepRequest = if body.is_empty() {
        SweepRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let now = request.now.unwrap_or_else(Utc::now);
    let expired = bounded(
        app_state.config.storage.timeout(),
        app_state.lifecycle.sweep(now),
    )
    .await?;
    Ok(Json(serde_json::json!({ "expired": expired })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_app;
    use axum::http::StatusCode;
    use chrono::{Duration, SubsecRound, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn provider_webhooks_drive_the_lifecycle() {
        let app = test_app().await;
        let start = Utc::now().trunc_subsecs(0) - Duration::days(1);
        let went_valid = json!({
            "eventId": "evt_100",
            "action": "membership.went_valid",
            "accountId": "acc",
            "externalMembershipId": "mem_1",
            "externalProductId": "prod_starter",
            "periodStart": start,
            "periodEnd": start + Duration::days(30),
        });

        let (status, body) = app
            .send("POST", "/lifecycle/events", Some(went_valid.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "activated");
        assert_eq!(body["eventId"], "evt_100");
        assert_eq!(body["decision"], "new_period");

        app.send("POST", "/accounts/acc/features/draft_reply/commit", None)
            .await;

        // duplicate delivery
        let (_, body) = app.send("POST", "/lifecycle/events", Some(went_valid)).await;
        assert_eq!(body["decision"], "same_period");
        let (_, usage) = app
            .send("GET", "/accounts/acc/features/draft_reply/usage", None)
            .await;
        assert_eq!(usage["usage"], 1);

        let (status, body) = app
            .send(
                "POST",
                "/lifecycle/events",
                Some(json!({
                    "action": "membership.cancelled",
                    "accountId": "acc",
                    "externalMembershipId": "mem_1",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "cancelled");
        assert!(!body["eventId"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmapped_product_is_a_bad_request() {
        let app = test_app().await;
        let start = Utc::now().trunc_subsecs(0);
        let (status, body) = app
            .send(
                "POST",
                "/lifecycle/events",
                Some(json!({
                    "action": "activated",
                    "accountId": "acc",
                    "externalProductId": "prod_unknown",
                    "periodStart": start,
                    "periodEnd": start + Duration::days(30),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_plan");
    }

    #[tokio::test]
    async fn sweep_accepts_an_explicit_clock() {
        let app = test_app().await;
        let start = Utc::now().trunc_subsecs(0) - Duration::days(1);
        app.send(
            "POST",
            "/accounts/acc/subscription/activate",
            Some(json!({
                "planType": "pro",
                "periodStart": start,
                "periodEnd": start + Duration::days(30),
            })),
        )
        .await;

        let (status, body) = app.send("POST", "/lifecycle/sweep", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["expired"], 0);

        let later = start + Duration::days(31);
        let (_, body) = app
            .send("POST", "/lifecycle/sweep", Some(json!({ "now": later })))
            .await;
        assert_eq!(body["expired"], 1);

        let (_, summary) = app.send("GET", "/accounts/acc/subscription", None).await;
        assert_eq!(summary["hasActiveSubscription"], false);
    }
}
