use std::future::Future;
use std::time::Duration;

use crate::error::QuotaError;

// Bound an engine call by the storage timeout. Expiry means "failed, not applied".
pub async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, QuotaError>>,
) -> Result<T, QuotaError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "engine call timed out");
            Err(QuotaError::Timeout)
        }
    }
}
