use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::Client;

// Keep an idle pooled connection warm. Jitter spreads pings across the pool;
// errors are ignored because the next tick tries again.
pub fn spawn_keepalive(client: Arc<Client>, min_secs: u64, max_secs: u64) {
    let max_secs = max_secs.max(min_secs + 1);
    tokio::spawn(async move {
        loop {
            let jitter = {
                let mut rng = rand::rng();
                rand::Rng::random_range(&mut rng, min_secs..=max_secs)
            };
            tokio::time::sleep(Duration::from_secs(jitter)).await;
            if client.is_closed() {
                tracing::warn!("postgres client closed, stopping keepalive");
                break;
            }
            let _ = tokio::time::timeout(Duration::from_secs(5), client.execute("SELECT 1", &[]))
                .await;
        }
    });
}
