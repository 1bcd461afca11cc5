use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::config::Settings;
use crate::server::{AppState, app};
use crate::storage::SqliteStore;

pub struct TestApp {
    _dir: TempDir,
    pub router: Router,
}

pub async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let mut settings = Settings::default();
    settings.storage.database_path = db_path.to_str().unwrap().to_string();
    settings
        .products
        .insert("prod_starter".into(), "starter".into());
    let store = Arc::new(SqliteStore::new(&settings.storage.database_path).await.unwrap());
    let state = Arc::new(AppState::new(settings, store.clone(), store).unwrap());
    TestApp {
        _dir: dir,
        router: app(state),
    }
}

impl TestApp {
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}
