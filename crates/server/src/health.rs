use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use mentionbot_core::{ApplicationError, DataStore};
use serde::Serialize;
use tracing::{error, info, warn};

pub const REVISION_ENV: &str = "K_REVISION";

#[derive(Clone)]
pub struct HealthState {
    store: Arc<dyn DataStore>,
    revision: Arc<str>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub revision: String,
    pub service: HealthCheck,
    pub store: HealthCheck,
    pub checked_at: String,
}

pub fn revision_from_env() -> String {
    std::env::var(REVISION_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

pub fn router(store: Arc<dyn DataStore>, revision_label: impl Into<Arc<str>>) -> Router {
    Router::new()
        .route("/", get(revision))
        .route("/health", get(health))
        .with_state(HealthState { store, revision: revision_label.into() })
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    store: Arc<dyn DataStore>,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "http endpoint started"
    );

    let app = router(store, revision_from_env());
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "http endpoint terminated unexpectedly"
            );
        }
    });

    Ok(())
}

async fn revision(State(state): State<HealthState>) -> String {
    format!("Revision: {}", state.revision)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let store = store_check(state.store.as_ref()).await;
    let ready = store.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        revision: state.revision.to_string(),
        service: HealthCheck { status: "ready", detail: "mentionbot runtime initialized".to_owned() },
        store,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn store_check(store: &dyn DataStore) -> HealthCheck {
    match store.ping().await {
        Ok(()) => HealthCheck { status: "ready", detail: "store query succeeded".to_owned() },
        Err(message) => {
            let interface = ApplicationError::Persistence(message).into_interface("health");
            warn!(
                event_name = "system.health.store_unavailable",
                correlation_id = interface.correlation_id(),
                error = %interface,
                "store health check failed"
            );
            HealthCheck { status: "degraded", detail: interface.user_message().to_owned() }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use mentionbot_core::{DataStore, QueryOutcome};
    use mentionbot_db::{LocalStore, StoreFacade};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::health::router;

    struct BrokenStore;

    #[async_trait]
    impl DataStore for BrokenStore {
        async fn query(&self, _sql: &str, _params: &[Value]) -> QueryOutcome {
            QueryOutcome::failed("Query failed: unable to open database file")
        }

        async fn schema(&self) -> String {
            "Schema fetch failed: unable to open database file".to_owned()
        }
    }

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn root_reports_the_revision() {
        let (status, body) = get(router(Arc::new(BrokenStore), "rev-42"), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).expect("utf8"), "Revision: rev-42");
    }

    #[tokio::test]
    async fn health_is_ready_when_the_store_answers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StoreFacade::new(
            LocalStore::new(dir.path().join("app.db"), 5_000),
            None,
            std::time::Duration::from_secs(3600),
        );

        let (status, body) = get(router(Arc::new(store), "unknown"), "/health").await;
        let payload: Value = serde_json::from_slice(&body).expect("json");

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["status"], "ready");
        assert_eq!(payload["store"]["status"], "ready");
        assert_eq!(payload["revision"], "unknown");
    }

    #[tokio::test]
    async fn health_is_unavailable_when_the_store_fails() {
        let (status, body) = get(router(Arc::new(BrokenStore), "unknown"), "/health").await;
        let payload: Value = serde_json::from_slice(&body).expect("json");

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload["status"], "degraded");
        assert_eq!(payload["store"]["status"], "degraded");
        assert_eq!(
            payload["store"]["detail"],
            "The service is temporarily unavailable. Please retry shortly."
        );
        assert_eq!(payload["service"]["status"], "ready");
    }
}
