//! REST API endpoints.
//!
//! # Control endpoints
//!
//! - `GET|POST /sensortag/safe` - Allow connecting; fires connect-all once every consumer is ready
//! - `GET /sensortag/isscanning` - `{"scanning": bool}`
//! - `GET|POST /sensortag/restart` - Disconnect every tag and scan afresh
//! - `GET /sensortag/tags` - Tags seen in the current scan session, keyed by id
//!
//! # Status endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/consumers` - Configured consumers and their arbitration status
//!
//! # Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. A stopped
//! coordinator returns HTTP 503, an unknown consumer 404.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use tagmux_core::{ConsumerId, TagId, TagKind};

use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/consumers", get(list_consumers))
        .route("/sensortag/safe", get(set_safe).post(set_safe))
        .route("/sensortag/isscanning", get(is_scanning))
        .route("/sensortag/restart", get(restart).post(restart))
        .route("/sensortag/tags", get(list_tags))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub uptime_seconds: i64,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let now = OffsetDateTime::now_utc();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now,
        uptime_seconds: (now - state.started_at).whole_seconds().max(0),
    })
}

async fn set_safe(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    info!("Connecting marked safe");
    state.coordinator.set_safe_to_connect().await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
pub struct ScanningResponse {
    pub scanning: bool,
}

async fn is_scanning(State(state): State<Arc<AppState>>) -> Result<Json<ScanningResponse>, AppError> {
    let scanning = state.coordinator.is_scanning().await?;
    Ok(Json(ScanningResponse { scanning }))
}

async fn restart(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    info!("Scan restart requested");
    state.coordinator.restart_scan().await?;
    Ok(StatusCode::OK)
}

/// One entry of `/sensortag/tags`.
#[derive(Debug, Serialize)]
pub struct TagResponse {
    pub rssi: i16,
    pub kind: TagKind,
    pub claimed: bool,
}

async fn list_tags(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<TagId, TagResponse>>, AppError> {
    let tags = state
        .coordinator
        .list_current_tags()
        .await?
        .into_iter()
        .map(|(id, tag)| {
            (
                id,
                TagResponse {
                    rssi: tag.rssi,
                    kind: tag.kind,
                    claimed: tag.claimed,
                },
            )
        })
        .collect();
    Ok(Json(tags))
}

/// One entry of `/api/consumers`.
#[derive(Debug, Serialize)]
pub struct ConsumerResponse {
    pub name: String,
    pub id: ConsumerId,
    pub tags: Vec<TagId>,
    pub claimed: usize,
    pub ready: bool,
    /// Operator-facing status text, e.g. `Connected: 1/2`.
    pub status: String,
}

async fn list_consumers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConsumerResponse>>, AppError> {
    let summaries = state.coordinator.consumers().await?;
    let named = state.consumers.read().await;

    let consumers = summaries
        .into_iter()
        .map(|summary| ConsumerResponse {
            name: named
                .iter()
                .find(|c| c.id == summary.id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| summary.id.to_string()),
            id: summary.id,
            tags: summary.filter,
            claimed: summary.claimed,
            ready: summary.ready,
            status: summary.status.to_string(),
        })
        .collect();
    Ok(Json(consumers))
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    Coordinator(tagmux_core::Error),
}

impl From<tagmux_core::Error> for AppError {
    fn from(e: tagmux_core::Error) -> Self {
        AppError::Coordinator(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::Coordinator(e @ tagmux_core::Error::CoordinatorClosed) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            AppError::Coordinator(e @ tagmux_core::Error::UnknownConsumer(_)) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            AppError::Coordinator(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use tagmux_core::{Coordinator, CoordinatorConfig, MockCall, MockTransport};

    use super::*;
    use crate::config::{Config, ConsumerConfig};
    use crate::state::NamedConsumer;

    async fn create_test_state(config: CoordinatorConfig) -> (Arc<AppState>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let coordinator = Coordinator::spawn(transport.clone(), config).await.unwrap();
        (AppState::new(coordinator, Config::default()), transport)
    }

    async fn call(state: &Arc<AppState>, method: Method, uri: &str) -> axum::response::Response {
        router()
            .with_state(Arc::clone(state))
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _) = create_test_state(CoordinatorConfig::default()).await;
        let response = call(&state, Method::GET, "/api/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_is_scanning() {
        let (state, _) = create_test_state(CoordinatorConfig::default()).await;
        let response = call(&state, Method::GET, "/sensortag/isscanning").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({ "scanning": true }));

        let (state, _) =
            create_test_state(CoordinatorConfig::default().scan_on_start(false)).await;
        let response = call(&state, Method::GET, "/sensortag/isscanning").await;
        assert_eq!(response_json(response).await, serde_json::json!({ "scanning": false }));
    }

    #[tokio::test]
    async fn test_list_tags() {
        let (state, transport) = create_test_state(CoordinatorConfig::default()).await;
        let tag = TagId::new("B0:B4:48:C9:8A:83");
        transport.advertise(&tag, TagKind::Cc2650, -61);

        let mut json = serde_json::Value::Null;
        for _ in 0..200 {
            json = response_json(call(&state, Method::GET, "/sensortag/tags").await).await;
            if json.get("b0b448c98a83").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(json["b0b448c98a83"]["rssi"], -61);
        assert_eq!(json["b0b448c98a83"]["claimed"], false);
    }

    #[tokio::test]
    async fn test_restart_without_tags_starts_scanning() {
        let (state, transport) =
            create_test_state(CoordinatorConfig::default().scan_on_start(false)).await;

        let response = call(&state, Method::POST, "/sensortag/restart").await;
        assert_eq!(response.status(), StatusCode::OK);

        let probe = Arc::clone(&transport);
        wait_until(move || probe.calls().contains(&MockCall::StartDiscovery)).await;
        assert!(state.coordinator.is_scanning().await.unwrap());
    }

    #[tokio::test]
    async fn test_safe_accepts_get_and_post() {
        let (state, _) =
            create_test_state(CoordinatorConfig::default().initially_safe(false)).await;
        assert_eq!(call(&state, Method::GET, "/sensortag/safe").await.status(), StatusCode::OK);
        assert_eq!(call(&state, Method::POST, "/sensortag/safe").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_consumers_uses_configured_names() {
        let (state, _) = create_test_state(CoordinatorConfig::default()).await;
        let consumer = ConsumerConfig {
            name: "kitchen".to_string(),
            tags: vec!["b0b448c98a83".to_string()],
            temperature: true,
            ..Default::default()
        };
        let handle = state
            .coordinator
            .register_consumer(consumer.to_options())
            .await
            .unwrap();
        state.consumers.write().await.push(NamedConsumer {
            name: consumer.name.clone(),
            id: handle.id(),
        });

        let response = call(&state, Method::GET, "/api/consumers").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json[0]["name"], "kitchen");
        assert_eq!(json[0]["tags"][0], "b0b448c98a83");
        assert_eq!(json[0]["claimed"], 0);
        assert_eq!(json[0]["ready"], false);
        assert_eq!(json[0]["status"], "Waiting for tags...");
    }

    #[tokio::test]
    async fn test_closed_coordinator_returns_unavailable() {
        let (state, _) = create_test_state(CoordinatorConfig::default()).await;
        state.coordinator.shutdown().await;

        let response = call(&state, Method::GET, "/sensortag/isscanning").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = response_json(response).await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (state, _) = create_test_state(CoordinatorConfig::default()).await;
        let response = call(&state, Method::GET, "/sensortag/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_app_error_status_codes() {
        let cases = [
            (
                AppError::Coordinator(tagmux_core::Error::CoordinatorClosed),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::Coordinator(tagmux_core::Error::UnknownConsumer("consumer-9".to_string())),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
