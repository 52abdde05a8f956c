pub mod clients;
pub mod error;
pub mod health;

pub use error::ApiError;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::Config, ocpp::RpcServer};

/// The full HTTP surface: monitoring endpoints under `/api/v1`, station
/// WebSocket connections on every other path, JSON 404 for the rest.
pub fn router(server: RpcServer, cfg: &Config) -> Router {
    let v1 = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .route("/clients", get(clients::list_clients))
        .route("/clients/:identity", get(clients::get_client))
        .with_state(server.clone());

    let mut router = Router::new()
        .nest("/api/v1", v1)
        .merge(server.router())
        .fallback(not_found);

    if cfg.server.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.layer(TraceLayer::new_for_http())
}

async fn not_found() -> ApiError {
    ApiError::NotFound("not found".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_plain_http_requests_get_json_404() {
        let app = router(RpcServer::default(), &Config::default());
        for uri in ["/", "/ocpp/CP001", "/api/v1/nope"] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body, json!({"error": "NotFound", "message": "not found"}), "{uri}");
        }
    }

    #[tokio::test]
    async fn test_health_and_clients() {
        let app = router(RpcServer::default(), &Config::default());

        let (status, body) = get_json(app.clone(), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"], 0);

        let (status, body) = get_json(app.clone(), "/api/v1/clients").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) = get_json(app, "/api/v1/clients/CP001").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }
}
