use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::ocpp::RpcServer;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    clients: usize,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    rpc_server: ComponentHealth,
}

/// Health status of a component
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            error: Some(error),
        }
    }
}

fn check_rpc_server(server: &RpcServer) -> ComponentHealth {
    if server.is_closing() {
        ComponentHealth::unhealthy("shutting down".to_string())
    } else {
        ComponentHealth::healthy()
    }
}

/// GET /api/v1/health
pub async fn health_check(State(server): State<RpcServer>) -> impl IntoResponse {
    let rpc_server = check_rpc_server(&server);
    let healthy = rpc_server.status == "healthy";

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        clients: server.client_count(),
        checks: HealthChecks { rpc_server },
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    tracing::debug!(healthy, clients = response.clients, "health check completed");

    (status_code, Json(response))
}

/// GET /api/v1/health/live
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}
