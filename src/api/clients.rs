use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::ApiError;
use crate::auth::SessionData;
use crate::ocpp::{ConnectionState, RpcClient, RpcServer};

/// One connected station as reported by the monitoring API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: Uuid,
    pub identity: String,
    pub protocol: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub pending_calls: usize,
    pub session: SessionData,
}

impl From<&RpcClient> for ClientSummary {
    fn from(client: &RpcClient) -> Self {
        Self {
            id: client.id(),
            identity: client.identity().to_string(),
            protocol: client.protocol().to_string(),
            state: client.state(),
            remote_addr: client.remote_addr().map(|a| a.to_string()),
            connected_at: client.connected_at(),
            pending_calls: client.pending_calls(),
            session: client.session().clone(),
        }
    }
}

/// GET /api/v1/clients
pub async fn list_clients(State(server): State<RpcServer>) -> Json<Vec<ClientSummary>> {
    let mut clients: Vec<ClientSummary> = server.clients().iter().map(ClientSummary::from).collect();
    clients.sort_by(|a, b| a.identity.cmp(&b.identity));
    Json(clients)
}

/// GET /api/v1/clients/:identity
pub async fn get_client(
    State(server): State<RpcServer>,
    Path(identity): Path<String>,
) -> Result<Json<ClientSummary>, ApiError> {
    server
        .client(&identity)
        .map(|client| Json(ClientSummary::from(&client)))
        .ok_or_else(|| ApiError::NotFound(format!("no connected station {identity}")))
}
