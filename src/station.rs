//! Central-system handlers for the charging-station actions this server answers.
//!
//! These acknowledge the station and log what it reported. Anything not
//! listed here is answered with `NotImplemented`.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::config::StationConfig;
use crate::ocpp::messages::{
    BootNotificationRequest, BootNotificationResponse, HeartbeatResponse, RegistrationStatus,
    ResetRequest, ResetResponse, ResetStatus, ResetType, StatusNotificationRequest,
};
use crate::ocpp::{CallContext, RpcClient, RpcError};

/// Attach the station handlers to a freshly accepted connection.
pub fn register(client: &RpcClient, cfg: &StationConfig) {
    let interval = cfg.heartbeat_interval_secs;
    client.handle("BootNotification", move |ctx: CallContext| boot_notification(ctx, interval));
    client.handle("Heartbeat", heartbeat);
    client.handle("StatusNotification", status_notification);
    client.handle_any(unhandled);
}

/// Ask a station to reboot and return its answer.
pub async fn reset(client: &RpcClient, kind: ResetType) -> Result<ResetStatus> {
    let params = serde_json::to_value(ResetRequest { kind })?;
    let result = client.call("Reset", params).await?;
    let response: ResetResponse = serde_json::from_value(result)?;
    info!(identity = %client.identity(), ?kind, status = ?response.status, "reset requested");
    Ok(response.status)
}

async fn boot_notification(ctx: CallContext, interval: u32) -> Result<Value> {
    let request: BootNotificationRequest = ctx.params_as()?;
    info!(
        identity = %ctx.identity(),
        vendor = %request.charge_point_vendor,
        model = ?request.charge_point_model,
        firmware = ?request.firmware_version,
        "boot notification"
    );
    let response = BootNotificationResponse {
        status: RegistrationStatus::Accepted,
        current_time: Utc::now(),
        interval,
    };
    Ok(serde_json::to_value(response)?)
}

async fn heartbeat(ctx: CallContext) -> Result<Value> {
    info!(identity = %ctx.identity(), "heartbeat");
    Ok(serde_json::to_value(HeartbeatResponse {
        current_time: Utc::now(),
    })?)
}

async fn status_notification(ctx: CallContext) -> Result<Value> {
    let request: StatusNotificationRequest = ctx.params_as()?;
    info!(
        identity = %ctx.identity(),
        connector_id = request.connector_id,
        status = ?request.status,
        error_code = ?request.error_code,
        "status notification"
    );
    Ok(Value::Object(Default::default()))
}

async fn unhandled(ctx: CallContext) -> Result<Value> {
    info!(identity = %ctx.identity(), method = %ctx.method, params = %ctx.params, "unhandled call");
    Err(RpcError::not_implemented()
        .with_description(format!("{} is not implemented", ctx.method))
        .into())
}
