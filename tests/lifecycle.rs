//! Server-initiated calls, connection close and server shutdown.

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use ocpp_rpc_server::ocpp::messages::{ResetStatus, ResetType};
use ocpp_rpc_server::ocpp::{CallOptions, ConnectionState, ErrorCode, OcppError, RpcServer};
use ocpp_rpc_server::station;

#[tokio::test]
async fn server_call_resolves_with_station_result() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let client = server.client("CP001").expect("session registered");
    let pending = tokio::spawn(async move { client.call("Reset", json!({"type": "Soft"})).await });

    let request = recv(&mut ws).await;
    assert_eq!(request[0], 2);
    assert_eq!(request[2], "Reset");
    assert_eq!(request[3], json!({"type": "Soft"}));
    send(&mut ws, json!([3, request[1], {"status": "Accepted"}])).await;

    let result = pending.await.unwrap().expect("call succeeds");
    assert_eq!(result, json!({"status": "Accepted"}));
    server.close().await;
}

#[tokio::test]
async fn typed_reset_round_trips_through_station() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let client = server.client("CP001").expect("session registered");
    let pending = tokio::spawn(async move { station::reset(&client, ResetType::Hard).await });

    let request = recv(&mut ws).await;
    assert_eq!(request[2], "Reset");
    assert_eq!(request[3], json!({"type": "Hard"}));
    send(&mut ws, json!([3, request[1], {"status": "Rejected"}])).await;

    let status = pending.await.unwrap().expect("reset answered");
    assert_eq!(status, ResetStatus::Rejected);
    server.close().await;
}

#[tokio::test]
async fn server_call_surfaces_station_error() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let client = server.client("CP001").unwrap();
    let pending = tokio::spawn(async move { client.call("Reset", json!({"type": "Hard"})).await });

    let request = recv(&mut ws).await;
    send(&mut ws, json!([4, request[1], "NotSupported", "no hard resets", {}])).await;

    match pending.await.unwrap() {
        Err(OcppError::Remote(err)) => {
            assert_eq!(err.code, ErrorCode::NotSupported);
            assert_eq!(err.description, "no hard resets");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
    server.close().await;
}

#[tokio::test]
async fn invalid_station_result_is_a_local_validation_error() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let client = server.client("CP001").unwrap();
    let pending = tokio::spawn(async move { client.call("Reset", json!({"type": "Soft"})).await });

    let request = recv(&mut ws).await;
    send(&mut ws, json!([3, request[1], {"status": "Maybe"}])).await;

    assert!(matches!(pending.await.unwrap(), Err(OcppError::Validation(_))));
    server.close().await;
}

#[tokio::test]
async fn timed_out_call_ignores_late_response() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let client = server.client("CP001").unwrap();
    let caller = client.clone();
    let started = tokio::time::Instant::now();
    let pending = tokio::spawn(async move {
        caller
            .call_with(
                "Reset",
                json!({"type": "Soft"}),
                CallOptions::timeout(Duration::from_millis(200)),
            )
            .await
    });

    let request = recv(&mut ws).await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, OcppError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.pending_calls(), 0);

    send(&mut ws, json!([3, request[1], {"status": "Accepted"}])).await;
    let reply = call(&mut ws, json!([2, "hb", "Heartbeat", {}])).await;
    // No handler is registered, but the connection is still serving calls.
    assert_eq!(reply[1], "hb");
    assert!(client.is_open());
    server.close().await;
}

#[tokio::test]
async fn disconnect_fails_pending_calls() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let client = server.client("CP001").unwrap();
    let caller = client.clone();
    let pending = tokio::spawn(async move { caller.call("Reset", json!({"type": "Soft"})).await });
    let _request = recv(&mut ws).await;

    drop(ws);
    assert!(matches!(pending.await.unwrap(), Err(OcppError::ConnectionClosed)));
    let (identity, _) = disconnected(&mut events).await;
    assert_eq!(identity, "CP001");
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(server.client("CP001").is_none());
    server.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let client = server.client("CP001").unwrap();
    assert!(client.close(1000, "maintenance"));
    assert!(!client.close(1000, "maintenance"));
    assert_eq!(recv_close(&mut ws).await, Some(1000));

    let (_, code) = disconnected(&mut events).await;
    assert_eq!(code, 1000);
    let info = client.closed().await;
    assert_eq!(info.reason, "maintenance");
    assert!(!client.close(1000, "again"));
    assert_eq!(server.client_count(), 0);
    server.close().await;
}

#[tokio::test]
async fn station_initiated_close_is_recorded() {
    let server = RpcServer::default();
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    let mut ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    ws.close(None).await.unwrap();
    let (identity, code) = disconnected(&mut events).await;
    assert_eq!(identity, "CP001");
    assert_eq!(code, 1005);
    server.close().await;
}

#[tokio::test]
async fn server_close_disconnects_everyone_and_refuses_new_stations() {
    let (server, addr) = station_server().await;
    let mut events = server.subscribe();
    let mut first = connect(addr, "CP001").await;
    let mut second = connect(addr, "CP002").await;
    connected(&mut events).await;
    connected(&mut events).await;

    let closing = server.clone();
    let shutdown = tokio::spawn(async move { closing.close().await });

    assert_eq!(recv_close(&mut first).await, Some(1001));
    assert_eq!(recv_close(&mut second).await, Some(1001));
    shutdown.await.unwrap();

    assert!(server.is_closing());
    assert_eq!(server.client_count(), 0);
    assert!(try_connect(addr, "/ocpp/CP003", &["ocpp1.6"], None).await.is_err());
    // A second close returns immediately.
    server.close().await;
}

#[tokio::test]
async fn keepalive_closes_silent_connections() {
    use ocpp_rpc_server::ocpp::RpcServerOptions;

    let server = RpcServer::new(RpcServerOptions {
        ping_interval: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let mut events = server.subscribe();
    let addr = listen(&server).await;
    // Never polled, so pings go unanswered.
    let _ws = connect(addr, "CP001").await;
    connected(&mut events).await;

    let (_, code) = disconnected(&mut events).await;
    assert_eq!(code, 1001);
    server.close().await;
}
