//! Shared helpers for the WebSocket end-to-end tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ocpp_rpc_server::config::StationConfig;
use ocpp_rpc_server::ocpp::{RpcServer, RpcServerOptions, ServerEvent};
use ocpp_rpc_server::station;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Server answering the station actions, listening on an ephemeral port.
pub async fn station_server() -> (RpcServer, SocketAddr) {
    let server = RpcServer::new(RpcServerOptions::default());
    server.on_client(|client| async move {
        station::register(&client, &StationConfig::default());
    });
    let addr = listen(&server).await;
    (server, addr)
}

pub async fn listen(server: &RpcServer) -> SocketAddr {
    server
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("server listens")
}

pub async fn try_connect(
    addr: SocketAddr,
    path: &str,
    protocols: &[&str],
    basic: Option<(&str, &str)>,
) -> Result<WsStream, tungstenite::Error> {
    let mut request = format!("ws://{addr}{path}").into_client_request()?;
    if !protocols.is_empty() {
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocols.join(", ").parse().unwrap());
    }
    if let Some((user, password)) = basic {
        let token = STANDARD.encode(format!("{user}:{password}"));
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Basic {token}").parse().unwrap());
    }
    let (ws, _response) = connect_async(request).await?;
    Ok(ws)
}

/// Connect as `identity` offering ocpp1.6.
pub async fn connect(addr: SocketAddr, identity: &str) -> WsStream {
    try_connect(addr, &format!("/ocpp/{identity}"), &["ocpp1.6"], None)
        .await
        .expect("handshake succeeds")
}

/// HTTP status of a refused handshake.
pub fn rejection_status(result: Result<WsStream, tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("expected an HTTP rejection, got {other:?}"),
        Ok(_) => panic!("expected the handshake to be refused"),
    }
}

pub async fn send(ws: &mut WsStream, frame: Value) {
    send_text(ws, &frame.to_string()).await;
}

pub async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.to_string()))
        .await
        .expect("frame sent");
}

/// Next text frame as JSON, skipping control frames.
pub async fn recv(ws: &mut WsStream) -> Value {
    loop {
        let message = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("frame is JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Send a call and wait for the frame answering it.
pub async fn call(ws: &mut WsStream, frame: Value) -> Value {
    send(ws, frame).await;
    recv(ws).await
}

/// Wait for the server's close frame and return its code.
pub async fn recv_close(ws: &mut WsStream) -> Option<u16> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("timed out waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code.into()),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Wait until a station has been registered by the server.
pub async fn connected(events: &mut broadcast::Receiver<ServerEvent>) -> String {
    loop {
        let event = timeout(TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("event stream open");
        if let ServerEvent::ClientConnected { identity, .. } = event {
            return identity;
        }
    }
}

pub async fn disconnected(events: &mut broadcast::Receiver<ServerEvent>) -> (String, u16) {
    loop {
        let event = timeout(TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a disconnect")
            .expect("event stream open");
        if let ServerEvent::ClientDisconnected { identity, close, .. } = event {
            return (identity, close.code);
        }
    }
}
