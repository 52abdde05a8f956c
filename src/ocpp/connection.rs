//! Connection management
//!
//! Turns WebSocket upgrade requests into sessions: subprotocol negotiation,
//! authentication, the per-connection read/write loops, keepalive and
//! teardown. The set of live sessions is the only server-wide mutable state.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{CloseInfo, RpcClient};
use super::codec::{self, Envelope};
use super::server::{RpcServer, ServerEvent};
use crate::api::ApiError;
use crate::auth::{basic_credentials, AuthDecision, HandshakeInfo, SessionData};

/// How long teardown waits for the peer to finish the close handshake.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of one connection.
///
/// `Connecting` and `Authenticating` cover the HTTP upgrade, before any
/// [`RpcClient`] exists, so [`RpcClient::state`] only ever reports `Open`,
/// `Closing` or `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Live sessions keyed by connection id.
#[derive(Default)]
pub(crate) struct ConnectionManager {
    clients: RwLock<HashMap<Uuid, RpcClient>>,
}

impl ConnectionManager {
    pub(crate) fn insert(&self, client: RpcClient) {
        self.clients.write().insert(client.id(), client);
    }

    pub(crate) fn remove(&self, id: Uuid) -> Option<RpcClient> {
        self.clients.write().remove(&id)
    }

    pub(crate) fn snapshot(&self) -> Vec<RpcClient> {
        self.clients.read().values().cloned().collect()
    }

    /// Most recently connected session with this identity.
    pub(crate) fn find(&self, identity: &str) -> Option<RpcClient> {
        self.clients
            .read()
            .values()
            .filter(|c| c.identity() == identity)
            .max_by_key(|c| c.connected_at())
            .cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.read().len()
    }
}

/// Split a request path into `(identity, endpoint)`; the identity is the last
/// segment, percent-decoded.
pub fn split_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let (endpoint, raw) = trimmed.rsplit_once('/')?;
    if raw.is_empty() {
        return None;
    }
    let identity = percent_decode_str(raw).decode_utf8().ok()?.into_owned();
    let endpoint = if endpoint.is_empty() { "/" } else { endpoint };
    Some((identity, endpoint.to_string()))
}

/// Subprotocols listed in `Sec-WebSocket-Protocol`, in offer order.
pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// First protocol of ours, in our preference order, that the station offered.
pub fn negotiate(accepted: &[String], offered: &[String]) -> Option<String> {
    accepted.iter().find(|p| offered.contains(p)).cloned()
}

/// Upgrade handler mounted by [`RpcServer::router`].
pub(crate) async fn upgrade(
    State(server): State<RpcServer>,
    ws: Option<WebSocketUpgrade>,
    uri: Uri,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let Some(ws) = ws else {
        return ApiError::NotFound("not found".into()).into_response();
    };
    if server.is_closing() {
        return ApiError::ServiceUnavailable("server is shutting down".into()).into_response();
    }
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    let Some((identity, endpoint)) = split_path(uri.path()) else {
        return ApiError::BadRequest("missing station identity".into()).into_response();
    };
    debug!(%identity, ?remote_addr, state = %ConnectionState::Connecting, "upgrade requested");

    let offered = offered_protocols(&headers);
    let Some(protocol) = negotiate(&server.options().protocols, &offered) else {
        info!(%identity, ?offered, "no acceptable subprotocol");
        return ApiError::BadRequest("no supported subprotocol offered".into()).into_response();
    };

    let password = basic_credentials(&headers)
        .filter(|(user, _)| *user == identity)
        .map(|(_, password)| password);

    let handshake = HandshakeInfo {
        identity,
        endpoint,
        protocols: offered,
        protocol: protocol.clone(),
        headers,
        remote_addr,
        query: uri.query().map(str::to_string),
        password,
    };

    debug!(identity = %handshake.identity, state = %ConnectionState::Authenticating, "authenticating");
    let authenticator = server.authenticator();
    let decision = tokio::time::timeout(
        server.options().handshake_timeout,
        authenticator.authenticate(handshake.clone()),
    )
    .await;

    let session = match decision {
        Ok(AuthDecision::Accept(session)) => session,
        Ok(AuthDecision::Reject { status, reason }) => {
            info!(identity = %handshake.identity, %status, %reason, "connection rejected");
            return ApiError::HandshakeRejected(status, reason).into_response();
        }
        Err(_) => {
            warn!(identity = %handshake.identity, "authentication timed out");
            return ApiError::HandshakeRejected(
                StatusCode::REQUEST_TIMEOUT,
                "authentication timed out".into(),
            )
            .into_response();
        }
    };

    let tracker = server.shared().tracker.clone();
    ws.protocols([protocol])
        .on_upgrade(move |socket| tracker.track_future(run_connection(server, socket, handshake, session)))
}

async fn run_connection(
    server: RpcServer,
    socket: WebSocket,
    handshake: HandshakeInfo,
    session: SessionData,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let last = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || last {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let client = RpcClient::new(handshake, session, tx.clone(), server.shared().clone());
    server.manager().insert(client.clone());
    info!(
        identity = %client.identity(),
        protocol = %client.protocol(),
        remote_addr = ?client.remote_addr(),
        "client connected"
    );
    server.notify_client(&client).await;
    server.emit(ServerEvent::ClientConnected {
        id: client.id(),
        identity: client.identity().to_string(),
        protocol: client.protocol().to_string(),
    });

    read_loop(&server, &client, &mut stream, &tx).await;

    client.finish();
    server.manager().remove(client.id());
    let close = client.close_info().unwrap_or_else(CloseInfo::abnormal);
    info!(identity = %client.identity(), code = close.code, reason = %close.reason, "client disconnected");
    server.emit(ServerEvent::ClientDisconnected {
        id: client.id(),
        identity: client.identity().to_string(),
        close,
    });

    // The writer stops after a close frame; a no-op if one was already sent.
    let _ = tx.send(Message::Close(None));
    if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

async fn read_loop(
    server: &RpcServer,
    client: &RpcClient,
    stream: &mut SplitStream<WebSocket>,
    outbound: &mpsc::UnboundedSender<Message>,
) {
    let mut keepalive = server.options().ping_interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut heard_from_peer = true;

    loop {
        tokio::select! {
            biased;

            _ = client.closing_token().cancelled() => break,

            _ = tick(&mut keepalive) => {
                if !heard_from_peer {
                    warn!(identity = %client.identity(), "keepalive timeout");
                    client.close(1001, "keepalive timeout");
                    break;
                }
                heard_from_peer = false;
                let _ = outbound.send(Message::Ping(Vec::new()));
            }

            frame = stream.next() => {
                heard_from_peer = true;
                match frame {
                    Some(Ok(Message::Text(text))) => on_text(server, client, &text),
                    Some(Ok(Message::Binary(_))) => {
                        warn!(identity = %client.identity(), "binary frames are not supported");
                        client.count_bad_message();
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let info = frame
                            .map(|f| CloseInfo::new(f.code, f.reason.into_owned()))
                            .unwrap_or_else(|| CloseInfo::new(1005, ""));
                        client.begin_close(info);
                        return;
                    }
                    Some(Err(e)) => {
                        debug!(identity = %client.identity(), error = %e, "transport error");
                        client.begin_close(CloseInfo::abnormal());
                        return;
                    }
                    None => {
                        client.begin_close(CloseInfo::abnormal());
                        return;
                    }
                }
            }
        }
    }

    // We initiated the close: give the peer a moment to answer it.
    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    })
    .await;
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn on_text(server: &RpcServer, client: &RpcClient, text: &str) {
    match codec::decode(text) {
        Ok(Envelope::Call(call)) => {
            debug!(identity = %client.identity(), message_id = %call.message_id, method = %call.method, "call received");
            server.shared().tracker.spawn(client.clone().dispatch(call));
        }
        Ok(response) => client.resolve_pending(response),
        Err(err) => client.on_framing_error(err),
    }
}
