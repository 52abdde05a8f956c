//! Per-connection session
//!
//! An [`RpcClient`] is the server's handle on one accepted charging station.
//! It owns the station's handlers, correlates server-initiated calls with
//! their responses, and answers every inbound call exactly once.

use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec::{self, Call, CallError, CallResult, Envelope, FramingError};
use super::connection::ConnectionState;
use super::error::{ErrorCode, OcppError, RpcError};
use super::handler::{resolve, CallContext, Handler, HandlerRegistry};
use super::schema::Direction;
use super::server::{ServerShared, UnknownMethodPolicy};
use crate::auth::{HandshakeInfo, SessionData};

/// Close frame reasons are limited to 123 bytes by RFC 6455.
const MAX_CLOSE_REASON: usize = 123;

/// Per-call overrides for server-initiated calls.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the server-wide call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Transport dropped without a close handshake.
    pub fn abnormal() -> Self {
        Self::new(1006, "connection lost")
    }
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value, OcppError>>,
}

struct Inner {
    id: Uuid,
    handshake: HandshakeInfo,
    session: SessionData,
    connected_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    handlers: RwLock<HandlerRegistry>,
    pending: Mutex<HashMap<String, PendingCall>>,
    outbound: mpsc::UnboundedSender<Message>,
    call_slots: Semaphore,
    closing: CancellationToken,
    done: CancellationToken,
    close_info: Mutex<Option<CloseInfo>>,
    bad_messages: AtomicU32,
    shared: Arc<ServerShared>,
}

/// Handle on one connected charging station. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("id", &self.inner.id)
            .field("identity", &self.identity())
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .finish()
    }
}

impl RpcClient {
    pub(crate) fn new(
        handshake: HandshakeInfo,
        session: SessionData,
        outbound: mpsc::UnboundedSender<Message>,
        shared: Arc<ServerShared>,
    ) -> Self {
        let slots = shared.options.call_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                handshake,
                session,
                connected_at: Utc::now(),
                state: Mutex::new(ConnectionState::Open),
                handlers: RwLock::new(HandlerRegistry::new()),
                pending: Mutex::new(HashMap::new()),
                outbound,
                call_slots: Semaphore::new(slots),
                closing: CancellationToken::new(),
                done: CancellationToken::new(),
                close_info: Mutex::new(None),
                bad_messages: AtomicU32::new(0),
                shared,
            }),
        }
    }

    /// Connection id, unique for the lifetime of the server.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Station identity taken from the connection URL.
    pub fn identity(&self) -> &str {
        &self.inner.handshake.identity
    }

    /// Negotiated subprotocol.
    pub fn protocol(&self) -> &str {
        &self.inner.handshake.protocol
    }

    pub fn handshake(&self) -> &HandshakeInfo {
        &self.inner.handshake
    }

    /// Data attached by the authenticator when the connection was accepted.
    pub fn session(&self) -> &SessionData {
        &self.inner.session
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.handshake.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Number of server-initiated calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Register a handler for `method` on this connection only.
    pub fn handle<H: Handler>(&self, method: impl Into<String>, handler: H) {
        self.inner.handlers.write().insert(method, Arc::new(handler));
    }

    /// Register this connection's catch-all handler.
    pub fn handle_any<H: Handler>(&self, handler: H) {
        self.inner.handlers.write().set_wildcard(Arc::new(handler));
    }

    pub fn remove_handler(&self, method: &str) -> bool {
        self.inner.handlers.write().remove(method)
    }

    /// Send a call to the station and wait for its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, OcppError> {
        self.call_with(method, params, CallOptions::default()).await
    }

    pub async fn call_with(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, OcppError> {
        if !self.is_open() {
            return Err(OcppError::ConnectionClosed);
        }
        let shared = &self.inner.shared;
        let strict = shared.options.strict_mode;
        if strict {
            shared
                .schemas
                .validate(self.protocol(), method, Direction::Request, &params)?;
        }

        let _permit = self
            .inner
            .call_slots
            .acquire()
            .await
            .map_err(|_| OcppError::ConnectionClosed)?;

        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            // close() drains this map after leaving Open; checking under the
            // lock guarantees the entry is either drained or never inserted.
            if !self.is_open() {
                return Err(OcppError::ConnectionClosed);
            }
            pending.insert(
                message_id.clone(),
                PendingCall {
                    method: method.to_string(),
                    reply: tx,
                },
            );
        }

        let frame = codec::encode(&Envelope::Call(Call {
            message_id: message_id.clone(),
            method: method.to_string(),
            params,
        }));
        debug!(identity = %self.identity(), %message_id, method, "sending call");
        if self.inner.outbound.send(Message::Text(frame)).is_err() {
            self.inner.pending.lock().remove(&message_id);
            return Err(OcppError::ConnectionClosed);
        }

        let after = options.timeout.unwrap_or(shared.options.call_timeout);
        let payload = match tokio::time::timeout(after, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(OcppError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&message_id);
                warn!(identity = %self.identity(), %message_id, method, ?after, "call timed out");
                return Err(OcppError::Timeout {
                    method: method.to_string(),
                    after,
                });
            }
        };

        if strict {
            shared
                .schemas
                .validate(self.protocol(), method, Direction::Response, &payload)?;
        }
        Ok(payload)
    }

    /// Close the connection. Returns `false` when it was already closing or
    /// closed, in which case nothing happens.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if !self.begin_close(CloseInfo::new(code, reason)) {
            return false;
        }
        info!(identity = %self.identity(), code, reason, "closing connection");
        let frame = CloseFrame {
            code,
            reason: truncate_reason(reason).to_string().into(),
        };
        let _ = self.inner.outbound.send(Message::Close(Some(frame)));
        true
    }

    /// Wait until the connection is fully closed.
    pub async fn closed(&self) -> CloseInfo {
        self.inner.done.cancelled().await;
        self.close_info().unwrap_or_else(CloseInfo::abnormal)
    }

    pub fn close_info(&self) -> Option<CloseInfo> {
        self.inner.close_info.lock().clone()
    }

    /// Leave Open: fail outstanding calls and stop the read loop. The first
    /// caller wins and records why the connection ended.
    pub(crate) fn begin_close(&self, info: CloseInfo) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.is_open() {
                return false;
            }
            *state = ConnectionState::Closing;
        }
        self.inner.close_info.lock().get_or_insert(info);
        self.fail_pending();
        self.inner.call_slots.close();
        self.inner.closing.cancel();
        true
    }

    /// Mark the connection as gone once its transport has shut down.
    pub(crate) fn finish(&self) {
        *self.inner.state.lock() = ConnectionState::Closed;
        self.inner.close_info.lock().get_or_insert_with(CloseInfo::abnormal);
        self.fail_pending();
        self.inner.call_slots.close();
        self.inner.closing.cancel();
        self.inner.done.cancel();
    }

    pub(crate) fn closing_token(&self) -> &CancellationToken {
        &self.inner.closing
    }

    fn fail_pending(&self) {
        let drained: Vec<(String, PendingCall)> = self.inner.pending.lock().drain().collect();
        for (message_id, call) in drained {
            debug!(identity = %self.identity(), %message_id, method = %call.method, "failing pending call");
            let _ = call.reply.send(Err(OcppError::ConnectionClosed));
        }
    }

    /// Hand a CALLRESULT or CALLERROR to the caller waiting on it.
    pub(crate) fn resolve_pending(&self, envelope: Envelope) {
        let (message_id, outcome) = match envelope {
            Envelope::CallResult(CallResult {
                message_id,
                payload,
            }) => (message_id, Ok(payload)),
            Envelope::CallError(error) => (
                error.message_id.clone(),
                Err(OcppError::Remote(error.into_rpc())),
            ),
            Envelope::Call(_) => return,
        };

        let entry = self.inner.pending.lock().remove(&message_id);
        match entry {
            Some(call) => {
                debug!(identity = %self.identity(), %message_id, method = %call.method, "response received");
                let _ = call.reply.send(outcome);
            }
            None => {
                debug!(identity = %self.identity(), %message_id, "discarding unmatched response");
            }
        }
    }

    /// Answer an inbound call. Always produces exactly one response.
    pub(crate) async fn dispatch(self, call: Call) {
        let response = self.answer(call).await;
        self.send_response(response);
    }

    async fn answer(&self, call: Call) -> Envelope {
        let Call {
            message_id,
            method,
            params,
        } = call;
        let protocol = self.protocol();
        let shared = &self.inner.shared;
        let reject = |error: RpcError| Envelope::CallError(CallError::from_rpc(message_id.clone(), error));

        let handler = {
            let session = self.inner.handlers.read();
            let server = shared.defaults.read();
            resolve(&session, &server, &method)
        };
        let Some(handler) = handler else {
            debug!(identity = %self.identity(), %message_id, %method, "no handler registered");
            return reject(
                RpcError::not_implemented().with_description(format!("{method} is not implemented")),
            );
        };

        if shared.options.strict_mode {
            let known = shared
                .schemas
                .get(protocol, &method, Direction::Request)
                .is_some();
            if !known && shared.options.unknown_methods == UnknownMethodPolicy::Reject {
                return reject(
                    RpcError::new(ErrorCode::NotSupported)
                        .with_description(format!("no schema for {method} on {protocol}")),
                );
            }
            if let Err(e) = shared
                .schemas
                .validate(protocol, &method, Direction::Request, &params)
            {
                warn!(identity = %self.identity(), %message_id, %method, error = %e, "rejecting invalid params");
                return reject(e.to_rpc_error(protocol));
            }
        }

        let ctx = CallContext {
            message_id: message_id.clone(),
            method: method.clone(),
            params,
            client: self.clone(),
        };
        let payload = match AssertUnwindSafe(handler.call(ctx)).catch_unwind().await {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                if let Some(rpc) = err.downcast_ref::<RpcError>() {
                    debug!(identity = %self.identity(), %message_id, %method, code = %rpc.code, "handler returned an error");
                    return reject(rpc.clone());
                }
                error!(identity = %self.identity(), %message_id, %method, error = ?err, "handler failed");
                return reject(RpcError::internal());
            }
            Err(_) => {
                error!(identity = %self.identity(), %message_id, %method, "handler panicked");
                return reject(RpcError::internal());
            }
        };

        if shared.options.strict_mode {
            if let Err(e) = shared
                .schemas
                .validate(protocol, &method, Direction::Response, &payload)
            {
                error!(identity = %self.identity(), %message_id, %method, error = %e, "handler produced an invalid result");
                return reject(e.to_rpc_error(protocol));
            }
        }

        Envelope::CallResult(CallResult {
            message_id,
            payload,
        })
    }

    fn send_response(&self, response: Envelope) {
        if !self.is_open() {
            debug!(identity = %self.identity(), message_id = %response.message_id(), "connection gone, dropping response");
            return;
        }
        let _ = self.inner.outbound.send(Message::Text(codec::encode(&response)));
    }

    /// Answer a frame that failed to decode, when it can be answered.
    pub(crate) fn on_framing_error(&self, err: FramingError) {
        match &err.message_id {
            Some(message_id) => {
                warn!(identity = %self.identity(), %message_id, error = %err, "malformed call");
                let rpc = err.to_rpc_error(self.protocol());
                self.send_response(Envelope::CallError(CallError::from_rpc(message_id.clone(), rpc)));
            }
            None => warn!(identity = %self.identity(), error = %err, "dropping malformed frame"),
        }
        self.count_bad_message();
    }

    /// Count a frame that could not be used; too many close the connection.
    pub(crate) fn count_bad_message(&self) {
        let seen = self.inner.bad_messages.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max) = self.inner.shared.options.max_bad_messages {
            if seen >= max {
                warn!(identity = %self.identity(), seen, "too many malformed messages");
                self.close(1002, "too many malformed messages");
            }
        }
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::server::RpcServerOptions;
    use crate::ocpp::SchemaRegistry;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn client_with(options: RpcServerOptions) -> (RpcClient, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared::new(options, Arc::new(SchemaRegistry::ocpp16())));
        let client = RpcClient::new(
            HandshakeInfo::new("CP001", "ocpp1.6"),
            SessionData::new(),
            tx,
            shared,
        );
        (client, rx)
    }

    fn client() -> (RpcClient, mpsc::UnboundedReceiver<Message>) {
        client_with(RpcServerOptions::default())
    }

    fn call(id: &str, method: &str, params: Value) -> Call {
        Call {
            message_id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_recv() {
            Ok(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    async fn heartbeat(_ctx: CallContext) -> anyhow::Result<Value> {
        Ok(json!({"currentTime": "2026-10-16T08:00:00Z"}))
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let (client, mut rx) = client();
        client.handle("Heartbeat", heartbeat);

        client.clone().dispatch(call("2", "Heartbeat", json!({}))).await;

        assert_eq!(
            next_frame(&mut rx),
            json!([3, "2", {"currentTime": "2026-10-16T08:00:00Z"}])
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_implemented() {
        let (client, mut rx) = client();
        client.clone().dispatch(call("3", "UnknownMethod", json!({}))).await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame[0], 4);
        assert_eq!(frame[1], "3");
        assert_eq!(frame[2], "NotImplemented");
        assert_eq!(frame[4], json!({}));
    }

    #[tokio::test]
    async fn test_invalid_params_never_reach_handler() {
        let (client, mut rx) = client();
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        client.handle("BootNotification", move |_ctx: CallContext| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(json!({}))
            }
        });

        client
            .clone()
            .dispatch(call("4", "BootNotification", json!({"chargePointModel": "X"})))
            .await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame[2], "OccurenceConstraintViolation");
        assert_eq!(frame[4]["path"], "$.chargePointVendor");
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lenient_mode_skips_validation() {
        let (client, mut rx) = client_with(RpcServerOptions {
            strict_mode: false,
            ..Default::default()
        });
        client.handle("BootNotification", |_ctx: CallContext| async {
            Ok::<_, anyhow::Error>(json!({"anything": true}))
        });

        client.clone().dispatch(call("5", "BootNotification", json!(1))).await;
        assert_eq!(next_frame(&mut rx), json!([3, "5", {"anything": true}]));
    }

    #[tokio::test]
    async fn test_handler_rpc_error_is_forwarded() {
        let (client, mut rx) = client();
        client.handle_any(|_ctx: CallContext| async {
            Err::<Value, _>(
                RpcError::new(ErrorCode::SecurityError)
                    .with_description("unknown badge")
                    .with_details(json!({"idTag": "X"}))
                    .into(),
            )
        });

        client.clone().dispatch(call("6", "Authorize", json!({"idTag": "X"}))).await;
        assert_eq!(
            next_frame(&mut rx),
            json!([4, "6", "SecurityError", "unknown badge", {"idTag": "X"}])
        );
    }

    #[tokio::test]
    async fn test_handler_failure_and_panic_become_internal_error() {
        let (client, mut rx) = client();
        client.handle("DataTransfer", |_ctx: CallContext| async {
            Err::<Value, _>(anyhow::anyhow!("database unavailable"))
        });
        client.handle("Authorize", |_ctx: CallContext| async {
            if true {
                panic!("handler bug");
            }
            Ok::<_, anyhow::Error>(json!({}))
        });

        client
            .clone()
            .dispatch(call("7", "DataTransfer", json!({"vendorId": "acme"})))
            .await;
        client
            .clone()
            .dispatch(call("8", "Authorize", json!({"idTag": "A"})))
            .await;

        assert_eq!(next_frame(&mut rx)[2], "InternalError");
        assert_eq!(next_frame(&mut rx)[2], "InternalError");
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_invalid_result_is_not_sent() {
        let (client, mut rx) = client();
        client.handle("Heartbeat", |_ctx: CallContext| async {
            Ok::<_, anyhow::Error>(json!({"currentTime": "not a date"}))
        });

        client.clone().dispatch(call("9", "Heartbeat", json!({}))).await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame[0], 4);
        assert_eq!(frame[2], "FormationViolation");
    }

    #[tokio::test]
    async fn test_reject_policy_for_methods_without_schema() {
        let (client, mut rx) = client_with(RpcServerOptions {
            unknown_methods: UnknownMethodPolicy::Reject,
            ..Default::default()
        });
        client.handle_any(|_ctx: CallContext| async {
            Ok::<_, anyhow::Error>(json!({"status": "Accepted"}))
        });

        client.clone().dispatch(call("10", "VendorThing", json!({}))).await;
        assert_eq!(next_frame(&mut rx)[2], "NotSupported");

        client.clone().dispatch(call("11", "Reset", json!({"type": "Soft"}))).await;
        assert_eq!(next_frame(&mut rx), json!([3, "11", {"status": "Accepted"}]));
    }

    #[tokio::test]
    async fn test_params_as_maps_to_format_violation() {
        #[derive(serde::Deserialize)]
        struct Typed {
            count: u32,
        }

        let (client, mut rx) = client_with(RpcServerOptions {
            strict_mode: false,
            ..Default::default()
        });
        client.handle("Count", |ctx: CallContext| async move {
            let typed: Typed = ctx.params_as()?;
            Ok::<_, anyhow::Error>(json!({"count": typed.count}))
        });

        client.clone().dispatch(call("12", "Count", json!({"count": "x"}))).await;
        assert_eq!(next_frame(&mut rx)[2], "FormationViolation");
    }

    #[tokio::test]
    async fn test_outbound_call_resolves_by_message_id() {
        let (client, mut rx) = client();
        let caller = client.clone();
        let task = tokio::spawn(async move { caller.call("Reset", json!({"type": "Soft"})).await });

        let frame = loop {
            if let Some(Message::Text(text)) = rx.recv().await {
                break serde_json::from_str::<Value>(&text).unwrap();
            }
        };
        assert_eq!(frame[0], 2);
        assert_eq!(frame[2], "Reset");
        let id = frame[1].as_str().unwrap().to_string();
        assert_eq!(client.pending_calls(), 1);

        client.resolve_pending(Envelope::CallResult(CallResult {
            message_id: id,
            payload: json!({"status": "Accepted"}),
        }));

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, json!({"status": "Accepted"}));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_outbound_call_remote_error() {
        let (client, mut rx) = client();
        let caller = client.clone();
        let task = tokio::spawn(async move { caller.call("Reset", json!({"type": "Hard"})).await });

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected call frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        client.resolve_pending(Envelope::CallError(CallError::from_rpc(
            frame[1].as_str().unwrap(),
            RpcError::new(ErrorCode::NotSupported),
        )));

        match task.await.unwrap() {
            Err(OcppError::Remote(rpc)) => assert_eq!(rpc.code, ErrorCode::NotSupported),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outbound_params_are_validated() {
        let (client, mut rx) = client();
        let err = client.call("Reset", json!({"type": "Medium"})).await.unwrap_err();
        assert!(matches!(err, OcppError::Validation(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_late_response() {
        let (client, mut rx) = client();
        let started = tokio::time::Instant::now();
        let err = client
            .call_with("Reset", json!({"type": "Soft"}), CallOptions::timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, OcppError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(client.pending_calls(), 0);

        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected call frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        client.resolve_pending(Envelope::CallResult(CallResult {
            message_id: frame[1].as_str().unwrap().to_string(),
            payload: json!({"status": "Accepted"}),
        }));
        assert_eq!(client.pending_calls(), 0);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_one_outstanding_call_at_a_time() {
        let (client, mut rx) = client();
        let first = {
            let c = client.clone();
            tokio::spawn(async move { c.call("Reset", json!({"type": "Soft"})).await })
        };
        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected call frame");
        };
        let second = {
            let c = client.clone();
            tokio::spawn(async move { c.call("Reset", json!({"type": "Hard"})).await })
        };
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "second call must wait for the first");

        let frame: Value = serde_json::from_str(&text).unwrap();
        client.resolve_pending(Envelope::CallResult(CallResult {
            message_id: frame[1].as_str().unwrap().to_string(),
            payload: json!({"status": "Accepted"}),
        }));
        assert!(first.await.unwrap().is_ok());

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected second call frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame[3]["type"], "Hard");
        client.close(1000, "done");
        assert!(matches!(second.await.unwrap(), Err(OcppError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_pending() {
        let (client, mut rx) = client();
        let caller = client.clone();
        let pending = tokio::spawn(async move { caller.call("Reset", json!({"type": "Soft"})).await });
        let _ = rx.recv().await;

        assert!(client.close(1000, "bye"));
        assert!(!client.close(1000, "bye again"));
        assert_eq!(client.state(), ConnectionState::Closing);
        assert!(matches!(pending.await.unwrap(), Err(OcppError::ConnectionClosed)));
        assert!(matches!(
            client.call("Reset", json!({"type": "Soft"})).await,
            Err(OcppError::ConnectionClosed)
        ));

        let close_frames = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|m| matches!(m, Message::Close(_)))
            .count();
        assert_eq!(close_frames, 1);

        client.finish();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.closed().await, CloseInfo::new(1000, "bye"));
        assert!(!client.close(1000, "after close"));
    }

    #[tokio::test]
    async fn test_responses_dropped_after_close() {
        let (client, mut rx) = client();
        client.handle("Heartbeat", heartbeat);
        client.close(1000, "bye");
        let _ = rx.try_recv();

        client.clone().dispatch(call("13", "Heartbeat", json!({}))).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_message_budget() {
        let (client, mut rx) = client_with(RpcServerOptions {
            max_bad_messages: Some(2),
            ..Default::default()
        });
        let err = codec::decode("[2, \"14\", \"Heartbeat\"]").unwrap_err();
        client.on_framing_error(err);
        assert_eq!(next_frame(&mut rx)[2], "FormationViolation");
        assert!(client.is_open());

        client.count_bad_message();
        assert!(!client.is_open());
        assert_eq!(client.close_info(), Some(CloseInfo::new(1002, "too many malformed messages")));
    }

    #[test]
    fn test_truncate_reason() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(long.starts_with(cut));
        assert_eq!(truncate_reason("short"), "short");
    }
}
