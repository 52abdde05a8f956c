//! RPC server facade
//!
//! [`RpcServer`] binds the WebSocket endpoint, owns the live sessions, and is
//! where the embedding application registers its authenticator, server-wide
//! handlers and connection callbacks.

use axum::{routing::get, Router};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{CloseInfo, RpcClient};
use super::connection::{self, ConnectionManager};
use super::handler::{Handler, HandlerRegistry};
use super::schema::{SchemaRegistry, OCPP16_SCHEMAS};
use crate::auth::{AcceptAll, Authenticator};

/// What to do, in strict mode, with a call whose method has no schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownMethodPolicy {
    /// Hand it to its handler unvalidated.
    #[default]
    PassThrough,
    /// Answer `NotSupported` without invoking any handler.
    Reject,
}

#[derive(Debug, Clone)]
pub struct RpcServerOptions {
    /// Accepted subprotocols, most preferred first.
    pub protocols: Vec<String>,
    pub strict_mode: bool,
    /// Default deadline for server-initiated calls.
    pub call_timeout: Duration,
    /// Maximum server-initiated calls in flight per connection.
    pub call_concurrency: usize,
    pub ping_interval: Option<Duration>,
    /// Upper bound on the authenticator.
    pub handshake_timeout: Duration,
    /// How long `close()` waits for in-flight work.
    pub close_grace: Duration,
    pub max_bad_messages: Option<u32>,
    pub unknown_methods: UnknownMethodPolicy,
}

impl Default for RpcServerOptions {
    fn default() -> Self {
        Self {
            protocols: vec![super::error::OCPP16.to_string()],
            strict_mode: true,
            call_timeout: Duration::from_secs(30),
            call_concurrency: 1,
            ping_interval: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(5),
            max_bad_messages: None,
            unknown_methods: UnknownMethodPolicy::PassThrough,
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ClientConnected {
        id: Uuid,
        identity: String,
        protocol: String,
    },
    ClientDisconnected {
        id: Uuid,
        identity: String,
        close: CloseInfo,
    },
}

/// State every session of a server shares.
pub(crate) struct ServerShared {
    pub(crate) options: RpcServerOptions,
    pub(crate) schemas: Arc<SchemaRegistry>,
    pub(crate) defaults: RwLock<HandlerRegistry>,
    pub(crate) tracker: TaskTracker,
}

impl ServerShared {
    pub(crate) fn new(options: RpcServerOptions, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            options,
            schemas,
            defaults: RwLock::new(HandlerRegistry::new()),
            tracker: TaskTracker::new(),
        }
    }
}

type ClientCallback = Arc<dyn Fn(RpcClient) -> BoxFuture<'static, ()> + Send + Sync>;

struct ServerInner {
    shared: Arc<ServerShared>,
    manager: ConnectionManager,
    authenticator: RwLock<Arc<dyn Authenticator>>,
    on_client: RwLock<Vec<ClientCallback>>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
    closing: AtomicBool,
    closed: CancellationToken,
    serve_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The OCPP-J RPC server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Server with the built-in OCPP 1.6 schemas.
    pub fn new(options: RpcServerOptions) -> Self {
        Self::with_schemas(options, OCPP16_SCHEMAS.clone())
    }

    pub fn with_schemas(options: RpcServerOptions, schemas: SchemaRegistry) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ServerInner {
                shared: Arc::new(ServerShared::new(options, Arc::new(schemas))),
                manager: ConnectionManager::default(),
                authenticator: RwLock::new(Arc::new(AcceptAll)),
                on_client: RwLock::new(Vec::new()),
                events,
                shutdown: CancellationToken::new(),
                closing: AtomicBool::new(false),
                closed: CancellationToken::new(),
                serve_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn options(&self) -> &RpcServerOptions {
        &self.inner.shared.options
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.inner.shared.schemas
    }

    /// Install the authenticator; the last one installed is used.
    pub fn auth<A: Authenticator>(&self, authenticator: A) {
        *self.inner.authenticator.write() = Arc::new(authenticator);
    }

    /// Run `callback` for every accepted connection before its first frame is read.
    pub fn on_client<F, Fut>(&self, callback: F)
    where
        F: Fn(RpcClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: ClientCallback = Arc::new(move |client| callback(client).boxed());
        self.inner.on_client.write().push(callback);
    }

    /// Server-wide handler for `method`, used when a session has no own handler.
    pub fn handle<H: Handler>(&self, method: impl Into<String>, handler: H) {
        self.inner
            .shared
            .defaults
            .write()
            .insert(method, Arc::new(handler));
    }

    /// Server-wide catch-all handler.
    pub fn handle_any<H: Handler>(&self, handler: H) {
        self.inner
            .shared
            .defaults
            .write()
            .set_wildcard(Arc::new(handler));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Live sessions, in no particular order.
    pub fn clients(&self) -> Vec<RpcClient> {
        self.inner.manager.snapshot()
    }

    /// A live session by station identity.
    pub fn client(&self, identity: &str) -> Option<RpcClient> {
        self.inner.manager.find(identity)
    }

    pub fn client_count(&self) -> usize {
        self.inner.manager.len()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Routes that accept station connections on any path.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/*path", get(connection::upgrade))
            .with_state(self.clone())
    }

    /// Bind `addr` and accept connections in the background. Returns the
    /// bound address (useful with port 0).
    pub async fn listen(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, self.router())
    }

    /// Serve `app` (which should include [`RpcServer::router`]) on `listener`.
    pub fn serve(&self, listener: TcpListener, app: Router) -> anyhow::Result<SocketAddr> {
        if self.is_closing() {
            anyhow::bail!("server is closing");
        }
        let addr = listener.local_addr()?;
        let shutdown = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
            if let Err(e) = result {
                error!(error = %e, "listener failed");
            }
        });
        self.inner.serve_tasks.lock().push(task);
        info!(%addr, protocols = ?self.options().protocols, "rpc server listening");
        Ok(addr)
    }

    /// Stop accepting connections, close every session with 1001 and wait up
    /// to the grace period for in-flight work. Later calls wait for the first.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            self.inner.closed.cancelled().await;
            return;
        }
        info!(clients = self.client_count(), "closing rpc server");
        self.inner.shutdown.cancel();

        for client in self.clients() {
            client.close(1001, "server shutting down");
        }

        let grace = self.options().close_grace;
        let tracker = &self.inner.shared.tracker;
        tracker.close();
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(?grace, remaining = tracker.len(), "grace period elapsed with work in flight");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.serve_tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        info!("rpc server closed");
        self.inner.closed.cancel();
    }

    /// A session with no transport behind it; whatever it sends is dropped.
    #[cfg(test)]
    pub(crate) fn detached_client(
        &self,
        handshake: crate::auth::HandshakeInfo,
        session: crate::auth::SessionData,
    ) -> RpcClient {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        RpcClient::new(handshake, session, tx, self.inner.shared.clone())
    }

    pub(crate) fn shared(&self) -> &Arc<ServerShared> {
        &self.inner.shared
    }

    pub(crate) fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub(crate) fn authenticator(&self) -> Arc<dyn Authenticator> {
        self.inner.authenticator.read().clone()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        // No subscribers is not an error.
        let _ = self.inner.events.send(event);
    }

    /// Run the `on_client` callbacks for a freshly accepted session.
    pub(crate) async fn notify_client(&self, client: &RpcClient) {
        let callbacks: Vec<ClientCallback> = self.inner.on_client.read().clone();
        for callback in callbacks {
            if std::panic::AssertUnwindSafe((*callback)(client.clone()))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(identity = %client.identity(), "client callback panicked");
            }
        }
        debug!(identity = %client.identity(), "client callbacks done");
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new(RpcServerOptions::default())
    }
}
