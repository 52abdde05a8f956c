//! Connection authentication
//!
//! Every WebSocket upgrade is described by a [`HandshakeInfo`] and passed to
//! an [`Authenticator`], which accepts it (attaching session data) or rejects
//! it with an HTTP status. The authenticator runs before any session exists.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use uuid::Uuid;

/// Data attached to a session when its connection is accepted.
pub type SessionData = serde_json::Map<String, Value>;

/// What the server knows about a connection while deciding whether to accept it.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// Station identity (last path segment, percent-decoded).
    pub identity: String,
    /// Path the station connected to, without the identity segment.
    pub endpoint: String,
    /// Subprotocols offered by the station, in its order of preference.
    pub protocols: Vec<String>,
    /// Subprotocol selected for this connection.
    pub protocol: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub query: Option<String>,
    /// HTTP Basic password, present only when the user name matches the identity.
    pub password: Option<Vec<u8>>,
}

impl HandshakeInfo {
    pub fn new(identity: impl Into<String>, protocol: impl Into<String>) -> Self {
        let protocol = protocol.into();
        Self {
            identity: identity.into(),
            endpoint: "/".to_string(),
            protocols: vec![protocol.clone()],
            protocol,
            headers: HeaderMap::new(),
            remote_addr: None,
            query: None,
            password: None,
        }
    }
}

/// Outcome of authenticating one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    Accept(SessionData),
    Reject { status: StatusCode, reason: String },
}

impl AuthDecision {
    pub fn accept() -> Self {
        Self::Accept(SessionData::new())
    }

    pub fn reject(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Reject {
            status,
            reason: reason.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::reject(StatusCode::UNAUTHORIZED, "invalid credentials")
    }
}

/// Decides whether a connection may proceed. Async closures taking a
/// [`HandshakeInfo`] implement it too.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, handshake: HandshakeInfo) -> AuthDecision;
}

#[async_trait]
impl<F, Fut> Authenticator for F
where
    F: Fn(HandshakeInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AuthDecision> + Send + 'static,
{
    async fn authenticate(&self, handshake: HandshakeInfo) -> AuthDecision {
        (self)(handshake).await
    }
}

/// Accepts every connection and tags it with a fresh `sessionId`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl Authenticator for AcceptAll {
    async fn authenticate(&self, _handshake: HandshakeInfo) -> AuthDecision {
        let mut session = SessionData::new();
        session.insert("sessionId".into(), Value::String(Uuid::new_v4().to_string()));
        AuthDecision::Accept(session)
    }
}

/// Shared-password HTTP Basic authentication (OCPP security profile 1).
#[derive(Clone)]
pub struct BasicAuth {
    password: String,
}

impl BasicAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth").field("password", &"***").finish()
    }
}

#[async_trait]
impl Authenticator for BasicAuth {
    async fn authenticate(&self, handshake: HandshakeInfo) -> AuthDecision {
        match handshake.password.as_deref() {
            Some(given) if given == self.password.as_bytes() => {
                let mut session = SessionData::new();
                session.insert("sessionId".into(), Value::String(Uuid::new_v4().to_string()));
                session.insert("authenticated".into(), Value::Bool(true));
                AuthDecision::Accept(session)
            }
            _ => AuthDecision::unauthorized(),
        }
    }
}

/// Extract `(user, password)` from an `Authorization: Basic` header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, Vec<u8>)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    // Passwords may be arbitrary bytes; only the user part must be text.
    let colon = decoded.iter().position(|b| *b == b':')?;
    let user = String::from_utf8(decoded[..colon].to_vec()).ok()?;
    Some((user, decoded[colon + 1..].to_vec()))
}
