//! Method handlers and their lookup tables.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::client::RpcClient;
use super::error::{ErrorCode, RpcError};

/// What a handler produces: a result payload, or an error. Returning an
/// [`RpcError`] answers with that CALLERROR; any other error is reported to
/// the peer as `InternalError`.
pub type HandlerResult = anyhow::Result<Value>;

/// An inbound call as seen by a handler.
#[derive(Clone)]
pub struct CallContext {
    pub message_id: String,
    pub method: String,
    pub params: Value,
    pub client: RpcClient,
}

impl CallContext {
    /// Deserialize the params into a typed request.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            RpcError::new(ErrorCode::format_violation(self.client.protocol()))
                .with_description(format!("invalid {} payload: {e}", self.method))
        })
    }

    pub fn identity(&self) -> &str {
        self.client.identity()
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: CallContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Handlers of one scope (a session or the whole server): one per method plus
/// an optional wildcard.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, Arc<dyn Handler>>,
    wildcard: Option<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method`, replacing any previous one.
    pub fn insert(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.methods.insert(method.into(), handler);
    }

    pub fn set_wildcard(&mut self, handler: Arc<dyn Handler>) {
        self.wildcard = Some(handler);
    }

    pub fn remove(&mut self, method: &str) -> bool {
        self.methods.remove(method).is_some()
    }

    pub fn clear_wildcard(&mut self) -> bool {
        self.wildcard.take().is_some()
    }

    pub fn exact(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }

    pub fn wildcard(&self) -> Option<Arc<dyn Handler>> {
        self.wildcard.clone()
    }

    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Pick the handler for `method`: session exact, server exact, session
/// wildcard, then server wildcard.
pub fn resolve(
    session: &HandlerRegistry,
    server: &HandlerRegistry,
    method: &str,
) -> Option<Arc<dyn Handler>> {
    session
        .exact(method)
        .or_else(|| server.exact(method))
        .or_else(|| session.wildcard())
        .or_else(|| server.wildcard())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: &'static str) -> Arc<dyn Handler> {
        Arc::new(move |_ctx: CallContext| async move { Ok::<_, anyhow::Error>(Value::from(tag)) })
    }

    fn is(handler: Option<Arc<dyn Handler>>, expected: &Arc<dyn Handler>) -> bool {
        handler.is_some_and(|h| Arc::ptr_eq(&h, expected))
    }

    #[test]
    fn test_resolution_order() {
        let session_exact = tagged("session-exact");
        let server_exact = tagged("server-exact");
        let session_any = tagged("session-any");
        let server_any = tagged("server-any");

        let mut session = HandlerRegistry::new();
        let mut server = HandlerRegistry::new();
        assert!(resolve(&session, &server, "Heartbeat").is_none());

        server.set_wildcard(server_any.clone());
        assert!(is(resolve(&session, &server, "Heartbeat"), &server_any));

        session.set_wildcard(session_any.clone());
        assert!(is(resolve(&session, &server, "Heartbeat"), &session_any));

        server.insert("Heartbeat", server_exact.clone());
        assert!(is(resolve(&session, &server, "Heartbeat"), &server_exact));

        session.insert("Heartbeat", session_exact.clone());
        assert!(is(resolve(&session, &server, "Heartbeat"), &session_exact));

        // Other methods still fall through to the session wildcard.
        assert!(is(resolve(&session, &server, "Authorize"), &session_any));
    }

    #[test]
    fn test_last_registration_wins() {
        let first = tagged("first");
        let second = tagged("second");
        let mut registry = HandlerRegistry::new();
        registry.insert("Reset", first);
        registry.insert("Reset", second.clone());
        assert!(is(registry.exact("Reset"), &second));
        assert_eq!(registry.methods(), vec!["Reset".to_string()]);
    }

    #[test]
    fn test_remove() {
        let mut registry = HandlerRegistry::new();
        registry.insert("Reset", tagged("x"));
        registry.set_wildcard(tagged("y"));
        assert!(registry.remove("Reset"));
        assert!(!registry.remove("Reset"));
        assert!(registry.clear_wildcard());
        assert!(registry.exact("Reset").is_none());
        assert!(registry.wildcard().is_none());
    }
}
