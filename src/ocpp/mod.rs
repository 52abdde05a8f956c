//! OCPP-J RPC server
//!
//! Accepts WebSocket connections from charging stations speaking an OCPP
//! subprotocol and runs the call/result/error exchange over them.
//!
//! # Architecture
//! - [`codec`]: array framing of CALL, CALLRESULT and CALLERROR
//! - [`schema`]: strict-mode payload validation per method and direction
//! - [`handler`]: method handlers and their lookup order
//! - [`client`]: one session per connection, with dispatch and outbound calls
//! - [`connection`]: handshake, live-session set, read/write loops
//! - [`server`]: the facade the application configures

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod messages;
pub mod schema;
pub mod server;

pub use client::{CallOptions, CloseInfo, RpcClient};
pub use codec::{decode, encode, Call, CallError, CallResult, Envelope, FramingError, MessageType};
pub use connection::ConnectionState;
pub use error::{ErrorCode, OcppError, RpcError, OCPP16};
pub use handler::{CallContext, Handler, HandlerResult};
pub use schema::{Direction, Schema, SchemaRegistry, ValidationError};
pub use server::{RpcServer, RpcServerOptions, ServerEvent, UnknownMethodPolicy};
