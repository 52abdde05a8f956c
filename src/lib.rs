//! OCPP-J RPC server for charging stations.
//!
//! The [`ocpp`] module is the protocol core; [`api`], [`config`],
//! [`telemetry`] and [`station`] make it a runnable central system.

pub mod api;
pub mod auth;
pub mod config;
pub mod ocpp;
pub mod station;
pub mod telemetry;
