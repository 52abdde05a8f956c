use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

use crate::ocpp::{RpcServerOptions, UnknownMethodPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub rpc: RpcConfig,
    pub auth: AuthConfig,
    #[validate(nested)]
    pub station: StationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            enable_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RpcConfig {
    #[validate(length(min = 1))]
    pub protocols: Vec<String>,
    pub strict_mode: bool,
    #[validate(range(min = 1))]
    pub call_timeout_secs: u64,
    #[validate(range(min = 1, max = 64))]
    pub call_concurrency: usize,
    /// 0 disables keepalive pings.
    pub ping_interval_secs: u64,
    #[validate(range(min = 1))]
    pub handshake_timeout_secs: u64,
    pub close_grace_secs: u64,
    #[validate(range(min = 1))]
    pub max_bad_messages: Option<u32>,
    pub unknown_methods: UnknownMethodPolicy,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let options = RpcServerOptions::default();
        Self {
            protocols: options.protocols,
            strict_mode: options.strict_mode,
            call_timeout_secs: options.call_timeout.as_secs(),
            call_concurrency: options.call_concurrency,
            ping_interval_secs: options.ping_interval.map_or(0, |d| d.as_secs()),
            handshake_timeout_secs: options.handshake_timeout.as_secs(),
            close_grace_secs: options.close_grace.as_secs(),
            max_bad_messages: options.max_bad_messages,
            unknown_methods: options.unknown_methods,
        }
    }
}

impl From<&RpcConfig> for RpcServerOptions {
    fn from(cfg: &RpcConfig) -> Self {
        Self {
            protocols: cfg.protocols.clone(),
            strict_mode: cfg.strict_mode,
            call_timeout: Duration::from_secs(cfg.call_timeout_secs),
            call_concurrency: cfg.call_concurrency,
            ping_interval: (cfg.ping_interval_secs > 0)
                .then(|| Duration::from_secs(cfg.ping_interval_secs)),
            handshake_timeout: Duration::from_secs(cfg.handshake_timeout_secs),
            close_grace: Duration::from_secs(cfg.close_grace_secs),
            max_bad_messages: cfg.max_bad_messages,
            unknown_methods: cfg.unknown_methods,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HTTP Basic password; when unset every station is accepted.
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StationConfig {
    /// Heartbeat interval handed out in BootNotification responses.
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u32,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
        }
    }
}

impl Config {
    /// Defaults, then `config/default.toml`, then `OCPP__*` variables, then `APP_PORT`.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("OCPP__").split("__"))
            .merge(Env::raw().filter_map(|key| {
                key.as_str()
                    .eq_ignore_ascii_case("APP_PORT")
                    .then(|| "server.port".into())
            }))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn rpc_options(&self) -> RpcServerOptions {
        RpcServerOptions::from(&self.rpc)
    }
}
