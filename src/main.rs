use anyhow::Result;
use ocpp_rpc_server::{api, auth::BasicAuth, config::Config, ocpp::RpcServer, station, telemetry};
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real deployments use the environment directly.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = Config::load()?;
    let server = RpcServer::new(cfg.rpc_options());

    match cfg.auth.password.as_deref() {
        Some(password) if !password.is_empty() => server.auth(BasicAuth::new(password)),
        _ => warn!("no auth.password configured - accepting every station"),
    }

    let station_cfg = cfg.station.clone();
    server.on_client(move |client| {
        let station_cfg = station_cfg.clone();
        async move {
            info!(
                identity = %client.identity(),
                protocol = %client.protocol(),
                session = ?client.session(),
                "station connected"
            );
            station::register(&client, &station_cfg);
        }
    });

    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!(
            "Server binding to 0.0.0.0 - stations on the network can connect. \
            Put it behind a TLS-terminating proxy for anything but local testing."
        );
    }

    info!(%addr, protocols = ?cfg.rpc.protocols, strict_mode = cfg.rpc.strict_mode, "starting OCPP RPC server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    server.serve(listener, api::router(server.clone(), &cfg))?;

    telemetry::shutdown_signal().await;
    server.close().await;

    warn!("shutdown complete");
    Ok(())
}
