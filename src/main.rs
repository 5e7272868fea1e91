use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ssh_gateway::api::{self, AppState};
use ssh_gateway::bridge::{BridgeManager, WsBridge};
use ssh_gateway::config::{self, GatewayConfig};
use ssh_gateway::logging;
use ssh_gateway::policy::{AllowAll, DenyList, LeasePolicy};
use ssh_gateway::registry::ConnectionRegistry;
use ssh_gateway::session::SessionContext;
use ssh_gateway::sftp::TransferPipeline;
use ssh_gateway::ssh::RusshConnector;

/// How long shutdown waits for interactive sessions to close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ssh-gateway: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Gateway stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: GatewayConfig) -> std::io::Result<()> {
    let deny = DenyList::new(config.deny_hosts.clone(), config.deny_clients.clone());
    let policy: Arc<dyn LeasePolicy> = if deny.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(deny)
    };

    let connector = Arc::new(RusshConnector::new(config.connect_timeout()));
    let registry = Arc::new(ConnectionRegistry::with_policy(
        connector,
        policy,
        config.registry(),
    ));
    let manager = Arc::new(BridgeManager::new());
    let shutdown = CancellationToken::new();

    let sweeper = registry.spawn_sweeper(shutdown.clone());

    let http_listener = TcpListener::bind(config.http_addr).await?;
    let ws_listener = TcpListener::bind(config.ws_addr).await?;

    let state = AppState {
        registry: registry.clone(),
        manager: manager.clone(),
        limits: config.session(),
        transfers: Arc::new(TransferPipeline::new(config.transfer_chunk_size)),
    };
    let http = tokio::spawn(api::serve(state, http_listener, shutdown.clone()));

    let bridge = Arc::new(WsBridge::new(
        SessionContext {
            registry: registry.clone(),
            manager: manager.clone(),
            config: config.session(),
            shutdown: shutdown.clone(),
        },
        config.max_sessions_per_client,
        config.max_message_bytes,
    ));
    let ws = tokio::spawn(bridge.serve(ws_listener));

    info!(
        "ssh-gateway {} started (http {}, ws {})",
        env!("CARGO_PKG_VERSION"),
        config.http_addr,
        config.ws_addr
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    shutdown.cancel();
    manager.close_all(SHUTDOWN_GRACE).await;
    let _ = ws.await;
    match http.await {
        Ok(Err(e)) => error!("HTTP API error: {}", e),
        Err(e) => error!("HTTP API task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = sweeper.await;
    registry.shutdown().await;

    info!("ssh-gateway stopped");
    Ok(())
}
