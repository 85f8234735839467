//! tandem-node: one node of the coordination plane.
//!
//! Exit codes: 0 normal, 1 fatal configuration, 2 substrate unreachable at
//! startup.

use tandem_core::{NodeConfig, EXIT_CONFIG, EXIT_SUBSTRATE};
use tandem_gateway::Gateway;
use tandem_substrate::Substrate;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let substrate = match Substrate::connect(&config.substrate_url) {
        Ok(substrate) => substrate,
        Err(e) => {
            log::error!("cannot reach substrate at {}: {e}", config.substrate_url);
            std::process::exit(EXIT_SUBSTRATE);
        }
    };

    let gateway = Gateway::new(substrate, &config);
    gateway.hub.start().await;

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("cannot bind {}: {e}", config.bind_addr);
            std::process::exit(EXIT_CONFIG);
        }
    };
    log::info!(
        "node {} listening on {} (substrate: {})",
        config.node_id,
        config.bind_addr,
        config.substrate_url
    );

    let app = gateway.router();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown signal received");
        })
        .await
    {
        log::error!("server error: {e}");
        std::process::exit(EXIT_CONFIG);
    }
}
