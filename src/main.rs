//! nudge: relay-to-push notification bridge daemon.
//!
//! Maintains live WebSocket subscriptions against every relay referenced by a
//! registered subscriber and forwards matching events to each subscriber's
//! push endpoint.  Subscriber state is in-memory only: clients re-subscribe
//! on their own schedule after a restart.

use std::sync::Arc;

use clap::Parser;

use nudge::api;
use nudge::bridge::Bridge;
use nudge::config::{Cli, Config};
use nudge::{logging, nlog};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    logging::init();

    nlog!("nudge starting");
    nlog!("  bind: {}", config.bind_addr);
    nlog!("  dedup retention: {}s", config.dedup_retention_secs);
    nlog!(
        "  reconnect delay: {}s (max {}s)",
        config.reconnect_delay_secs,
        config.reconnect_max_delay_secs
    );

    let bind_addr = config.bind_addr.clone();
    let bridge = Bridge::new(config);
    let app = api::app(Arc::clone(&bridge));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    nlog!("nudge listening on http://{}", bind_addr);

    let shutdown_bridge = Arc::clone(&bridge);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            nlog!("shutting down");
            shutdown_bridge.shutdown().await;
        })
        .await
        .expect("server error");
}
