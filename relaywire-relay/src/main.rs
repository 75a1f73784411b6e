//! `relaywire-relay` -- fan-out relay for relaywire clients.
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin relaywire-relay
//!
//! # Run on custom address
//! cargo run --bin relaywire-relay -- --bind 127.0.0.1:8080
//! ```

use clap::Parser;
use relaywire_relay::config::{RelayCliArgs, RelayConfig};
use relaywire_relay::relay;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting relaywire relay");

    match relay::start_server(&config.bind_addr).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay listening");
            if let Err(e) = handle.await {
                tracing::error!(err = %e, "relay task failed");
            }
        }
        Err(e) => {
            tracing::error!(err = %e, "failed to start relay");
            std::process::exit(1);
        }
    }
}
