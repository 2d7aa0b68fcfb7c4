mod backoff;
mod config;
mod error;
mod health;
mod models;
mod mqtt_relay;
mod sink;
mod writer;

use crate::config::Config;
use crate::mqtt_relay::Relay;
use crate::sink::HttpSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load configuration; this is the only fatal error path.
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let sink = match HttpSink::from_config(&config) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!("Failed to build sink client: {e}");
            std::process::exit(1);
        }
    };

    let relay = Relay::new(config, sink);

    // The relay runs unattended: a failed connect cycle is logged and the
    // whole cycle is retried, the process never exits over it.
    loop {
        match relay.start().await {
            Ok(()) => break,
            Err(e) => error!("{e}; restarting connect cycle."),
        }
    }

    // Periodic health snapshot for external monitoring.
    let relay_for_health = relay.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            match serde_json::to_string(&relay_for_health.health()) {
                Ok(snapshot) => info!("health {snapshot}"),
                Err(e) => error!("Failed to serialize health snapshot: {e}"),
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {e:?}");
    }
    relay.stop().await;
    info!("Relay shut down successfully.");
}
