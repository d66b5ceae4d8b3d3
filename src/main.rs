//! netfilterd - intrusion-response daemon for the mail stack.
//!
//! Consumes authentication-failure events from the store's pub/sub channel,
//! correlates them per source network under a sliding window, and enforces
//! the verdicts as packet-filter reject rules. Fatal conditions exit with
//! code 2 so the supervisor restarts the process; a clean SIGTERM exits 0.

mod config;
mod context;
mod engine;
mod error;
mod firewall;
mod guard;
mod lists;
mod nat;
mod store;
mod watcher;

use crate::config::Config;
use crate::context::Context;
use crate::engine::BanEngine;
use crate::firewall::iptables::IptablesBackend;
use crate::store::Store;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let config = Config::from_env();
    info!(store = %config.store_url, "Starting netfilterd");

    // Blocks until the store answers; transient outages only delay startup.
    let store = Store::connect(&config.store_url)
        .await
        .map_err(|e| anyhow::anyhow!("invalid store endpoint: {}", e))?;

    let v4 = IptablesBackend::new(false)
        .map_err(|e| anyhow::anyhow!("cannot open IPv4 filter tables: {}", e))?;
    let v6 = IptablesBackend::new(true)
        .map_err(|e| anyhow::anyhow!("cannot open IPv6 filter tables: {}", e))?;

    let ctx = Arc::new(Context::new(config, store, Box::new(v4), Box::new(v6)));
    let engine = BanEngine::new(Arc::clone(&ctx));

    // A previous run may have been killed without cleanup.
    engine
        .clear()
        .await
        .map_err(|e| anyhow::anyhow!("startup clear failed: {}", e))?;
    engine
        .init_chain()
        .await
        .map_err(|e| anyhow::anyhow!("chain init failed: {}", e))?;

    // Graceful shutdown on SIGTERM (SIGINT for foreground runs).
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - initiating shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM - initiating shutdown"),
            }
            ctx.lifecycle.trigger(0);
        });
    }

    tokio::spawn(watcher::run(Arc::clone(&ctx), engine.clone()));
    tokio::spawn(engine::autopurge_loop(engine.clone()));
    tokio::spawn(guard::chain_order_loop(Arc::clone(&ctx)));
    tokio::spawn(lists::allowlist_loop(Arc::clone(&ctx)));
    tokio::spawn(lists::blocklist_loop(engine.clone()));

    if let Some(snat) = ctx.config.snat4 {
        info!(source = %snat.source, to = %snat.to, "SNAT guard enabled");
        tokio::spawn(nat::snat_loop(Arc::clone(&ctx), snat));
    }
    if let Some(snat) = ctx.config.snat6 {
        info!(source = %snat.source, to = %snat.to, "SNAT6 guard enabled");
        tokio::spawn(nat::snat_loop(Arc::clone(&ctx), snat));
    }

    // Supervisor wait: loops raise the flag, we propagate the code.
    while !ctx.lifecycle.should_quit() {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    if let Err(err) = engine.clear().await {
        error!(error = %err, "cleanup on exit failed");
    }

    let code = ctx.lifecycle.exit_code();
    info!(code, "netfilterd exiting");
    std::process::exit(code);
}
