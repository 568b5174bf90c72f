//! Tunnel agent binary.
//!
//! Thin shell over the `client` crate: parse the CLI surface, set up
//! logging, run the agent, and translate termination signals into a graceful
//! shutdown.
//!
//! Exit codes: 0 on graceful shutdown, 1 when the connection retry limit is
//! exhausted, 2 when required configuration is missing.

mod cli;
mod logging;

use clap::Parser;
use client::Agent;
use tracing::{error, info};

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    logging::init(&args.log_level, args.log_json);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(reason) => {
            error!("{reason}");
            std::process::exit(2);
        }
    };

    info!(
        server = %config.server_addr,
        local = %config.local_url,
        tls = config.tls.is_some(),
        version = %config.version,
        "starting tunnel agent"
    );

    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };

    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received");
        shutdown.cancel();
    });

    if let Err(err) = agent.run().await {
        error!(error = %err, "agent terminated with error");
        std::process::exit(1);
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
