//! coderoom: room-based live code sharing server.
//!
//! Usage: coderoom [--storage memory|rocksdb|disabled] [--data-dir DIR] <command>

mod cli;
mod maintenance;

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use coderoom_collab::server::SyncServer;
use tokio::net::TcpListener;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.to_config(&cli.storage);
            let bind_addr = config.bind_addr.clone();
            let server = SyncServer::new(config).context("opening room storage")?;
            let listener = TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("binding {bind_addr}"))?;

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for shutdown signal: {e}");
                    std::future::pending::<()>().await;
                }
            };
            server
                .serve(listener, shutdown)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;

            let stats = server.stats().await;
            log::info!(
                "Served {} connection(s), {} message(s), {} snapshot(s) accepted",
                stats.total_connections,
                stats.total_messages,
                stats.snapshots_accepted
            );
        }

        Commands::Inspect { room, body } => {
            let store = maintenance::store_over(maintenance::open_gateway(&cli.storage)?);
            let mut stdout = std::io::stdout().lock();
            maintenance::inspect(&store, room.as_deref(), body, &mut stdout).await?;
            stdout.flush()?;
        }

        Commands::Reset { room, code, file } => {
            let store = maintenance::store_over(maintenance::open_gateway(&cli.storage)?);
            let version = maintenance::reset(&store, &room, code, file.as_deref()).await?;
            println!("{room} reset to v{version}");
        }

        Commands::Purge => {
            let gateway = maintenance::open_gateway(&cli.storage)?;
            let purged = gateway.purge_expired()?;
            gateway.flush()?;
            println!("purged {purged} expired key(s)");
        }
    }

    Ok(())
}
