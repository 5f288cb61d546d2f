use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use oltalk_server::config::ServerConfig;
use oltalk_server::server::Server;

fn resolve_config_path() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    for pair in args.windows(2) {
        if pair[0] == "--config" {
            return PathBuf::from(&pair[1]);
        }
    }
    PathBuf::from("config/server.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = resolve_config_path();
    let config = ServerConfig::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "oltalk_server={0},oltalk_proto={0}",
                    config.log_level
                ))
            }),
        )
        .init();

    info!("starting server with config {}", config_path.display());
    info!("db path: {}", config.db_path.display());
    info!("thread pool size: {} (advisory)", config.thread_pool_size);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data_dir {}", config.data_dir.display()))?;

    let server = Server::bind(&config).await?;
    info!("listening on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result,
        _ = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received ctrl-c");
    }
}
