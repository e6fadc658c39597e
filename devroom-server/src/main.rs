use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (DEVROOM_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("DEVROOM_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("devroom_server=info".parse()?)
        .add_directive("devroom_sandbox=info".parse()?)
        .add_directive("devroom_agent=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = devroom_server::config::ServerConfig::parse();
    tracing::info!("Starting devroom server on {}", config.listen_addr);
    tracing::info!("Sandboxes under {}", config.sandbox_root.display());
    match &config.db_path {
        Some(path) => tracing::info!("Tree store at {}", path.display()),
        None => tracing::info!("Tree store in memory"),
    }
    if let Some(mention) = &config.ai_mention {
        tracing::info!("AI answers messages mentioning {mention}");
    }

    let server = devroom_server::server::Server::new(config)?;
    server.run().await
}
