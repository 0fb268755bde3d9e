mod backend;
mod catalog;
mod cli;
mod client;
mod config;
mod dispatch;
mod lifecycle;
mod protocol;
mod server;
mod session;
mod utils;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(format!("mindmapd={}", level)),
        None => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mindmapd=info"))
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
