use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::backend::{Backend, MemoryBackend, ProcessBackend};
use crate::client::Client;
use crate::config::{BackendKind, ServerConfig, DEFAULT_CONFIG_FILE};
use crate::dispatch::Dispatcher;
use crate::lifecycle::Lifecycle;
use crate::session::SessionTable;

#[derive(Parser)]
#[command(name = "mindmapd")]
#[command(about = "Framed JSON bridge to MindManager mind maps", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, global = true, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Listen address (overrides config)")]
    pub listen: Option<String>,

    #[arg(long, global = true, value_enum, help = "Backend kind (overrides config)")]
    pub backend: Option<BackendKind>,

    #[arg(long, global = true, help = "Log level for mindmapd (overrides RUST_LOG)")]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server (default)
    Serve,
    /// Write a config file populated with the effective settings
    GenerateConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE, help = "Config file path")]
        output: PathBuf,
    },
    /// Print the capability descriptor
    Capabilities,
    /// Send one request to a running server and print the response
    Call {
        action: String,
        #[arg(long, default_value = "{}", help = "Request params as a JSON object")]
        params: String,
        #[arg(long, help = "Server address (defaults to the configured listen address)")]
        address: Option<String>,
    },
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = ServerConfig::load(&path)?;

        if let Some(listen) = &self.listen {
            config.listen_address = listen.clone();
        }
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        config.validate()?;
        Ok(config)
    }
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let config = cli.load_config()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::GenerateConfig { output } => {
            config.save(&output)?;
            println!("Config written to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Capabilities => {
            let sessions = Arc::new(SessionTable::new(Arc::new(MemoryBackend::new())));
            let dispatcher = Dispatcher::new(sessions, config.default_session);
            println!("{}", serde_json::to_string_pretty(dispatcher.capabilities())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Call { action, params, address } => {
            let params: Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            let address = address.unwrap_or(config.listen_address);
            let mut client = Client::connect(address.as_str())
                .await
                .with_context(|| format!("failed to connect to {}", address))?;
            let response = client.call(&action, params).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(if response.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn serve(config: ServerConfig) -> Result<ExitCode> {
    match config.backend.kind {
        BackendKind::Memory => serve_with(config, MemoryBackend::new()).await,
        BackendKind::Process => {
            let backend = ProcessBackend::new(&config.backend.command)?;
            serve_with(config, backend).await
        }
    }
}

async fn serve_with<B: Backend>(config: ServerConfig, backend: B) -> Result<ExitCode> {
    info!(
        "Starting mindmapd on {} with the {} backend",
        config.listen_address,
        backend.name()
    );
    let hold = Duration::from_secs(config.startup_failure_hold_secs);
    let lifecycle = Lifecycle::new(config, backend);

    match lifecycle.run().await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("Startup failed: {}", e);
            hold_after_failure(hold).await;
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Keep the process around briefly so a supervising console shows the error.
async fn hold_after_failure(hold: Duration) {
    if hold.is_zero() {
        return;
    }
    warn!("Exiting in {}s (Ctrl-C to exit now)", hold.as_secs());
    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["mindmapd"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn overrides_apply_on_top_of_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let cli = Cli::try_parse_from([
            "mindmapd",
            "--config",
            path.to_str().unwrap(),
            "--listen",
            "127.0.0.1:9999",
            "--backend",
            "memory",
        ])
        .unwrap();

        let config = cli.load_config().unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9999");
        assert_eq!(config.backend.kind, BackendKind::Memory);
    }

    #[test]
    fn process_backend_without_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let args = ["mindmapd", "--config", path.to_str().unwrap(), "--backend", "process"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn call_takes_action_and_json_params() {
        let args = ["mindmapd", "call", "get_session", "--params", r#"{"session_id":"x"}"#];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Some(Commands::Call { action, params, address }) => {
                assert_eq!(action, "get_session");
                assert_eq!(params, r#"{"session_id":"x"}"#);
                assert!(address.is_none());
            }
            _ => panic!("expected call"),
        }
    }
}
