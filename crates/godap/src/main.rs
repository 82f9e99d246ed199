use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use godap::proxy::ProxyConfig;
use godap_config::GodapConfig;

/// Debug Adapter Protocol server for Go programs, backed by Delve.
///
/// The adapter speaks DAP over stdio.
#[derive(Debug, Parser)]
#[command(name = "godap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `GODAP_CONFIG` is used as a fallback. When neither are
    /// provided the adapter uses in-memory defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive `dlv --headless` over JSON-RPC (the default).
    Bridge,
    /// Relay DAP messages to `dlv dap`.
    Proxy {
        /// JSON launch configuration used to start `dlv dap`.
        #[arg(long)]
        launch_config: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install logging and the panic hook before anything can fail.
    let config = load_config(cli.config);
    godap::hardening::init(&config.logging, Arc::new(|message| eprintln!("{message}")));

    match cli.command.unwrap_or(Command::Bridge) {
        Command::Bridge => godap::server::run_stdio(config.adapter).await,
        Command::Proxy { launch_config } => {
            let proxy_config = load_proxy_config(launch_config)?;
            godap::proxy::run_stdio(proxy_config, config.adapter).await
        }
    }
}

fn load_config(cli_path: Option<PathBuf>) -> GodapConfig {
    let Some(path) = GodapConfig::resolve_path(cli_path) else {
        return GodapConfig::default();
    };

    match GodapConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "godap: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            GodapConfig::default()
        }
    }
}

fn load_proxy_config(path: Option<PathBuf>) -> anyhow::Result<ProxyConfig> {
    let Some(path) = path else {
        return Ok(ProxyConfig::default());
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|err| anyhow::anyhow!("failed to read {}: {err}", path.display()))?;
    let config = serde_json::from_str(&text)
        .map_err(|err| anyhow::anyhow!("invalid launch configuration {}: {err}", path.display()))?;
    Ok(config)
}
