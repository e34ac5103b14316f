//! Process entry point for the subscription-gated MCP gateway.
//!
//! Loads configuration, wires up [`AppState`], and serves either transport
//! named by `SERVER_MODE`: an HTTP router bound to `SERVER_HOST:SERVER_PORT`,
//! or a line-delimited stdio loop reading `stdin`/writing `stdout`. Both
//! transports share one `AppState`, built once at startup — there is no
//! per-transport bootstrap path.

use anyhow::Context;
use clap::Parser;
use gatekeeper_core::prelude::*;

/// Transport and config-file overrides. Every other setting is read from
/// `config.toml` / the environment per [`Config::load`]; these flags exist
/// only for the handful of knobs an operator wants to flip without editing
/// either.
#[derive(Parser, Debug)]
#[command(name = "gatekeeperd", version, about = "Subscription-gated MCP gateway", long_about = None)]
struct Cli {
    /// Path to a config.toml, bypassing the XDG/system search.
    #[arg(long, env = "GATEKEEPER_CONFIG")]
    config: Option<String>,

    /// Force a transport, overriding `SERVER_MODE` / config.toml.
    #[arg(long, value_enum)]
    mode: Option<CliServerMode>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliServerMode {
    Http,
    Stdio,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).context("failed to load config file")?,
        None => Config::load().context("failed to load configuration")?,
    };

    if let Some(mode) = cli.mode {
        config.service.mode = match mode {
            CliServerMode::Http => ServerMode::Http,
            CliServerMode::Stdio => ServerMode::Stdio,
        };
    }

    init_tracing(&config).context("failed to initialize tracing")?;

    let mode = config.service.mode;
    tracing::info!(?mode, service = %config.service.name, "starting gatekeeper");

    let state = match AppState::bootstrap(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "fatal configuration error during startup");
            std::process::exit(1);
        }
    };

    let result = match mode {
        ServerMode::Http => {
            let app = protocol::http::router(state);
            Server::new(config).serve(app).await
        }
        ServerMode::Stdio => protocol::stdio::run(state).await,
    };

    match result {
        Ok(()) => {
            tracing::info!("clean shutdown");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable downstream error");
            std::process::exit(2);
        }
    }
}
