use std::time::Duration;

use clap::Parser;
use colored::Colorize;

mod bridge;

use bridge::Credentials;

/// gatekeeper-bridge - stdio-to-HTTPS bridge for the gatekeeper MCP gateway
#[derive(Parser)]
#[command(name = "gatekeeper-bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Remote MCP endpoint, e.g. https://gateway.example.com/mcp
    #[arg(long, env = "GATEWAY_URL")]
    endpoint: String,

    /// Per-request timeout against the remote endpoint, in seconds.
    #[arg(long, env = "GATEWAY_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,

    /// Log level. Header and body content are never emitted at any level.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let creds = Credentials::from_env()?;
    let client = bridge::build_client(Duration::from_secs(cli.timeout_secs))?;

    tracing::info!(endpoint = %cli.endpoint, "bridge started, reading stdin");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    bridge::run(client, cli.endpoint, creds, stdin, stdout).await?;

    tracing::info!("stdin closed, bridge exiting");
    Ok(())
}
