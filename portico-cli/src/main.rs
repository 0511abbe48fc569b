//! Portico unified CLI
//!
//! Authenticate once, then expose a local port on your public domains.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "portico",
    author,
    version,
    about = "A secure request tunneling tool",
    long_about = "Portico keeps an outbound tunnel to your ingress server and relays\n\
                  public HTTP traffic to a service on this machine, with a local\n\
                  inspector for captured requests.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save the authentication token
    Auth(commands::auth::AuthArgs),

    /// Start a public tunnel to a local port
    Start(commands::start::StartArgs),
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so the dashboard owns stdout
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Auth(args) => commands::auth::run(args),
        Commands::Start(args) => commands::start::run(args).await,
    }
}
