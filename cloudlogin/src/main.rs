use anyhow::Result;
use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::Level;

mod commands;

use commands::{CredentialsCommand, LoginCommand};

#[derive(Parser)]
#[command(
    name = "cloudlogin",
    about = "Log in to a secrets server with a cloud workload identity",
    version = env!("CARGO_PKG_VERSION"),
    author = "ktruck"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and print the issued token
    Login(LoginCommand),
    /// Report which source provides credentials for a cloud
    Credentials(CredentialsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };
    let level = Level::from_str(log_level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Login(login_cmd) => commands::login(login_cmd).await?,
        Commands::Credentials(credentials_cmd) => commands::credentials(credentials_cmd).await?,
    }

    Ok(())
}
