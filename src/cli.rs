//! Command-line interface

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "lingua-relay")]
#[command(about = "Real-time bilingual voice-translation relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve {
        /// Listen host override
        #[arg(long)]
        host: Option<String>,
        /// Listen port override
        #[arg(long)]
        port: Option<u16>,
        /// Explicit config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration (secrets redacted)
    Config {
        /// Explicit config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
        config: None,
    }) {
        Command::Serve { host, port, config } => {
            let mut config = load_config(config)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            crate::server::start(config).await
        }
        Command::Config { config } => {
            let mut config = load_config(config)?;
            config.upstream.api_key = redact(&config.upstream.api_key);
            config.carrier.auth_token = redact(&config.carrier.auth_token);
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        format!("{}…", secret.chars().take(4).collect::<String>())
    }
}
