//! Manifold MCP - MCP server runtime
//!
//! Serves registered MCP capabilities over the streamable HTTP
//! transport or stdio, with session management, resumable SSE
//! streaming, a middleware pipeline, and pluggable authentication.

use clap::{Parser, Subcommand};
use manifold_mcp::transport::{HttpStreamTransport, StdioTransport, Transport};
use manifold_mcp::{config, logging, Config, McpServer, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "manifold-mcp")]
#[command(about = "MCP server transport and session runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "MANIFOLD_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the streamable HTTP transport
    Start {
        /// Server host
        #[arg(long, env = "MANIFOLD_MCP_HOST")]
        host: Option<String>,

        /// Server port
        #[arg(long, env = "MANIFOLD_MCP_PORT")]
        port: Option<u16>,
    },

    /// Serve a single client over stdin/stdout
    Stdio,

    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print a commented configuration template
    Generate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {},
        Err(e) => {
            error!("Fatal: {}", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start { ref host, port } => {
            let mut config = load_config(&cli)?;
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let mut logging_config = config.logging.clone();
            logging_config.level = cli.log_level.clone();
            let _log_guard = logging::init(&logging_config)?;

            info!("Manifold MCP v{} starting", env!("CARGO_PKG_VERSION"));

            let config = Arc::new(config);
            let server = Arc::new(McpServer::new(&config));
            let transport = Transport::HttpStream(HttpStreamTransport::new(server, config));

            // SIGINT/SIGTERM feed the transport's own shutdown
            // channel; run() returns after the drain.
            let shutdown_tx = match &transport {
                Transport::HttpStream(http) => http.shutdown_sender(),
                Transport::Stdio(stdio) => stdio.shutdown_sender(),
            };
            manifold_mcp::daemon::signals::forward_signals(shutdown_tx);

            transport.run().await?;
            info!("Server stopped");
        },

        Commands::Stdio => {
            let config = load_config(&cli)?;

            // Stdout carries the protocol; logs must stay off it.
            let mut logging_config = config.logging.clone();
            logging_config.level = cli.log_level.clone();
            if logging_config.output == "stdout" {
                logging_config.output = "stderr".to_string();
            }
            let _log_guard = logging::init(&logging_config)?;

            info!("Manifold MCP v{} starting (stdio)", env!("CARGO_PKG_VERSION"));

            let server = Arc::new(McpServer::new(&config));
            let transport = Transport::Stdio(StdioTransport::new(server, &config));

            let shutdown_tx = match &transport {
                Transport::HttpStream(http) => http.shutdown_sender(),
                Transport::Stdio(stdio) => stdio.shutdown_sender(),
            };
            manifold_mcp::daemon::signals::forward_signals(shutdown_tx);

            transport.run().await?;
        },

        Commands::Validate {
            config: config_path,
        } => match config::Config::validate_file(&config_path) {
            Ok(()) => {
                println!("Configuration valid");
            },
            Err(e) => {
                eprintln!("Configuration errors found:");
                eprintln!("{}", e);
                std::process::exit(1);
            },
        },

        Commands::Config { action } => match action {
            ConfigCommands::Generate => {
                println!("{}", Config::template());
            },
        },
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::discover_and_load(),
    }
}
