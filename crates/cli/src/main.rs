//! Rosiwit CLI - the main entry point.
//!
//! Commands:
//! - `agent`        - Interactive chat or single-message mode
//! - `mcp status`   - Connect to every enabled server and report
//! - `mcp tools`    - List the aggregated tool catalog
//! - `mcp enable`   - Re-enable a server in the registry file
//! - `mcp disable`  - Disable a server in the registry file
//! - `mcp export`   - Write the registry file elsewhere (or to stdout)

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "rosiwit",
    about = "Rosiwit — MCP-bridged AI agent runtime",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the AI agent
    Agent {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Task description appended to the system prompt
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Manage MCP servers
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
}

#[derive(Subcommand)]
enum McpCommands {
    /// Connect to every enabled server and show the result
    Status,

    /// List tools offered by connected servers
    Tools,

    /// Enable a server
    Enable { name: String },

    /// Disable a server
    Disable { name: String },

    /// Export the registry file to a path, or print it
    Export { path: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Agent { message, task } => commands::agent::run(message, task).await?,
        Commands::Mcp { command } => match command {
            McpCommands::Status => commands::mcp::status().await?,
            McpCommands::Tools => commands::mcp::tools().await?,
            McpCommands::Enable { name } => commands::mcp::set_enabled(&name, true)?,
            McpCommands::Disable { name } => commands::mcp::set_enabled(&name, false)?,
            McpCommands::Export { path } => commands::mcp::export(path.as_deref())?,
        },
    }

    Ok(())
}
