//! `rosiwit mcp` - Inspect and edit the MCP server registry.

use std::path::Path;

use rosiwit_config::{AppConfig, McpRegistryFile};
use rosiwit_mcp::{ClientRegistry, ServerStatus};

/// Connect to every enabled server, print one line each plus the ratio.
pub async fn status() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let path = config.mcp.registry_path();
    let file = McpRegistryFile::load_from(&path);

    println!("MCP Servers ({})", path.display());
    println!("===========");

    let registry = ClientRegistry::from_config(&file, &config.mcp);
    let connectivity = registry.initialize().await;

    for status in registry.status().await {
        println!("  {}", status_line(&status));
    }
    for server in file.descriptors().iter().filter(|d| d.disabled) {
        println!("  -  {} [{}] disabled", server.name, server.kind());
    }

    println!();
    println!("  Connected: {connectivity}");
    registry.shutdown().await;
    Ok(())
}

/// Print the aggregated tool catalog of connected servers.
pub async fn tools() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let file = McpRegistryFile::load_from(&config.mcp.registry_path());

    let registry = ClientRegistry::from_config(&file, &config.mcp);
    registry.initialize().await;

    let tools = registry.get_all_tools().await;
    if tools.is_empty() {
        println!("No tools available.");
    }
    for tool in &tools {
        match &tool.description {
            Some(description) => println!("  {:<28} {description}", tool.name),
            None => println!("  {}", tool.name),
        }
    }

    registry.shutdown().await;
    Ok(())
}

/// Flip a server's `disabled` flag and save the registry file.
pub fn set_enabled(name: &str, enabled: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let path = config.mcp.registry_path();
    let mut file = McpRegistryFile::load_from(&path);

    file.set_disabled(name, !enabled)?;
    file.save_to(&path)?;

    let state = if enabled { "enabled" } else { "disabled" };
    println!("Server '{name}' {state} ({})", path.display());
    Ok(())
}

/// Write the registry file to `target`, or print it when no target is given.
pub fn export(target: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let file = McpRegistryFile::load_from(&config.mcp.registry_path());

    match target {
        Some(path) => {
            file.save_to(path)?;
            println!("Exported {} servers to {}", file.servers.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&file)?),
    }
    Ok(())
}

fn status_line(status: &ServerStatus) -> String {
    let marker = if status.connected { "ok" } else { "!!" };
    let mut line = format!("{marker} {} [{}]", status.name, status.transport);
    if status.connected {
        line.push_str(&format!(" {} tools", status.tools));
    }
    if let Some(error) = &status.error {
        line.push_str(&format!(" error: {error}"));
    }
    line
}
