//! `rosiwit agent` - Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use rosiwit_agent::{AgentLoop, AgentStreamEvent, ContextWindow, PromptSources, SystemPrompt};
use rosiwit_config::{AppConfig, McpRegistryFile};
use rosiwit_core::event::EventBus;
use rosiwit_core::message::Message;
use rosiwit_mcp::ClientRegistry;
use rosiwit_providers::OpenAiCompatProvider;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub async fn run(message: Option<String>, task: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    // Check for API key early - give a clear error
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    ROSIWIT_API_KEY=sk-...");
        eprintln!("    OPENAI_API_KEY=sk-...");
        eprintln!();
        eprintln!("  Or add `api_key` to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider = Arc::new(OpenAiCompatProvider::from_config(&config)?);
    let event_bus = Arc::new(EventBus::default());

    // --- MCP servers ---
    let registry_path = config.mcp.registry_path();
    let registry_file = McpRegistryFile::load_from(&registry_path);
    let registry = Arc::new(
        ClientRegistry::from_config(&registry_file, &config.mcp).with_event_bus(Arc::clone(&event_bus)),
    );
    let connectivity = registry.initialize().await;
    let tool_count = registry.get_all_tools().await.len();

    // --- Context ---
    let prompt = SystemPrompt::load(&PromptSources::from(&config.identity), task.as_deref());
    let mut context = ContextWindow::from_config(&config.context).with_event_bus(Arc::clone(&event_bus));
    context.add_turn(Message::system(&prompt.text))?;

    let agent = AgentLoop::from_config(provider, Arc::clone(&registry), &config, event_bus);

    if let Some(msg) = message {
        // Single message mode
        let outcome = run_turn(&agent, &mut context, &msg).await;
        registry.shutdown().await;
        return outcome;
    }

    // Interactive mode
    println!();
    println!("  Rosiwit Agent — Interactive Mode");
    println!();
    println!("  Model:     {}", config.model);
    println!("  Servers:   {connectivity} connected");
    println!("  Tools:     {tool_count}");
    println!("  Prompt:    {} files loaded", prompt.loaded_files.len());
    println!();
    println!("  Type your message and press Enter.");
    println!("  /stats shows the context window, /clear resets it.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input {
            "" => continue,
            "exit" | "quit" => break,
            "/stats" => {
                println!("  {}", context.summary());
                continue;
            }
            "/clear" => {
                context.clear()?;
                println!("  Context cleared.");
                continue;
            }
            _ => {}
        }

        if let Err(e) = run_turn(&agent, &mut context, input).await {
            eprintln!("  [Error] {e}");
        }
        println!();
    }

    registry.shutdown().await;
    println!();
    println!("  Goodbye!");
    println!();

    Ok(())
}

/// Send one user message and print the streamed reply.
async fn run_turn(
    agent: &AgentLoop,
    context: &mut ContextWindow,
    input: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    context.add_turn(Message::user(input))?;

    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentStreamEvent::Chunk { content } => {
                    let _ = write!(stdout, "{content}");
                    let _ = stdout.flush();
                }
                AgentStreamEvent::ToolCall { name, .. } => {
                    eprintln!("\n  [tool] {name}");
                }
                AgentStreamEvent::ToolResult { name, success: false, output, .. } => {
                    eprintln!("  [tool] {name} failed: {output}");
                }
                AgentStreamEvent::ToolResult { .. } => {}
                AgentStreamEvent::Done { .. } => {
                    let _ = writeln!(stdout);
                }
                AgentStreamEvent::Error { message } => {
                    eprintln!("\n  [stream error] {message}");
                }
            }
        }
    });

    let result = agent.process(context, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;

    result?;
    Ok(())
}
