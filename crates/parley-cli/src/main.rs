//! Parley CLI - chat with tool-calling models from the command line
//!
//! A thin front end over `parley_core::Engine`: streams replies to stdout,
//! manages stored sessions and edits the tool server registry.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Local;
use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

use parley_core::{ChatEvent, ChatInput, ConfigManager, Engine, Message, Role};

#[derive(Parser)]
#[command(name = "parley")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chat with tool-calling models backed by MCP servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and stream the reply
    Chat {
        /// Session to continue (a new one is created if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Model to use (defaults to the configured model)
        #[arg(short, long)]
        model: Option<String>,

        /// Attach a file as extra context
        #[arg(short, long = "attach")]
        attachments: Vec<PathBuf>,

        /// The message to send
        message: String,
    },

    /// Manage stored sessions
    #[command(subcommand)]
    Sessions(SessionCommands),

    /// Manage tool servers
    #[command(subcommand)]
    Servers(ServerCommands),
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions, newest first
    List,

    /// Print a session's messages
    Show {
        /// Session id
        id: String,
    },

    /// Delete one session
    Delete {
        /// Session id
        id: String,
    },

    /// Delete every session
    Clear,
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Connect to every configured server and show what it offers
    List,

    /// Print the registry document
    Config,

    /// Replace the registry document with the contents of FILE
    Set {
        /// JSON file shaped like {"mcpServers": {...}}
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
    .context("Failed to load configuration")?;
    let config = config_manager.into_config();

    // Logs go to stderr so streamed replies on stdout stay clean
    let default_filter = if cli.verbose {
        "info,parley_core=debug,parley_mcp=debug".to_string()
    } else {
        config.general.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let engine = Engine::open(config).context("Failed to start engine")?;

    let result = match cli.command {
        Commands::Chat {
            session,
            model,
            attachments,
            message,
        } => run_chat(&engine, session, model, attachments, message).await,
        Commands::Sessions(command) => run_sessions(&engine, command).await,
        Commands::Servers(command) => run_servers(&engine, command).await,
    };

    engine.shutdown().await;
    result
}

async fn run_chat(
    engine: &Engine,
    session: Option<String>,
    model: Option<String>,
    attachments: Vec<PathBuf>,
    message: String,
) -> anyhow::Result<()> {
    let session_id = match session {
        Some(id) => id,
        None => {
            let id = engine.new_session().await.context("Failed to create session")?;
            eprintln!("{} {}", style("Session:").dim(), style(&id).cyan());
            id
        }
    };

    let mut input = ChatInput::new(session_id, vec![Message::user(message)]).with_attachments(
        attachments
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
    );
    if let Some(model) = model {
        input = input.with_model(model);
    }

    let mut events = engine.chat(input);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Delta(text) => {
                print!("{}", text);
                stdout.flush().ok();
            }
            ChatEvent::Done(_) => {
                println!();
                return Ok(());
            }
            ChatEvent::Error(message) => {
                println!();
                bail!(message);
            }
        }
    }

    bail!("Chat ended without a reply")
}

async fn run_sessions(engine: &Engine, command: SessionCommands) -> anyhow::Result<()> {
    match command {
        SessionCommands::List => {
            let sessions = engine.list_sessions().await?;
            if sessions.is_empty() {
                println!("{}", style("No sessions").dim());
            }
            for session in sessions {
                let preview = session
                    .messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| truncate(&m.content, 60))
                    .unwrap_or_default();
                println!(
                    "{}  {}  {:>3} msgs  {}",
                    style(&session.session_id).cyan(),
                    session.created_time.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    session.messages.len(),
                    style(preview).dim()
                );
            }
        }
        SessionCommands::Show { id } => {
            let Some(session) = engine.get_session(&id).await? else {
                bail!("No session '{}'", id);
            };
            for message in &session.messages {
                let role = match message.role {
                    Role::User => style("user").bold().blue(),
                    Role::Assistant if message.is_error => style("assistant").bold().red(),
                    Role::Assistant => style("assistant").bold().green(),
                    other => style(other.as_str()).bold().dim(),
                };
                println!("{} {}: {}", style(format!("[{}]", message.time)).dim(), role, message.content);
            }
        }
        SessionCommands::Delete { id } => {
            if engine.delete_session(&id).await? {
                println!("Deleted {}", id);
            } else {
                println!("{}", style(format!("No session '{}'", id)).yellow());
            }
        }
        SessionCommands::Clear => {
            let count = engine.delete_all_sessions().await?;
            println!("Deleted {} session(s)", count);
        }
    }
    Ok(())
}

async fn run_servers(engine: &Engine, command: ServerCommands) -> anyhow::Result<()> {
    match command {
        ServerCommands::List => {
            let servers = engine.list_tool_server_connections().await;
            if servers.is_empty() {
                println!("{}", style("No tool servers configured").dim());
            }
            for server in servers {
                if server.connected {
                    println!(
                        "{} {}  {} tools, {} prompts, {} resources",
                        style("✓").green(),
                        style(&server.id).bold(),
                        server.tools.len(),
                        server.prompts.len(),
                        server.resources.len()
                    );
                    for tool in &server.tools {
                        println!("    {}  {}", style(&tool.name).cyan(), style(truncate(&tool.description, 70)).dim());
                    }
                } else {
                    println!(
                        "{} {}  {}",
                        style("✗").red(),
                        style(&server.id).bold(),
                        style(server.error_message.unwrap_or_default()).red()
                    );
                }
            }
        }
        ServerCommands::Config => {
            println!("{}", engine.tool_server_config_json()?);
        }
        ServerCommands::Set { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            engine.replace_tool_server_config_json(&text).await?;
            let count = engine.tool_server_config().servers.len();
            println!("Registry updated ({} server(s))", count);
        }
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        format!("{}…", line.chars().take(max).collect::<String>())
    } else {
        line.to_string()
    }
}
