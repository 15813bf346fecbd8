//! Grantwell CLI: the main entry point.
//!
//! Commands:
//! - `serve`  : Start the HTTP gateway
//! - `chat`   : Run one turn against an agent and print its push events
//! - `agents` : List agent types and their tools
//! - `config` : Show the effective configuration or its path

use clap::{Parser, Subcommand};
use grantwell_core::AgentType;

mod commands;

#[derive(Parser)]
#[command(
    name = "grantwell",
    about = "Grantwell: grant-writing assistants with tools and memory",
    version,
    author
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
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message to an agent
    Chat {
        /// Agent type, e.g. grant-cards
        #[arg(short, long)]
        agent: AgentType,

        /// The message to send
        #[arg(short, long)]
        message: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Caller identity recorded on new conversations
        #[arg(long, default_value = "cli")]
        user: String,

        /// Print raw push events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List agent types and the tools each may call
    Agents,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Chat {
            agent,
            message,
            conversation,
            user,
            json,
        } => {
            commands::chat::run(commands::chat::ChatArgs {
                agent,
                message,
                conversation,
                user,
                json,
            })
            .await?
        }
        Commands::Agents => commands::agents::run(),
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show()?,
            ConfigAction::Path => commands::config_cmd::path(),
        },
    }

    Ok(())
}
