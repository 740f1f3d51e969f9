//! toolstream CLI — the main entry point.
//!
//! Commands:
//! - `replay` — Normalize and accumulate one recorded turn, print the blocks
//! - `run`    — Run a full session against a recorded fixture
//! - `config` — Show the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "toolstream",
    about = "toolstream — streaming agent-loop orchestrator",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.toolstream/config.toml
    #[arg(short, long, global = true, env = "TOOLSTREAM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize and accumulate a fixture turn, printing the block list
    Replay {
        /// Fixture file (JSON, see `ScriptedFixture`)
        fixture: PathBuf,

        /// Which turn to replay (0-based)
        #[arg(short, long, default_value_t = 0)]
        turn: usize,

        /// Treat the model as lacking structured tool calling
        #[arg(long)]
        inline: bool,
    },

    /// Run a session against a fixture, printing each event as a JSON line
    Run {
        /// Fixture file (JSON, see `ScriptedFixture`)
        fixture: PathBuf,

        /// The user message that opens the conversation
        #[arg(short, long)]
        message: String,

        /// Treat the model as lacking structured tool calling
        #[arg(long)]
        inline: bool,

        /// Override the tool-call ceiling
        #[arg(long)]
        max_tool_calls: Option<u32>,
    },

    /// Show the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing; logs go to stderr so stdout stays machine-readable
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay { fixture, turn, inline } => commands::replay::run(&fixture, turn, inline)?,
        Commands::Run {
            fixture,
            message,
            inline,
            max_tool_calls,
        } => commands::run::run(config, &fixture, message, inline, max_tool_calls).await?,
        Commands::Config => commands::config_cmd::show(&config)?,
    }

    Ok(())
}
