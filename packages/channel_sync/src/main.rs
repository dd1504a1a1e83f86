use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod cli;

#[derive(Parser)]
#[command(name = "chatsync")]
#[command(about = "Follow and post to a chat channel over the live sync core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./chatsync.toml)
    #[arg(long, global = true, default_value = "chatsync.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a channel live and send stdin lines to it
    Tail(TailArgs),

    /// Print the effective configuration (defaults, file and env merged) as TOML
    Config,
}

#[derive(Parser)]
pub(crate) struct TailArgs {
    /// Channel to mount
    pub channel: String,

    /// Author id attached to optimistic sends
    #[arg(long, default_value = "local")]
    pub author_id: String,

    /// Display name attached to optimistic sends
    #[arg(long, default_value = "me")]
    pub author_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "channel_sync=debug,chatsync=debug,info"
    } else {
        "channel_sync=info,chatsync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Tail(args) => cli::tail_command(&cli.config, args).await,
        Commands::Config => cli::config_command(&cli.config),
    }
}
