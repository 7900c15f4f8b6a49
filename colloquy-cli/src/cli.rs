use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "colloquy",
    version,
    about = "Run an autonomous conversation between two AI providers"
)]
pub struct Cli {
    /// First provider (claude, chatgpt, gemini, grok, perplexity).
    #[arg(long)]
    pub agent1: Option<String>,

    /// Second provider.
    #[arg(long)]
    pub agent2: Option<String>,

    /// Model override for the first agent.
    #[arg(long)]
    pub model1: Option<String>,

    /// Model override for the second agent.
    #[arg(long)]
    pub model2: Option<String>,

    /// Conversation topic.
    #[arg(long)]
    pub topic: Option<String>,

    /// Maximum turns per agent.
    #[arg(long)]
    pub turns: Option<u32>,

    /// Transcript location: a SQLite file path or a postgres:// URL.
    /// Defaults to a file under DATA_DIR.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Skip the confirmation prompt.
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// List configured and unconfigured providers, then exit.
    #[arg(long)]
    pub list: bool,
}
