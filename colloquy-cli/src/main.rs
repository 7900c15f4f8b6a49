mod cli;
mod telemetry;

use std::io::Write;
use std::sync::Arc;

use clap::Parser;

use colloquy_agent::{AgentSpec, ConversationMetrics, ConversationRunner, RunReport, RunnerError};
use colloquy_core::config::ConversationConfig;
use colloquy_core::error::ConfigError;
use colloquy_providers::{build_client, detect_configured, registered_providers, resolve_model};
use colloquy_store::open_store;

use cli::Cli;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Credentials(String),

    #[error("{0}")]
    StoreUnhealthy(String),

    #[error("{0}")]
    Fatal(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Credentials(_) => 4,
            Self::StoreUnhealthy(_) => 5,
            Self::Fatal(_) => 1,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        match value {
            ConfigError::UnknownProvider(name) => Self::Usage(format!("unknown provider: {name}")),
            ConfigError::MissingCredential { provider, env_key } => {
                Self::Credentials(format!("no credential for {provider}: set {env_key}"))
            }
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<RunnerError> for CliError {
    fn from(value: RunnerError) -> Self {
        match value {
            RunnerError::Config(err) => err.into(),
            RunnerError::StoreUnhealthy(detail) => Self::StoreUnhealthy(detail),
            RunnerError::Store(err) => Self::Fatal(err.to_string()),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = ConversationConfig::from_env().map_err(|err| CliError::Config(err.to_string()))?;

    let _telemetry = telemetry::init_telemetry(config.otlp_endpoint.as_deref(), false)
        .map_err(|err| CliError::Fatal(format!("telemetry setup failed: {err}")))?;

    if cli.list {
        print_provider_list();
        return Ok(());
    }

    let agent1 = cli
        .agent1
        .as_deref()
        .ok_or_else(|| CliError::Usage("--agent1 is required".to_string()))?;
    let agent2 = cli
        .agent2
        .as_deref()
        .ok_or_else(|| CliError::Usage("--agent2 is required".to_string()))?;
    if agent1.eq_ignore_ascii_case(agent2) {
        return Err(CliError::Usage(
            "--agent1 and --agent2 must name distinct providers".to_string(),
        ));
    }
    let topic = cli
        .topic
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CliError::Usage("--topic is required and must be non-empty".to_string()))?;

    let mut config = config;
    if let Some(turns) = cli.turns {
        if turns < 1 {
            return Err(CliError::Usage("--turns must be >= 1".to_string()));
        }
        config.max_turns = turns;
    }

    let first = build_client(
        agent1,
        cli.model1.as_deref(),
        None,
        config.temperature,
        u64::from(config.max_tokens),
    )?;
    let second = build_client(
        agent2,
        cli.model2.as_deref(),
        None,
        config.temperature,
        u64::from(config.max_tokens),
    )?;

    let db_location = match &cli.db {
        Some(path) => path.display().to_string(),
        None => match &config.database_url {
            Some(url) => url.clone(),
            None => config.default_db_path().display().to_string(),
        },
    };

    print_settings(&cli, &config, topic, &db_location);
    if !cli.yes && !confirm("Start conversation? (Y/n): ") {
        println!("Cancelled.");
        return Ok(());
    }

    let store = open_store(&db_location, config.max_message_length)
        .await
        .map_err(|err| CliError::StoreUnhealthy(err.to_string()))?;

    let metrics = Arc::new(ConversationMetrics::new());
    let runner = ConversationRunner::new(
        Arc::clone(&store),
        config,
        topic,
        vec![
            AgentSpec::new(agent1, first),
            AgentSpec::new(agent2, second),
        ],
        Arc::clone(&metrics),
    )?;

    // Ctrl-C flags the transcript; every agent observes it at its next
    // terminal check and exits cleanly.
    let cancel_store = Arc::clone(&store);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation_requested");
            let _ = cancel_store.mark_terminated("cancelled").await;
        }
    });

    let report = runner.run().await?;
    print_summary(&report);
    Ok(())
}

fn print_provider_list() {
    let configured = detect_configured();
    println!("CONFIGURED PROVIDERS:");
    for spec in &configured {
        println!("  {} ({})  model: {}", spec.display_name, spec.name, resolve_model(spec, None));
    }
    if configured.is_empty() {
        println!("  (none)");
    }

    let unconfigured: Vec<_> = registered_providers()
        .filter(|spec| !configured.iter().any(|c| c.name == spec.name))
        .collect();
    if !unconfigured.is_empty() {
        println!("UNCONFIGURED PROVIDERS:");
        for spec in unconfigured {
            println!("  {} ({})  set {}", spec.display_name, spec.name, spec.env_key);
        }
    }
}

fn print_settings(cli: &Cli, config: &ConversationConfig, topic: &str, db_location: &str) {
    println!("{}", "=".repeat(72));
    println!("CONVERSATION SETTINGS");
    println!("{}", "=".repeat(72));
    println!(
        "Agent 1 : {} ({})",
        cli.agent1.as_deref().unwrap_or("-"),
        cli.model1.as_deref().unwrap_or("default")
    );
    println!(
        "Agent 2 : {} ({})",
        cli.agent2.as_deref().unwrap_or("-"),
        cli.model2.as_deref().unwrap_or("default")
    );
    println!("Topic   : {topic}");
    println!("Turns   : {} per agent", config.max_turns);
    println!("Store   : {db_location}");
    println!("{}", "=".repeat(72));
}

fn print_summary(report: &RunReport) {
    println!();
    println!("{}", "=".repeat(72));
    println!("CONVERSATION SUMMARY");
    println!("{}", "=".repeat(72));
    println!("Total messages : {}", report.total_turns);
    for (sender, turns) in &report.per_sender_turns {
        println!("  {sender}: {turns}");
    }
    println!("Total tokens   : {}", report.total_tokens);
    println!("Ended          : {}", report.reason);
    println!("{}", "=".repeat(72));
}

fn confirm(prompt: &str) -> bool {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    !answer.trim().eq_ignore_ascii_case("n")
}
