//! Operator CLI for the agent runtime
//!
//! `check-config` validates a runtime configuration and prints it back;
//! `simulate` runs one session turn against a local echo model and prints
//! every turn event as a JSON line.

use agent_runtime::{
    AgentProfile, AgentServices, ChatMessage, ChatProvider, ChatResponse, HashingEmbedder,
    MessageTarget, RuntimeConfig, Session,
};
use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-runtime")]
#[command(about = "Inspect and exercise agent runtime configurations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print it
    CheckConfig {
        /// Path to the TOML configuration
        path: PathBuf,
    },

    /// Send one message through a session backed by an echo model
    Simulate {
        /// Path to the TOML configuration (a single default agent if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only send to this agent
        #[arg(short, long)]
        agent: Option<String>,

        /// Seconds to wait for every agent to finish
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Message content
        message: String,
    },
}

/// Replies with the question it was asked
struct EchoProvider;

#[async_trait]
impl ChatProvider for EchoProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> agent_runtime::Result<ChatResponse> {
        let question = messages
            .last()
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        Ok(ChatResponse::text(format!("echo: {}", question)))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if config.agents.is_empty() {
        config.agents.push(AgentProfile::new("echo", "Echo"));
    }
    Ok(config)
}

fn check_config(path: &PathBuf) -> anyhow::Result<()> {
    let config = RuntimeConfig::from_file(path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    println!("✓ {} is valid ({} agent(s))", path.display(), config.agents.len());
    println!();
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn simulate(
    config: Option<PathBuf>,
    agent: Option<String>,
    timeout: u64,
    message: String,
) -> anyhow::Result<()> {
    let config = load_config(config.as_ref())?;
    let services = AgentServices::new(Arc::new(EchoProvider))
        .with_embedder(Arc::new(HashingEmbedder::default()));
    let session = Session::new(&config, services)?;
    session.start()?;

    let mut responses = session.subscribe();
    let target = match agent {
        Some(id) => MessageTarget::Agent(id),
        None => MessageTarget::All,
    };
    let turn = session.send_user_message(&message, target)?;
    info!("Turn {} sent to {} agent(s)", turn.id, turn.dispatched.len());

    let mut waiting: HashSet<_> = turn.dispatched.iter().map(|d| d.message_id).collect();
    let collected = tokio::time::timeout(Duration::from_secs(timeout), async {
        while !waiting.is_empty() {
            let response = responses.recv().await?;
            if !waiting.contains(&response.message_id) {
                continue;
            }
            println!("{}", serde_json::to_string(&response)?);
            if response.event.is_terminal() {
                waiting.remove(&response.message_id);
            }
        }
        anyhow::Ok(())
    })
    .await;

    session.shutdown();
    match collected {
        Ok(result) => result,
        Err(_) => anyhow::bail!("Timed out after {}s waiting for agents", timeout),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "agent_runtime={}",
            level.as_str().to_lowercase()
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("agent-runtime v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::CheckConfig { path } => check_config(&path),
        Commands::Simulate {
            config,
            agent,
            timeout,
            message,
        } => simulate(config, agent, timeout, message).await,
    }
}
