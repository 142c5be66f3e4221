//! CLI entrypoint and subcommand orchestration.

mod approval_prompt;
mod config;
#[cfg(test)]
mod test_support;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use agent::{
    AgentRuntime, AnthropicProvider, ApprovalRendezvous, AutonomyPolicy, ConversationStore,
    InMemoryStore, LlmProvider, OpenAiProvider, OpenRouterProvider, SqliteMemory, ToolRegistry,
    TurnOutcome, TurnStatus,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use proto::{AgentEvent, AutonomyLevel, ConversationId};
use tokio::sync::mpsc;
use tools::{ClockTool, ShellTool, Tool};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::approval_prompt::{SharedInput, respond_from_terminal, shared_stdin};
use crate::config::{Config, ProviderPreset};

/// Top-level command-line arguments for pilot.
#[derive(Parser)]
#[command(name = "pilot")]
#[command(about = "On-device AI agent with human-approved tools", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Enable debug logging to ~/.pilot/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single prompt and exit
    Run {
        /// Message to send to the agent
        #[arg(short = 'e', long)]
        exec: String,
    },
    /// Interactive conversation
    Chat {
        /// Resume an existing conversation by its ID
        #[arg(short = 's', long)]
        session: Option<String>,
    },
    /// Inspect or change per-tool autonomy levels
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Show effective levels for every known tool
    List,
    /// Set a tool's level (auto, ask, deny)
    Set { tool: String, level: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard = init_tracing(&cli.log_level, cli.debug);
    if cli.debug {
        let command = match &cli.command {
            Commands::Run { .. } => "run",
            Commands::Chat { .. } => "chat",
            Commands::Policy { .. } => "policy",
        };
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command,
            log_level = %cli.log_level,
            "========== pilot session start =========="
        );
    }

    let config = Config::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Run { exec } => cmd_run(config, exec).await,
        Commands::Chat { session } => cmd_chat(config, session).await,
        Commands::Policy { command } => match command {
            PolicyCommands::List => cmd_policy_list(&config),
            PolicyCommands::Set { tool, level } => cmd_policy_set(&config, &tool, &level),
        },
    }
}

/// Console logs go to stderr; `--debug` adds a daily-rolling file under
/// `~/.pilot/logs`.
fn init_tracing(
    log_level: &str,
    debug: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    if !debug {
        tracing_subscriber::registry().with(console).init();
        return None;
    }

    let log_dir = config::pilot_home().join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new(
            "debug,hyper_util=info,rustls=info,reqwest=info,sqlx=info",
        ));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

/// Builds an LLM provider instance for the given preset, API key, optional base URL, and model.
fn build_provider(
    preset: ProviderPreset,
    api_key: &str,
    base_url: Option<&str>,
    model: &str,
) -> Arc<dyn LlmProvider> {
    match (preset, base_url) {
        (ProviderPreset::Anthropic, Some(url)) => {
            Arc::new(AnthropicProvider::with_base_url(api_key, url, model))
        }
        (ProviderPreset::Anthropic, None) => Arc::new(AnthropicProvider::new(api_key, model)),
        (ProviderPreset::OpenAi, Some(url)) => {
            Arc::new(OpenAiProvider::with_base_url(api_key, url, model))
        }
        (ProviderPreset::OpenAi, None) => Arc::new(OpenAiProvider::new(api_key, model)),
        (ProviderPreset::OpenRouter, Some(url)) => {
            Arc::new(
                OpenRouterProvider::with_base_url(api_key, url, model)
                    .with_attribution(None, "pilot"),
            )
        }
        (ProviderPreset::OpenRouter, None) => {
            Arc::new(OpenRouterProvider::new(api_key, model).with_attribution(None, "pilot"))
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn ConversationStore>> {
    if config.database.url.is_empty() {
        info!("No database configured; conversations are kept in memory");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let memory = SqliteMemory::open(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("DB error: {e}"))?;
    Ok(Arc::new(memory))
}

fn load_policy(config: &Config) -> anyhow::Result<Arc<AutonomyPolicy>> {
    let policy = AutonomyPolicy::with_defaults(config.autonomy.clone());
    policy
        .load(&config.policy_path())
        .context("failed to load autonomy policy")?;
    Ok(Arc::new(policy))
}

/// Creates a runtime with the built-in tools, configured store, and every
/// provider that has a key. The configured provider is active.
async fn build_runtime(
    config: &Config,
    rendezvous: Arc<ApprovalRendezvous>,
) -> anyhow::Result<Arc<AgentRuntime>> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(ClockTool));
    registry.register(Arc::new(ShellTool::new()));

    let store = open_store(config).await?;
    let policy = load_policy(config)?;

    let active = config.agent.provider;
    let api_key = config.resolve_api_key();
    if api_key.is_empty() {
        warn!(
            "No API key configured. Set PILOT_API_KEY or {}.",
            active.api_key_env()
        );
    }
    let llm = build_provider(
        active,
        &api_key,
        config.agent.effective_base_url(),
        config.agent.effective_model(),
    );

    let runtime = Arc::new(AgentRuntime::new(
        llm,
        registry,
        store,
        policy,
        rendezvous,
        config.runtime_config(),
    ));

    for preset in ProviderPreset::all() {
        if *preset == active {
            continue;
        }
        if let Some(key) = config.vendor_key(*preset) {
            runtime.register_provider(build_provider(*preset, &key, None, preset.default_model()));
            info!(provider = %preset.name(), "Registered additional provider");
        }
    }

    Ok(runtime)
}

/// Persists approvals granted with "always" during the session.
fn save_policy(runtime: &AgentRuntime, config: &Config) {
    if let Err(e) = runtime.policy().save(&config.policy_path()) {
        warn!("Failed to save autonomy policy: {e}");
    }
}

/// Submits one message and prints streamed text and tool activity.
async fn submit_and_print(
    runtime: &AgentRuntime,
    conversation: &ConversationId,
    text: &str,
) -> TurnOutcome {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        let mut printed_text = false;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(delta) => {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                    printed_text = true;
                }
                AgentEvent::ToolCallStarted { tool_name, .. } => {
                    eprintln!("\n[tool] {tool_name} ...");
                }
                AgentEvent::ToolCallFinished {
                    tool_name,
                    is_error,
                    output,
                    ..
                } => eprintln!("{}", format_tool_finished(&tool_name, is_error, &output)),
                AgentEvent::StateChanged { .. } => {}
            }
        }
        if printed_text {
            println!();
        }
    });

    let outcome = runtime.submit_message(conversation, text, Some(tx)).await;
    let _ = printer.await;
    outcome
}

fn format_tool_finished(tool_name: &str, is_error: bool, output: &str) -> String {
    if !is_error {
        return format!("[tool] {tool_name} done");
    }
    let reason: String = output.chars().take(120).collect();
    format!("[tool] {tool_name} failed: {reason}")
}

fn spawn_responder(rendezvous: &Arc<ApprovalRendezvous>, input: &SharedInput) {
    tokio::spawn(respond_from_terminal(
        Arc::clone(rendezvous),
        Arc::clone(input),
    ));
}

async fn cmd_run(config: Config, exec: String) -> anyhow::Result<()> {
    let rendezvous = Arc::new(ApprovalRendezvous::new());
    let runtime = build_runtime(&config, Arc::clone(&rendezvous)).await?;
    spawn_responder(&rendezvous, &shared_stdin());

    let conversation = ConversationId::new();
    eprintln!("{}", format_run_header(&exec));
    let outcome = submit_and_print(&runtime, &conversation, &exec).await;
    save_policy(&runtime, &config);

    outcome.into_result()?;
    Ok(())
}

async fn cmd_chat(config: Config, session: Option<String>) -> anyhow::Result<()> {
    let rendezvous = Arc::new(ApprovalRendezvous::new());
    let runtime = build_runtime(&config, Arc::clone(&rendezvous)).await?;
    let input = shared_stdin();
    spawn_responder(&rendezvous, &input);

    let conversation = session.map(ConversationId::from).unwrap_or_default();
    eprintln!(
        "pilot ({} / {}) conversation {conversation}. Type /quit to exit.",
        runtime.active_provider_name(),
        config.agent.effective_model()
    );

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let line = input.lock().await.next_line().await?;
        let Some(line) = line else { break };
        let text = line.trim();
        match text {
            "" => continue,
            "/quit" | "/exit" => break,
            _ => {}
        }

        let outcome = submit_and_print(&runtime, &conversation, text).await;
        match &outcome.status {
            TurnStatus::Done { .. } => {}
            TurnStatus::Failed(reason) => eprintln!("Error: {reason}"),
        }
    }

    save_policy(&runtime, &config);
    print_goodbye(&conversation, config.agent.effective_model());
    Ok(())
}

fn print_goodbye(conversation: &ConversationId, model: &str) {
    println!();
    println!("  Conversation  {conversation}");
    println!("  Model         {model}");
    println!("  Continue      pilot chat -s {conversation}");
    println!();
}

/// Effective level per tool: explicit entries, then config defaults.
fn policy_table(
    policy: &AutonomyPolicy,
    known_tools: &[String],
) -> BTreeMap<String, (AutonomyLevel, &'static str)> {
    let mut table = BTreeMap::new();
    for tool in known_tools {
        table.insert(tool.clone(), (AutonomyLevel::Ask, "default"));
    }
    for (tool, level) in policy.defaults() {
        table.insert(tool.clone(), (*level, "config"));
    }
    for (tool, level) in policy.snapshot() {
        table.insert(tool, (level, "saved"));
    }
    table
}

fn cmd_policy_list(config: &Config) -> anyhow::Result<()> {
    let policy = load_policy(config)?;
    let known = vec![ClockTool.name().to_string(), ShellTool::new().name().to_string()];
    for (tool, (level, source)) in policy_table(&policy, &known) {
        println!("{tool:<24} {:<5} ({source})", level.to_string());
    }
    Ok(())
}

fn cmd_policy_set(config: &Config, tool: &str, level: &str) -> anyhow::Result<()> {
    let level: AutonomyLevel = level.parse()?;
    let policy = load_policy(config)?;
    policy.set_policy(tool, level);
    let path = config.policy_path();
    policy
        .save(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("{tool} -> {level}");
    Ok(())
}

/// Formats run mode header text.
fn format_run_header(exec: &str) -> String {
    format!("Running: {exec}")
}
