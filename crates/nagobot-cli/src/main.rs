use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;
use tracing::info;

use nagobot_config::{config_path, data_dir, load_config, resolve_workspace, Config};
use nagobot_core::agent::{AgentConfig, AgentLoop};
use nagobot_core::bus::MessageBus;
use nagobot_core::cron::{BusJobRunner, CronService};
use nagobot_core::heartbeat::HeartbeatService;
use nagobot_core::llm::{AnthropicProvider, OpenAiProvider, Provider};

#[derive(Parser)]
#[command(name = "nagobot", about = "Personal AI assistant", version)]
struct Cli {
    /// Path to config file (default: ~/.nagobot/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Agent {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Run the gateway: scheduler, heartbeat, and channel dispatch
    Gateway,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config_file = cli.config.unwrap_or_else(config_path);
    let config = load_config(&config_file)?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let workspace = resolve_workspace(&config.agents.defaults.workspace);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;

    match cli.command {
        Commands::Agent { message } => match message {
            Some(msg) => run_single_message(&config, workspace, &msg).await,
            None => run_interactive(&config, workspace).await,
        },
        Commands::Gateway => run_gateway(&config, workspace).await,
    }
}

/// Select a provider adapter from the first configured API key, matching
/// the model name where possible. Missing keys are a fatal startup error.
fn make_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let matched = config.get_provider().ok_or_else(|| {
        anyhow::anyhow!(
            "no LLM provider configured: set an apiKey under providers in {}",
            config_path().display()
        )
    })?;

    let model = config.agents.defaults.model.as_str();
    let api_base = matched.config.api_base.as_deref();
    let provider: Arc<dyn Provider> = match matched.name {
        "anthropic" => Arc::new(AnthropicProvider::new(
            matched.config.api_key(),
            api_base,
            Some(model),
            matched.config.headers(),
        )),
        "openai" => Arc::new(OpenAiProvider::new(
            matched.config.api_key(),
            api_base.or(Some("https://api.openai.com/v1")),
            Some(model),
            matched.config.headers(),
        )),
        "deepseek" => Arc::new(OpenAiProvider::new(
            matched.config.api_key(),
            api_base.or(Some("https://api.deepseek.com/v1")),
            Some(model),
            matched.config.headers(),
        )),
        _ => Arc::new(OpenAiProvider::new(
            matched.config.api_key(),
            api_base,
            Some(model),
            matched.config.headers(),
        )),
    };

    info!("Using {} provider", matched.name);
    Ok(provider)
}

fn build_agent_loop(config: &Config, workspace: PathBuf, bus: Arc<MessageBus>) -> Result<AgentLoop> {
    let provider = make_provider(config)?;
    let defaults = &config.agents.defaults;

    Ok(AgentLoop::new(
        bus,
        provider,
        AgentConfig {
            workspace,
            sessions_dir: data_dir().join("sessions"),
            builtin_skills: None,
            model: defaults.model.clone(),
            max_iterations: defaults.max_tool_iterations as usize,
            memory_window: defaults.memory_window,
            context_limit: defaults.context_limit,
            exec_timeout_secs: config.tools.exec.timeout_secs,
            restrict_to_workspace: config.tools.restrict_to_workspace,
            brave_api_key: config.tools.web.search.api_key.clone(),
        },
    ))
}

async fn run_single_message(config: &Config, workspace: PathBuf, message: &str) -> Result<()> {
    let bus = Arc::new(MessageBus::new());
    let mut agent_loop = build_agent_loop(config, workspace, bus)?;

    let token = CancellationToken::new();
    let response = agent_loop
        .process_direct(message, "cli:default", &token)
        .await?;
    println!("{response}");
    Ok(())
}

async fn run_interactive(config: &Config, workspace: PathBuf) -> Result<()> {
    let bus = Arc::new(MessageBus::new());
    let mut agent_loop = build_agent_loop(config, workspace, bus)?;
    let token = CancellationToken::new();

    let history_path = data_dir().join("cli_history.txt");
    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("nagobot interactive mode (type /help for commands, Ctrl-D to quit)");
    println!();

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if input == "/quit" || input == "/exit" {
                    break;
                }

                match agent_loop
                    .process_direct(input, "cli:interactive", &token)
                    .await
                {
                    Ok(response) => {
                        println!();
                        println!("{response}");
                        println!();
                    }
                    Err(e) => {
                        eprintln!("Error: {e:#}");
                        println!();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

/// Long-running mode: one agent loop consuming the bus, the outbound
/// dispatcher, the cron scheduler, and the heartbeat, all sharing one
/// cancellation token tripped by Ctrl-C.
async fn run_gateway(config: &Config, workspace: PathBuf) -> Result<()> {
    let bus = Arc::new(MessageBus::new());
    let mut agent_loop = build_agent_loop(config, workspace.clone(), bus.clone())?;
    let token = CancellationToken::new();

    let mut tasks = Vec::new();

    // Channel adapters plug in here; each register() subscribes the
    // adapter's send handler on the bus.
    let channels = nagobot_channels::ChannelManager::new(bus.clone());
    channels.start_all().await?;

    {
        let bus = bus.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            bus.dispatch_outbound(token).await;
        }));
    }

    if config.services.cron.enabled {
        let cron = Arc::new(CronService::new(
            data_dir().join("cron").join("jobs.json"),
            Arc::new(BusJobRunner::new(bus.inbound_sender())),
        ));
        agent_loop.attach_cron(cron.clone());
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            cron.run(token).await;
        }));
    }

    if config.services.heartbeat.enabled {
        let heartbeat = HeartbeatService::new(
            workspace,
            bus.inbound_sender(),
            Some(config.services.heartbeat.interval_secs),
        );
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            heartbeat.run(token).await;
        }));
    }

    {
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            agent_loop.run(token).await;
        }));
    }

    info!("Gateway running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    token.cancel();
    channels.stop_all().await;

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
