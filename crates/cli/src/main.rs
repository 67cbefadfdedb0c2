mod config_commands;

use std::{path::Path, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    switchboard_channels::{BroadcastPushChannel, InMemoryMessageStore, MessageStore},
    switchboard_config::{Severity, SwitchboardConfig},
    switchboard_directline::DirectLineClient,
    switchboard_gateway::state::AppState,
    switchboard_relay::{Collaborators, Switchboard},
    switchboard_servicenow::ServiceNowClient,
    switchboard_sessions::SqliteMessageStore,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: assistant-to-agent session relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in ./ and ~/.config/switchboard/).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay and its HTTP gateway (default when no subcommand is provided).
    Serve,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Explicit path must load; discovery falls back to defaults.
pub(crate) fn load(path: Option<&Path>) -> anyhow::Result<SwitchboardConfig> {
    match path {
        Some(path) => switchboard_config::load_config(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(switchboard_config::discover_and_load()),
    }
}

async fn open_store(config: &SwitchboardConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
    if config.store.is_memory() {
        info!("using in-memory message store");
        return Ok(Arc::new(InMemoryMessageStore::new()));
    }
    let store = SqliteMessageStore::connect(&config.store.database_url)
        .await
        .context("opening message store")?;
    Ok(Arc::new(store))
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let config = load(cli.config.as_deref())?;

    for d in switchboard_config::validate(&config) {
        match d.severity {
            Severity::Error => anyhow::bail!("invalid config: {}: {}", d.path, d.message),
            Severity::Warning => warn!(path = %d.path, "{}", d.message),
            Severity::Info => {},
        }
    }

    let call_timeout = config.relay.call_timeout();
    let assistant = DirectLineClient::new(&config.assistant, call_timeout)?;
    let agent = ServiceNowClient::new(&config.agent, call_timeout)?;
    let push = Arc::new(BroadcastPushChannel::new(config.relay.subscriber_buffer));
    let store = open_store(&config).await?;

    let switchboard = Switchboard::new(&config, Collaborators {
        assistant: Arc::new(assistant),
        agent: Arc::new(agent),
        push: push.clone(),
        store,
    });
    switchboard.spawn_sweeper();

    // Push topics outlive their sessions; drop them on the sweep cadence.
    let sweep_interval = config.relay.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let pruned = push.prune();
            if pruned > 0 {
                info!(pruned, "pruned idle push topics");
            }
        }
    });

    let bind = cli.bind.unwrap_or(config.server.bind);
    let port = cli.port.unwrap_or(config.server.port);
    let state = AppState::new(switchboard, config.server.webhook_secret);
    switchboard_gateway::server::start_gateway(&bind, port, state).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mut cli = Cli::parse();

    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    match cli.command.take() {
        None | Some(Commands::Serve) => serve(cli).await,
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
    }
}
