//! cmdhub - remote command hub
//!
//! Listens for agents, shows them in connection order, and sends the
//! operator's commands to the selected one. Type `:list` to see positions,
//! `:select N` to pick an agent, `cls` to clear, `:quit` to stop.

use clap::Parser as ClapParser;
use cmdhub::{
    config::{ConfigError, HubConfig},
    console::{ConsoleObserver, OperatorInput},
    dispatch::DispatchOutcome,
    events::{self, EventPump, HubEvent},
    hub::{Hub, HubError},
    protocol::WireMode,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// cmdhub - remote command hub
#[derive(ClapParser, Debug)]
#[command(name = "cmdhub", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "CMDHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on for agents (overrides config)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Maximum number of connected agents (overrides config)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Speak the legacy unframed protocol
    #[arg(long)]
    raw: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Error, Debug)]
pub enum CmdhubError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), CmdhubError> {
    let cli = Cli::parse();
    init_tracing();

    let config = resolve_config(&cli)?;
    let (events_tx, mut pump) = events::channel();
    let hub = Hub::start(config, events_tx).await?;
    tracing::info!(addr = %hub.local_addr(), "cmdhub ready");

    let mut console = ConsoleObserver::new(std::io::stdout(), cli.json);
    let result = run_console(&hub, &mut pump, &mut console).await;

    hub.shutdown().await;
    // Deliver the shutdown disconnects before exiting.
    while let Some(event) = pump.try_recv() {
        console.handle(&event);
    }
    result
}

/// Tracing goes to stderr; stdout belongs to the operator view.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cmdhub=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn resolve_config(cli: &Cli) -> Result<HubConfig, CmdhubError> {
    let mut config = match &cli.config {
        Some(path) => match HubConfig::load(path)? {
            Some(config) => config,
            None => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                HubConfig::default()
            }
        },
        None => HubConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(max) = cli.max_sessions {
        config.max_sessions = max;
    }
    if cli.raw {
        config.wire = WireMode::Raw;
    }
    config.validate()?;
    Ok(config)
}

/// The observer's loop: the only place events are rendered and operator
/// input is handled.
async fn run_console<W: std::io::Write>(
    hub: &Hub,
    pump: &mut EventPump,
    console: &mut ConsoleObserver<W>,
) -> Result<(), CmdhubError> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut selected: Option<usize> = None;

    loop {
        tokio::select! {
            event = pump.recv() => {
                let Some(event) = event else { break };
                if matches!(event, HubEvent::Disconnected { .. }) && selected.take().is_some() {
                    console.handle(&event);
                    console.notice("Agent list changed; selection cleared");
                    continue;
                }
                console.handle(&event);
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match OperatorInput::parse(&line) {
                    Ok(OperatorInput::Empty) => {}
                    Ok(OperatorInput::List) => console.show_sessions(&hub.sessions()),
                    Ok(OperatorInput::Select(position)) => {
                        if position < hub.sessions().len() {
                            selected = Some(position);
                        } else {
                            console.notice(&format!("No agent at position {position}"));
                        }
                    }
                    Ok(OperatorInput::Clear) => console.clear()?,
                    Ok(OperatorInput::Quit) => break,
                    Ok(OperatorInput::Command(command)) => match selected {
                        Some(position) => match hub.dispatch(position, &command).await {
                            DispatchOutcome::Sent | DispatchOutcome::EmptyCommand => {}
                            DispatchOutcome::TooLarge => console.notice("Command too large"),
                            DispatchOutcome::TargetGone | DispatchOutcome::WriteFailed => {
                                console.notice("Command not delivered; agent is gone")
                            }
                        },
                        None => console.notice("Select an agent first (:list, :select N)"),
                    },
                    Err(e) => console.notice(&e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C");
                break;
            }
        }
    }
    Ok(())
}
