use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use chatvisor::bridge::{BridgeHost, OpenAiChatClient};
use chatvisor::logs::{LogAggregator, Severity};
use chatvisor::session::{JsonSessionStore, SessionConfig, SessionRegistry};
use chatvisor::surface::MemorySurfaceFactory;
use chatvisor::{metrics, tracing as telemetry, ControlApi, HostSettings};

#[derive(Parser)]
#[command(name = "chatvisor")]
#[command(about = "Multi-session conversational automation host", long_about = None)]
struct Cli {
    /// JSON settings file
    #[arg(long, env = "CHATVISOR_SETTINGS")]
    settings: Option<PathBuf>,

    /// Overrides the state directory from settings
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Export spans to this OTLP collector
    #[arg(long)]
    otlp: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up every session and run until Ctrl-C (default)
    Run,
    /// Print stored sessions and exit
    List,
    /// Print current metrics in Prometheus text format and exit
    Metrics,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn load_settings(cli: &Cli) -> Result<HostSettings, BoxError> {
    let settings = match &cli.settings {
        Some(path) => HostSettings::load(path)?,
        None => HostSettings::default(),
    };
    let mut settings = settings.apply_env()?;
    if let Some(dir) = &cli.state_dir {
        settings.state_dir = dir.clone();
    }
    if let Some(endpoint) = &cli.otlp {
        settings.otlp_endpoint = Some(endpoint.clone());
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    match settings.otlp_endpoint.as_deref() {
        Some(endpoint) => telemetry::init_tracing("chatvisor", Some(endpoint), settings.json_logs)?,
        None => telemetry::init_console(settings.json_logs)?,
    }
    metrics::register_metrics();

    let store = Arc::new(JsonSessionStore::new(settings.sessions_dir())?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::List => {
            use chatvisor::session::SessionStore;
            for session in store.get_all_sessions().await? {
                println!(
                    "{}  {:<24} {:?}/{}",
                    session.id, session.name, session.state, session.bot_status
                );
            }
            return Ok(());
        }
        Commands::Metrics => {
            print!("{}", metrics::gather());
            return Ok(());
        }
        Commands::Run => {}
    }

    let default_config = SessionConfig::default();
    let chat = OpenAiChatClient::new().with_fallback_endpoint(settings.ai_endpoint.clone());
    let bridge = Arc::new(BridgeHost::with_timing(
        Arc::new(chat),
        settings.bridge_poll_interval(),
        settings.bridge_timeout(),
    ));
    let logs = Arc::new(LogAggregator::new());
    let factory = Arc::new(MemorySurfaceFactory::new(
        default_config.entry_url.clone(),
        "me",
    ));

    let registry = Arc::new(SessionRegistry::with_parts(
        store,
        factory,
        Arc::clone(&bridge),
        Arc::clone(&logs),
        Default::default(),
        Default::default(),
        default_config,
    ));
    let api = ControlApi::new(Arc::clone(&registry));

    let cancel = CancellationToken::new();
    let bridge_task = Arc::clone(&bridge).spawn(cancel.child_token());

    // Print the viewed session's log stream
    let mut stream = logs.subscribe_viewed();
    let printer_cancel = cancel.child_token();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = printer_cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(tagged) => {
                        let marker = match tagged.entry.severity {
                            Severity::Info => " ",
                            Severity::Success => "+",
                            Severity::Error => "!",
                            Severity::Highlight => "*",
                        };
                        println!(
                            "{} [{}] {} {}",
                            tagged.entry.timestamp.format("%H:%M:%S"),
                            tagged.session_id,
                            marker,
                            tagged.entry.message
                        );
                    }
                    None => break,
                },
            }
        }
    });

    let sessions = registry.bootstrap().await?;
    tracing::info!(
        sessions = sessions.len(),
        state_dir = %settings.state_dir.display(),
        "chatvisor running (Ctrl-C to exit)"
    );
    for summary in api.list_sessions().await? {
        tracing::info!(
            session_id = %summary.id,
            name = %summary.name,
            state = ?summary.state,
            bot = %summary.bot_status,
            "session"
        );
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    registry.shutdown().await;
    cancel.cancel();
    let _ = bridge_task.await;
    let _ = printer.await;

    if settings.otlp_endpoint.is_some() {
        telemetry::shutdown_tracing();
    }
    Ok(())
}
