use agent_bridge::logging::{LogConfig, init_logging};
use agent_bridge::{
    BridgePreferences, FilePreferencesStore, PreferencesStore, ServerEvent, StartOptions,
    Supervisor,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// Diagnostic console for the agent bridge
///
/// Starts the agent app-server under supervision and streams its events to
/// stdout until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the agent binary (overrides the preferences file)
    #[arg(long, value_name = "PATH")]
    binary: Option<String>,

    /// Working directory for the agent process
    #[arg(long, value_name = "DIR")]
    working_dir: Option<PathBuf>,

    /// Bind host forwarded to the agent as --host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Bind port forwarded to the agent as --port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Preferences file to load launch settings from
    #[arg(long, value_name = "FILE")]
    preferences: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides BRIDGE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Merge CLI arguments over stored preferences
fn resolve_start_options(args: &Args) -> Result<StartOptions, Box<dyn std::error::Error>> {
    let preferences = match &args.preferences {
        Some(path) => FilePreferencesStore::new(path.clone()).load()?,
        None => BridgePreferences::default(),
    };

    let mut options = StartOptions::from(&preferences);
    if let Some(binary) = &args.binary {
        options.binary_path = binary.clone();
    }
    if let Some(dir) = &args.working_dir {
        options.working_directory = Some(dir.clone());
    }
    if let Some(host) = &args.host {
        options.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        options.port = Some(port);
    }

    Ok(options)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let options = resolve_start_options(&args)?;
    if options.binary_path.trim().is_empty() {
        eprintln!("No agent binary configured; pass --binary or a preferences file");
        std::process::exit(1);
    }

    let supervisor = Supervisor::new();
    let mut events = supervisor.subscribe();

    let result = supervisor.start(options).await?;
    info!(
        "Agent app-server ready (user agent: {:?}, binary: {})",
        result.user_agent, result.binary_path
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping agent");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        println!("{}", serde_json::to_string(&event)?);
                        if matches!(event, ServerEvent::Exit { .. }) {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        eprintln!("Event stream lagged, {missed} events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    supervisor.stop().await?;
    info!("Agent bridge shut down");

    Ok(())
}
