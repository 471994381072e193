//! mcpproxy-tray: the tray-side daemon
//!
//! Launches the core when it is not already running, then drives the tray
//! state machine off the core's SSE stream. The menu renderer consumes
//! the view model; here the model changes are logged, which doubles as a
//! headless mode for testing.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcpproxy_tray::client::{CoreClient, CoreEvent};
use mcpproxy_tray::state::{tray_next_state, TrayEvent, TrayState};
use mcpproxy_tray::ViewModel;

#[derive(Parser)]
#[command(name = "mcpproxy-tray", about = "MCPProxy tray daemon", version)]
struct Cli {
    /// Core API base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    core_url: String,

    /// Command used to launch the core when it is not running
    #[arg(long, default_value = "mcpproxy")]
    core_command: String,

    /// API key for the core (falls back to MCPPROXY_API_KEY)
    #[arg(long)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let api_key = cli.api_key.clone().or_else(|| std::env::var("MCPPROXY_API_KEY").ok());
    let client = CoreClient::new(cli.core_url.clone(), api_key);

    let mut state = TrayState::Initializing;
    let mut core_child: Option<tokio::process::Child> = None;

    // Launch the core if needed
    if client.is_ready().await {
        state = transition(state, TrayEvent::CoreAlreadyRunning);
    } else {
        state = transition(state, TrayEvent::Start);
        match spawn_core(&cli.core_command) {
            Ok(child) => {
                core_child = Some(child);
                state = transition(state, TrayEvent::CoreSpawned);
            }
            Err(e) => {
                warn!(error = %e, "failed to launch core");
                state = transition(state, TrayEvent::CoreExited(1));
            }
        }

        // wait for readiness within the state's budget
        if state == TrayState::WaitingForCore {
            let (attempts, delay) = state.retry_budget();
            let mut ready = false;
            for _ in 0..attempts {
                if let Some(child) = core_child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        state = transition(state, TrayEvent::CoreExited(status.code().unwrap_or(1)));
                        break;
                    }
                }
                if client.is_ready().await {
                    ready = true;
                    break;
                }
                tokio::time::sleep(delay).await;
            }
            if ready {
                state = transition(state, TrayEvent::CoreReady);
            } else if !state.is_error() {
                state = transition(state, TrayEvent::RetriesExhausted);
            }
        }
    }

    if state.is_error() {
        anyhow::bail!("core failed to start: {:?}", state);
    }

    // Connect to the API and run the event loop
    let mut model = ViewModel::new();
    let (tx, mut rx) = mpsc::channel::<CoreEvent>(32);

    state = transition(state, TrayEvent::ApiConnected);
    refresh_model(&client, &mut model).await;

    let pump_client = client.clone();
    let pump_tx = tx.clone();
    tokio::spawn(async move { pump_client.pump_events(pump_tx).await });

    let mut backoff = Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                transition(state, TrayEvent::Shutdown);
                break;
            }
            event = rx.recv() => match event {
                None => break,
                Some(CoreEvent::ServersChanged) => {
                    refresh_model(&client, &mut model).await;
                }
                Some(CoreEvent::Other(name)) => {
                    info!(event = %name, "core event");
                }
                Some(CoreEvent::StreamLost(reason)) => {
                    warn!(reason = %reason, "event stream lost, reconnecting");
                    state = transition(state, TrayEvent::StreamLost);

                    // exponential backoff until the stream is back
                    loop {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                        if client.is_ready().await {
                            break;
                        }
                    }
                    backoff = Duration::from_secs(1);
                    state = transition(state, TrayEvent::ApiConnected);
                    refresh_model(&client, &mut model).await;

                    let pump_client = client.clone();
                    let pump_tx = tx.clone();
                    tokio::spawn(async move { pump_client.pump_events(pump_tx).await });
                }
            }
        }
    }

    if let Some(mut child) = core_child {
        // the tray launched the core; leave it running unless it is ours
        // to stop, which a real tray decides via its quit menu
        let _ = child.start_kill();
    }
    Ok(())
}

fn transition(state: TrayState, event: TrayEvent) -> TrayState {
    match tray_next_state(state, event) {
        Some(next) => {
            info!(from = ?state, to = ?next, "tray state");
            next
        }
        None => state,
    }
}

fn spawn_core(command: &str) -> std::io::Result<tokio::process::Child> {
    tokio::process::Command::new(command)
        .arg("serve")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

async fn refresh_model(client: &CoreClient, model: &mut ViewModel) {
    match client.fetch_servers().await {
        Ok(servers) => {
            model.merge(&servers);
            if !model.dirty.is_empty() {
                info!(
                    connected = model.connected_count(),
                    total = model.len(),
                    changed = ?model.dirty,
                    warnings = ?model.warnings(),
                    "menu model updated"
                );
            }
        }
        Err(e) => warn!(error = %e, "failed to fetch servers"),
    }
}
