//! Parley console host.
//!
//! Wires the system microphone and speakers into a `SessionController` backed
//! by the loopback transport, forwards engine events to the log, and drives
//! the session from stdin commands until `quit` or Ctrl-C.

mod console;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use parley_core::{
    list_input_devices, list_output_devices, CpalMicrophone, CpalOutputDevice, EchoTransport,
    SessionController,
};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use console::{parse_command, Command, HELP};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("parley_core=info,parley_app=info")
            }),
        )
        .init();

    info!("Parley starting");

    let settings_path = default_settings_path();
    let mut app_settings = load_settings(&settings_path);
    info!(
        path = %settings_path.display(),
        source = app_settings.source_language.as_str(),
        target = app_settings.target_language.as_str(),
        frame_samples = app_settings.frame_samples,
        "settings loaded"
    );

    let engine_config = app_settings.engine_config();
    let controller = Arc::new(SessionController::new(
        engine_config.clone(),
        Arc::new(CpalMicrophone::new(app_settings.preferred_input_device.clone())),
        Arc::new(CpalOutputDevice::new(app_settings.preferred_output_device.clone())),
        Arc::new(EchoTransport::new(engine_config.output_sample_rate)),
    ));
    controller.set_muted(app_settings.start_muted);

    spawn_event_forwarders(&controller);

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        };
        // EOF
        let Some(line) = line else { break };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };

        match command {
            Command::Start => {
                if controller.state().is_active() {
                    println!("replacing the current session");
                }
                if let Err(e) = controller.start(app_settings.session_config()).await {
                    println!("start failed: {e}");
                }
            }
            Command::Stop => controller.stop(),
            Command::Mute => controller.set_muted(true),
            Command::Unmute => controller.set_muted(false),
            Command::Status => print_status(&controller),
            Command::Devices => print_devices(),
            Command::Save => {
                app_settings.start_muted = controller.is_muted();
                persist(&settings_path, &app_settings);
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }

    controller.stop();
    info!("Parley exiting");
    Ok(())
}

fn persist(path: &std::path::Path, settings: &AppSettings) {
    match save_settings(path, settings) {
        Ok(()) => println!("settings saved to {}", path.display()),
        Err(e) => warn!("failed to save settings: {e}"),
    }
}

fn print_status(controller: &SessionController) {
    let capture = controller.pipeline_diagnostics_snapshot();
    let playback = controller.playback_diagnostics_snapshot();
    println!(
        "state={:?} producing={} muted={}",
        controller.state(),
        controller.is_producing(),
        controller.is_muted()
    );
    println!(
        "capture: frames captured={} sent={} muted={} dropped(not open)={} send failures={}",
        capture.frames_captured,
        capture.frames_sent,
        capture.frames_muted,
        capture.frames_dropped_not_open,
        capture.send_failures
    );
    println!(
        "playback: chunks admitted={} completed={} flushed={} malformed={} interrupts={}",
        playback.chunks_admitted,
        playback.chunks_completed,
        playback.chunks_flushed,
        playback.chunks_malformed,
        playback.interrupts
    );
    if let Some(reason) = controller.last_error() {
        println!("last error: {reason}");
    }
}

fn print_devices() {
    for device in list_input_devices().into_iter().chain(list_output_devices()) {
        println!(
            "{:?}\t{}{}{}",
            device.direction,
            device.name,
            if device.is_default { " [default]" } else { "" },
            if device.is_recommended { " [recommended]" } else { "" },
        );
    }
}

/// Log every engine event as JSON, one task per subscription.
fn spawn_event_forwarders(controller: &Arc<SessionController>) {
    let mut state_rx = controller.subscribe_state();
    tokio::spawn(async move {
        loop {
            match state_rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "parley_app::events", "state {json}"),
                    Err(e) => warn!("serialize state event: {e}"),
                },
                Err(RecvError::Lagged(n)) => warn!("state receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut activity_rx = controller.subscribe_activity();
    tokio::spawn(async move {
        loop {
            match activity_rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "parley_app::events", "activity {json}"),
                    Err(e) => warn!("serialize activity event: {e}"),
                },
                Err(RecvError::Lagged(n)) => warn!("activity receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut diagnostics_rx = controller.subscribe_diagnostics();
    tokio::spawn(async move {
        loop {
            match diagnostics_rx.recv().await {
                Ok(event) => warn!(
                    seq = event.seq,
                    bytes = event.bytes,
                    "dropped chunk: {}",
                    event.reason
                ),
                Err(RecvError::Lagged(n)) => warn!("diagnostics receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
