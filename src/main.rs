//! Standalone runner for the Homegear MQTT client
//!
//! Connects with the settings from a TOML file, publishes every stdin line
//! of the form `topic payload` and logs commands received from the broker.

use clap::{Parser, Subcommand};
use homegear_mqtt::observability::init_default_logging;
use homegear_mqtt::{ClientEvent, IncomingMessage, MqttClient, MqttSettings};
use std::path::{Path, PathBuf};
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const INCOMING_CHANNEL_CAPACITY: usize = 256;

/// MQTT client for the Homegear controller
#[derive(Parser)]
#[command(name = "homegear-mqtt")]
#[command(about = "Publish Homegear state to an MQTT broker and receive commands")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run until interrupted
    Run,
    /// Validate the configuration file
    Config {
        /// Print the effective settings
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let settings = match load_configuration(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(settings).await,
        Commands::Config { show } => handle_config_command(settings, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<MqttSettings, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(MqttSettings::load_from_file(path)?);
    }

    for path_str in ["mqtt.toml", "config/mqtt.toml", "/etc/homegear/mqtt.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(MqttSettings::load_from_file(&path)?);
        }
    }

    Err("no configuration file found, pass one with -c/--config or create mqtt.toml".into())
}

async fn run_client(settings: MqttSettings) -> Result<(), Box<dyn std::error::Error>> {
    let client = MqttClient::new(settings)?;

    let (incoming_tx, mut incoming_rx) =
        mpsc::channel::<IncomingMessage>(INCOMING_CHANNEL_CAPACITY);
    client.set_incoming_sender(incoming_tx);
    let mut events = client.subscribe_events();

    client.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Client running, reading `topic payload` lines from stdin");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => publish_line(&client, &line),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            Some(message) = incoming_rx.recv() => {
                let payload = message.payload_str().unwrap_or("<binary>");
                info!(topic = %message.topic, retain = message.retain, "Command received: {}", payload);
            }
            event = events.recv() => match event {
                Ok(ClientEvent::DeliveryFailed { topic, reason }) => {
                    warn!(%topic, "Delivery failed: {}", reason);
                }
                Ok(ClientEvent::QueueOverflow { dropped }) => {
                    warn!(dropped, "Messages dropped by queue overflow");
                }
                Ok(ClientEvent::StateChanged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Client event receiver lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.stop().await;
    info!(metrics = ?client.metrics(), "Application shutdown complete");
    Ok(())
}

fn publish_line(client: &MqttClient, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match line.split_once(char::is_whitespace) {
        Some((topic, payload)) => client.publish_event(topic, payload.trim_start()),
        None => warn!("Expected `topic payload`, got: {}", line),
    }
}

fn handle_config_command(
    settings: MqttSettings,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings.resolved()?;
    if show {
        let mut printable = settings;
        if printable.password.is_some() {
            printable.password = Some("********".to_string());
        }
        println!("{}", toml::to_string_pretty(&printable)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
