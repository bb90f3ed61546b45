//! Line-oriented console front end
//!
//! Stands in for the device-selection and display pages: commands are read
//! from stdin and every event from the Bluetooth side is printed.

use crate::domain::models::{
    AppEvent, BluetoothCommand, ConnectionStatus, MessageSeverity, SelectedDevice,
};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::transport::GattBackend;
use crate::infrastructure::bluetooth::DroService;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const HELP: &str = "\
Commands:
  select <device-id> [name]  choose the DRO to talk to
  connect                    connect and subscribe for position updates
  set <value>                preset the DRO position
  disconnect                 close the connection
  quit                       disconnect and exit";

/// One parsed line of console input
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Command(BluetoothCommand),
    Help,
    Quit,
}

/// Parse a console line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<ConsoleInput>, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let input = match word.to_lowercase().as_str() {
        "" => return Ok(None),
        "select" => {
            let (id, name) = match rest.split_once(char::is_whitespace) {
                Some((id, name)) => (id, name.trim()),
                None => (rest, ""),
            };
            if id.is_empty() {
                return Err("usage: select <device-id> [name]".to_string());
            }
            ConsoleInput::Command(BluetoothCommand::SelectDevice(SelectedDevice {
                id: id.to_string(),
                name: if name.is_empty() {
                    id.to_string()
                } else {
                    name.to_string()
                },
            }))
        }
        "connect" => ConsoleInput::Command(BluetoothCommand::Connect),
        // validation happens in the write pipeline so its messages reach the user
        "set" => ConsoleInput::Command(BluetoothCommand::SetPosition(rest.to_string())),
        "disconnect" => ConsoleInput::Command(BluetoothCommand::Disconnect),
        "help" | "?" => ConsoleInput::Help,
        "quit" | "exit" => ConsoleInput::Quit,
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };

    Ok(Some(input))
}

/// Render an event the way the display page shows it
pub fn render_event(event: &AppEvent) -> String {
    match event {
        AppEvent::PositionSample(value) => format!("Position: {:>8.3}", value),
        AppEvent::ConnectionStatus(ConnectionStatus::Connecting) => "Connecting...".to_string(),
        AppEvent::ConnectionStatus(ConnectionStatus::Connected) => "Connected".to_string(),
        AppEvent::ConnectionStatus(ConnectionStatus::Disconnected) => "Disconnected".to_string(),
        AppEvent::LogMessage(msg) => match msg.severity {
            MessageSeverity::Info => msg.message.clone(),
            MessageSeverity::Error => format!("Error: {}", msg.message),
        },
    }
}

/// Drive the DRO service from a command channel until it closes
pub async fn run_bluetooth<B: GattBackend>(
    service: Arc<DroService<B>>,
    mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            BluetoothCommand::SelectDevice(device) => {
                service.select_device(&device.id, &device.name);
            }
            BluetoothCommand::Connect => {
                if let Err(e) = service.request_connect().await {
                    debug!("Connect request finished with: {}", e);
                }
            }
            BluetoothCommand::SetPosition(text) => {
                if let Err(e) = service.request_set_position(&text).await {
                    debug!("Set position request finished with: {}", e);
                }
            }
            BluetoothCommand::Disconnect => {
                service.request_disconnect().await;
            }
        }
    }

    // Channel closed: the front end is gone
    service.request_disconnect().await;
}

/// Run the console front end against `backend` until `quit` or end of input
pub async fn run<B: GattBackend>(backend: Arc<B>, mut settings: SettingsService) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (bt_cmd_tx, bt_cmd_rx) = mpsc::unbounded_channel();

    let config = ConnectionConfig::from(settings.get());
    let service = Arc::new(DroService::new(backend, config, event_tx));

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("{}", render_event(&event));
        }
    });
    let bluetooth = tokio::spawn(run_bluetooth(service, bt_cmd_rx));

    println!("{}", HELP);
    if let Some(device) = settings.get().last_device.clone() {
        println!("Selected device: {}", device.name);
        let _ = bt_cmd_tx.send(BluetoothCommand::SelectDevice(device));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleInput::Help)) => println!("{}", HELP),
            Ok(Some(ConsoleInput::Quit)) => break,
            Ok(Some(ConsoleInput::Command(cmd))) => {
                if let BluetoothCommand::SelectDevice(device) = &cmd {
                    println!("Selected device: {}", device.name);
                    if let Err(e) = settings.remember_device(device.clone()) {
                        error!("Failed to save settings: {}", e);
                    }
                }
                if bt_cmd_tx.send(cmd).is_err() {
                    error!("Bluetooth task stopped unexpectedly");
                    break;
                }
            }
            Err(message) => println!("{}", message),
        }
    }

    info!("Shutting down");
    drop(bt_cmd_tx);
    bluetooth.await?;
    // the service (and its event sender) is gone once the bluetooth task ends
    printer.await?;

    Ok(())
}
