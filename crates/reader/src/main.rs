//! usb-card-reader
//!
//! Console host for a vendor-specific USB card reader. Waits for the reader to
//! be plugged in, asks for access, then prints every card read as it arrives.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{SessionBridge, SessionEvent, create_session_bridge, setup_logging};
use reader::config::{self, ReaderConfig};
use reader::display::{ConsoleUi, HELP_TEXT, UserCommand, parse_command};
use reader::permission::{PermissionMode, PolicyBroker};
use reader::session::{SessionManager, spawn_session_manager};
use reader::usb::matcher::{DeviceTarget, validate_topology};
use reader::usb::{HotplugWatcher, RusbHost, UsbHost};
use std::io::{BufRead, Stdout};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-card-reader")]
#[command(author, version, about = "USB card reader console")]
#[command(long_about = "
Talks to a vendor-specific USB card reader exposing a single interrupt IN
endpoint and prints each read as space separated signed bytes.

EXAMPLES:
    # Run with default config
    usb-card-reader

    # Run with custom config
    usb-card-reader --config /path/to/reader.toml

    # List USB devices and whether they would be accepted
    usb-card-reader --list-devices

    # Different reader, access granted up front
    usb-card-reader --vid 0x1234 --pid 0x0001 --permission grant

CONFIGURATION:
    The reader looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-card-reader/reader.toml
    3. /etc/usb-card-reader/reader.toml
    4. Built-in defaults

CONSOLE COMMANDS:
    c  clear display      s  rescan       x  reset session
    y  grant access       n  deny access  q  quit
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Vendor ID of the reader (e.g. 0x08ff)
    #[arg(long, value_name = "VID")]
    vid: Option<String>,

    /// Product ID of the reader (e.g. 0x0009)
    #[arg(long, value_name = "PID")]
    pid: Option<String>,

    /// How access requests are answered (prompt, grant, deny)
    #[arg(long, value_name = "MODE")]
    permission: Option<PermissionMode>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ReaderConfig::default();
        let path = ReaderConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        ReaderConfig::load_or_default()
    };

    if let Some(vid) = args.vid {
        config.device.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.device.product_id = pid;
    }
    if let Some(mode) = args.permission {
        config.permission.mode = mode;
    }
    if let Some(level) = args.log_level {
        config.reader.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.reader.log_level).context("Failed to setup logging")?;

    info!("usb-card-reader v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.reader.log_level);

    let settings = config.session_settings()?;
    let host = RusbHost::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&host, settings.target);
    }

    info!(
        "Looking for {} (permission mode: {:?})",
        settings.target, config.permission.mode
    );

    let (bridge, worker) = create_session_bridge();

    // Hot-plug runs on its own libusb event thread, sharing the host's context
    let hotplug = HotplugWatcher::spawn(host.context().clone(), bridge.event_sender())
        .context("Failed to spawn hot-plug thread")?;

    let broker = PolicyBroker::new(
        config.permission.mode,
        worker.event_tx.clone(),
        worker.ui_tx.clone(),
    );
    let manager = SessionManager::new(
        host,
        broker,
        settings,
        worker.ui_tx.clone(),
        worker.event_tx.clone(),
    );
    let session_handle =
        spawn_session_manager(manager, worker).context("Failed to spawn session manager")?;

    // Pick up a reader that was plugged in before we started
    bridge
        .send_event(SessionEvent::Rescan)
        .await
        .context("Failed to request initial scan")?;

    let result = run_console(bridge.clone()).await;

    info!("Shutting down...");
    if let Err(e) = bridge.send_event(SessionEvent::Shutdown).await {
        error!("Error shutting down session manager: {:#}", e);
    }

    // Join off the runtime; teardown can block for the shutdown grace
    let joined = tokio::task::spawn_blocking(move || session_handle.join()).await;
    if !matches!(joined, Ok(Ok(()))) {
        error!("Session manager thread panicked");
    }

    if let Some(hotplug) = hotplug {
        hotplug.stop();
    }

    info!("Shutdown complete");
    result
}

/// Print every attached device and what the topology check thinks of it
fn list_devices_mode(host: &RusbHost, target: DeviceTarget) -> Result<()> {
    let devices = host.enumerate().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!("  {}", device);
        println!("      Interfaces: {}", device.interface_count());

        if target.matches(&device) {
            match validate_topology(&device) {
                Ok(endpoint) => println!(
                    "      Card reader: usable (endpoint {:#04x}, {} byte packets)",
                    endpoint.address, endpoint.max_packet_size
                ),
                Err(e) => println!("      Card reader: rejected ({})", e),
            }
        }
        println!();
    }

    Ok(())
}

/// Drive the console until the user quits or Ctrl+C
async fn run_console(bridge: SessionBridge) -> Result<()> {
    let mut ui: ConsoleUi<Stdout> = ConsoleUi::new(std::io::stdout());
    let lines = spawn_console_input().context("Failed to spawn console input thread")?;

    ui.print(HELP_TEXT);
    let status = ui.status().to_string();
    ui.print(&status);

    loop {
        tokio::select! {
            event = bridge.recv_ui_event() => {
                let event = event.map_err(|e| anyhow!("UI queue closed: {}", e))?;
                event.dispatch(&mut ui);
            }
            line = lines.recv() => {
                let Ok(line) = line else {
                    info!("Console input closed");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Some(UserCommand::Quit) => return Ok(()),
                    Some(command) => handle_command(command, &mut ui, &bridge).await?,
                    None => ui.print(HELP_TEXT),
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
        }
    }
}

/// Read stdin lines on a plain thread
///
/// The thread is never joined; a blocked read must not hold up shutdown.
fn spawn_console_input() -> std::io::Result<async_channel::Receiver<String>> {
    let (tx, rx) = async_channel::bounded(16);
    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send_blocking(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

async fn handle_command(
    command: UserCommand,
    ui: &mut ConsoleUi<Stdout>,
    bridge: &SessionBridge,
) -> Result<()> {
    match command {
        UserCommand::ClearDisplay => ui.reset_display(),
        UserCommand::Rescan => bridge.send_event(SessionEvent::Rescan).await?,
        UserCommand::Reset => bridge.send_event(SessionEvent::Reset).await?,
        UserCommand::Answer(granted) => match ui.take_pending_permission() {
            Some(device) => {
                bridge
                    .send_event(SessionEvent::PermissionResult { device, granted })
                    .await?
            }
            None => warn!("No permission request is pending"),
        },
        UserCommand::Help => ui.print(HELP_TEXT),
        UserCommand::Quit => {}
    }
    Ok(())
}
