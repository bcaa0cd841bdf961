use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ble_central_lib::config::AppConfig;
use ble_central_lib::core::bluetooth::{
    BluetoothManager, BluetoothScanner, ConnectionManager, Host, Notification, Phy, Transport,
    WorkflowOutcome,
};
use ble_central_lib::logging;
use clap::Parser;
use log::info;
use tokio::sync::mpsc;

/// Scan for the first advertiser, connect, discover its services and
/// print every notification it sends until it disconnects.
#[derive(Parser, Debug)]
#[command(name = "ble-central", version, about)]
struct Cli {
    /// HCI transport, e.g. tcp-client:localhost:9000
    #[arg(long)]
    transport: Option<String>,

    /// Minimum RSSI in dBm (recorded, not applied)
    #[arg(long, allow_hyphen_values = true)]
    min_rssi: Option<i8>,

    /// Scan passively instead of sending scan requests
    #[arg(long)]
    passive: bool,

    /// Scan interval in milliseconds
    #[arg(long)]
    scan_interval: Option<u32>,

    /// Scan window in milliseconds
    #[arg(long)]
    scan_window: Option<u32>,

    /// Scan only on this PHY (1m or coded); both when omitted
    #[arg(long)]
    phy: Option<Phy>,

    /// Suppress repeated advertisements from the same address
    #[arg(long)]
    filter_duplicates: Option<bool>,

    /// Seconds to wait for the first advertisement
    #[arg(long)]
    scan_timeout: Option<u64>,

    /// Seconds to wait for the connection to be established
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// JSON config file; command line options override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(transport) = &self.transport {
            config.host.transport = transport.clone();
        }
        if self.min_rssi.is_some() {
            config.scan.min_rssi = self.min_rssi;
        }
        if self.passive {
            config.scan.active = false;
        }
        if let Some(interval) = self.scan_interval {
            config.scan.scan_interval_ms = interval;
        }
        if let Some(window) = self.scan_window {
            config.scan.scan_window_ms = window;
        }
        if self.phy.is_some() {
            config.scan.phy = self.phy;
        }
        if let Some(filter) = self.filter_duplicates {
            config.scan.filter_duplicates = filter;
        }
        if let Some(secs) = self.scan_timeout {
            config.workflow.scan_timeout_secs = secs;
        }
        if let Some(secs) = self.connect_timeout {
            config.connection.connect_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref());

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_config(path).await?,
        None => AppConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let transport = Transport::open(&config.host.transport)
        .await
        .with_context(|| format!("Failed to open transport {}", config.host.transport))?;
    let host = Host::new(
        transport,
        Duration::from_secs(config.host.command_timeout_secs),
    );
    host.power_on()
        .await
        .context("Failed to initialize the controller")?;

    let (notification_tx, mut notification_rx) = mpsc::unbounded_channel::<Notification>();
    let printer = tokio::spawn(async move {
        while let Some(notification) = notification_rx.recv().await {
            println!(
                "{} 0x{:04x} {}",
                notification.uuid,
                notification.value_handle,
                hex::encode(&notification.payload)
            );
        }
    });

    let manager = BluetoothManager::new(config.clone()).with_notification_sink(notification_tx);
    let mut scanner = BluetoothScanner::new(host.clone(), manager.advertisement_sink());
    let connections = ConnectionManager::new(host.clone(), config.connection, config.gatt)?;

    let outcome = tokio::select! {
        outcome = manager.run(&mut scanner, &connections) => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            None
        }
    };
    host.close();
    printer.abort();

    match outcome.transpose()? {
        Some(WorkflowOutcome::NoDeviceFound) => println!("no device found"),
        Some(WorkflowOutcome::Disconnected { peer, reason, .. }) => {
            println!("{} disconnected (reason 0x{:02x})", peer, reason)
        }
        None => {}
    }
    Ok(())
}
