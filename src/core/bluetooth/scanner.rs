use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::core::bluetooth::adv_data;
use crate::core::bluetooth::commands::{CommandSender, HciCommand, ScanPhyParameters};
use crate::core::bluetooth::error::{ConfigError, ControllerError};
use crate::core::bluetooth::hci::{AdvertisingReport, Host};
use crate::core::bluetooth::types::{Address, AdvertisementRecord};

/// Where the scanner delivers advertisement records
pub type AdvertisementSink = mpsc::UnboundedSender<AdvertisementRecord>;

/// The scanning capability the workflow depends on
#[async_trait]
pub trait AdvertisementScanner: Send {
    fn configure(&mut self, config: ScanConfig) -> Result<(), ConfigError>;

    async fn start(&mut self) -> Result<(), ControllerError>;

    /// Safe to call at any time, including when not scanning
    async fn stop(&mut self) -> Result<(), ControllerError>;
}

pub struct BluetoothScanner {
    host: Host,
    config: ScanConfig,
    sink: AdvertisementSink,
    /// Records of the current session, keyed by address
    records: Arc<Mutex<HashMap<Address, AdvertisementRecord>>>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
    /// Whether the running session uses the extended scan commands
    extended: bool,
}

impl BluetoothScanner {
    pub fn new(host: Host, sink: AdvertisementSink) -> Self {
        Self {
            host,
            config: ScanConfig::default(),
            sink,
            records: Arc::new(Mutex::new(HashMap::new())),
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
            extended: false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle.is_some()
    }

    /// Snapshot of the devices seen in the current (or last) session
    pub fn discovered(&self) -> Vec<AdvertisementRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    async fn enable(&self, extended: bool) -> Result<(), ControllerError> {
        let config = &self.config;
        if extended {
            let phys = config
                .phys()
                .into_iter()
                .map(|phy| ScanPhyParameters {
                    phy,
                    active: config.active,
                    interval: config.interval_units(),
                    window: config.window_units(),
                })
                .collect();
            self.host
                .send_command(HciCommand::LeSetExtendedScanParameters { phys })
                .await?;
            self.host
                .send_command(HciCommand::LeSetExtendedScanEnable {
                    enable: true,
                    filter_duplicates: config.filter_duplicates,
                })
                .await?;
        } else {
            self.host
                .send_command(HciCommand::LeSetScanParameters {
                    active: config.active,
                    interval: config.interval_units(),
                    window: config.window_units(),
                })
                .await?;
            self.host
                .send_command(HciCommand::LeSetScanEnable {
                    enable: true,
                    filter_duplicates: config.filter_duplicates,
                })
                .await?;
        }
        Ok(())
    }

    async fn disable(&self) -> Result<(), ControllerError> {
        let command = if self.extended {
            HciCommand::LeSetExtendedScanEnable {
                enable: false,
                filter_duplicates: false,
            }
        } else {
            HciCommand::LeSetScanEnable {
                enable: false,
                filter_duplicates: false,
            }
        };
        self.host.send_command(command).await?;
        Ok(())
    }

    /// Turns controller reports into records until cancelled
    async fn internal_scan_task(
        mut reports: mpsc::UnboundedReceiver<AdvertisingReport>,
        sink: AdvertisementSink,
        records: Arc<Mutex<HashMap<Address, AdvertisementRecord>>>,
        cancel_token: CancellationToken,
        filter_duplicates: bool,
    ) {
        let mut sequence = 0u64;
        loop {
            tokio::select! {
                report = reports.recv() => match report {
                    Some(report) => {
                        Self::process_report(report, &sink, &records, filter_duplicates, &mut sequence);
                    }
                    None => {
                        debug!("Advertising report stream has ended.");
                        break;
                    }
                },
                _ = cancel_token.cancelled() => {
                    // Reports already queued are still delivered
                    while let Ok(report) = reports.try_recv() {
                        Self::process_report(report, &sink, &records, filter_duplicates, &mut sequence);
                    }
                    break;
                }
            }
        }
        debug!("Scan task delivered {} record(s)", sequence);
    }

    fn process_report(
        report: AdvertisingReport,
        sink: &AdvertisementSink,
        records: &Mutex<HashMap<Address, AdvertisementRecord>>,
        filter_duplicates: bool,
        sequence: &mut u64,
    ) {
        let data = adv_data::parse(&report.data);
        let mut records = records.lock();

        if filter_duplicates {
            if let Some(known) = records.get_mut(&report.address) {
                known.rssi = report.rssi;
                if !data.is_empty() {
                    known.data = data;
                }
                return;
            }
        }

        let record = AdvertisementRecord {
            address: report.address,
            rssi: report.rssi,
            data,
            connectable: report.connectable,
            sequence: *sequence,
            discovered_at: Instant::now(),
        };
        *sequence += 1;
        debug!(
            "Found device - Address: {:?}, RSSI: {}, Name: {:?}",
            record.address,
            record.rssi,
            record.local_name()
        );
        records.insert(record.address, record.clone());
        if sink.send(record).is_err() {
            debug!("Advertisement receiver dropped");
        }
    }
}

#[async_trait]
impl AdvertisementScanner for BluetoothScanner {
    fn configure(&mut self, config: ScanConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(min_rssi) = config.min_rssi {
            info!("Minimum RSSI {} dBm recorded; advertisements are not filtered on it", min_rssi);
        }
        self.config = config;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ControllerError> {
        if self.scan_task_handle.is_some() {
            self.stop().await?;
        }
        self.records.lock().clear();

        let extended = self.config.needs_extended_scan();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        // Registered before enabling so the first report is not lost
        self.host.set_advertising_report_sink(Some(report_tx));

        if let Err(e) = self.enable(extended).await {
            error!("Failed to start scanning: {}", e);
            self.host.set_advertising_report_sink(None);
            return Err(e);
        }
        self.extended = extended;

        self.cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::internal_scan_task(
            report_rx,
            self.sink.clone(),
            self.records.clone(),
            self.cancel_token.clone(),
            self.config.filter_duplicates,
        ));
        self.scan_task_handle = Some(handle);

        info!(
            "Scanning started on {:?} ({}, {} ms / {} ms)",
            self.config.phys(),
            if self.config.active { "active" } else { "passive" },
            self.config.scan_window_ms,
            self.config.scan_interval_ms
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ControllerError> {
        let Some(handle) = self.scan_task_handle.take() else {
            debug!("No active scan to stop.");
            return Ok(());
        };

        info!("Stopping Bluetooth scan.");
        let result = self.disable().await;
        if let Err(e) = &result {
            warn!("Failed to disable scanning: {}", e);
        }
        self.host.set_advertising_report_sink(None);
        self.cancel_token.cancel();

        if let Err(e) = handle.await {
            error!("Scan task finished with an unexpected join error: {:?}", e);
        }
        result
    }
}
