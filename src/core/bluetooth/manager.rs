//! Bluetooth manager
//! This module runs the single-shot central workflow: scan for the first
//! advertiser, connect, discover its GATT database, subscribe to every
//! notifying characteristic and idle until the link goes down.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::config::AppConfig;
use crate::core::bluetooth::connection::Connector;
use crate::core::bluetooth::error::{AttError, WorkflowError};
use crate::core::bluetooth::gatt::GattPeer;
use crate::core::bluetooth::notification::{Notification, NotificationForwarder, Subscription};
use crate::core::bluetooth::scanner::{AdvertisementScanner, AdvertisementSink};
use crate::core::bluetooth::types::{
    Address, AdvertisementRecord, Characteristic, CharacteristicProperties, Service,
};

/// A service together with its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub service: Service,
    pub characteristics: Vec<Characteristic>,
}

/// How a workflow run ended
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// Nothing advertised before the scan timeout
    NoDeviceFound,
    /// The peer was connected, explored and has since disconnected
    Disconnected {
        peer: Address,
        reason: u8,
        services: Vec<DiscoveredService>,
        subscriptions: Vec<Subscription>,
    },
}

/// A connected, explored and subscribed peer
struct Session<P> {
    peer: P,
    services: Vec<DiscoveredService>,
    subscriptions: Vec<Subscription>,
}

/// Drives the scan, connect, discover and subscribe workflow
pub struct BluetoothManager {
    config: AppConfig,
    advertisements_tx: AdvertisementSink,
    advertisements_rx: mpsc::UnboundedReceiver<AdvertisementRecord>,
    notifications: Option<mpsc::UnboundedSender<Notification>>,
}

impl BluetoothManager {
    pub fn new(config: AppConfig) -> Self {
        let (advertisements_tx, advertisements_rx) = mpsc::unbounded_channel();
        Self {
            config,
            advertisements_tx,
            advertisements_rx,
            notifications: None,
        }
    }

    /// The channel the scanner must deliver records into
    pub fn advertisement_sink(&self) -> AdvertisementSink {
        self.advertisements_tx.clone()
    }

    /// Also forwards every notification payload to `sender`
    pub fn with_notification_sink(mut self, sender: mpsc::UnboundedSender<Notification>) -> Self {
        self.notifications = Some(sender);
        self
    }

    /// Runs the workflow once
    pub async fn run<S, C>(mut self, scanner: &mut S, connector: &C) -> Result<WorkflowOutcome>
    where
        S: AdvertisementScanner,
        C: Connector,
    {
        scanner
            .configure(self.config.scan.clone())
            .context("Invalid scan configuration")?;
        scanner.start().await.context("Failed to start scanning")?;

        let scan_timeout = Duration::from_secs(self.config.workflow.scan_timeout_secs);
        info!("Waiting up to {:?} for an advertisement", scan_timeout);
        let record = match timeout(scan_timeout, self.advertisements_rx.recv()).await {
            Ok(Some(record)) => Some(record),
            Ok(None) | Err(_) => None,
        };

        if let Err(e) = scanner.stop().await {
            warn!("Failed to stop scanning: {}", e);
        }

        let Some(record) = record else {
            info!("No device found");
            return Ok(WorkflowOutcome::NoDeviceFound);
        };
        info!(
            "Found {:?} (RSSI {} dBm, name {:?})",
            record.address,
            record.rssi,
            record.local_name()
        );

        let session = self
            .connect_with_retry(connector, record.address)
            .await
            .with_context(|| format!("Failed to set up {}", record.address))?;

        info!(
            "Listening for notifications from {} on {} characteristic(s)",
            record.address,
            session.subscriptions.len()
        );
        let reason = session.peer.disconnected().await;
        info!(
            "{} disconnected (reason 0x{:02x})",
            record.address, reason
        );

        Ok(WorkflowOutcome::Disconnected {
            peer: record.address,
            reason,
            services: session.services,
            subscriptions: session.subscriptions,
        })
    }

    /// Connect, discover and subscribe, repeating per the retry policy
    async fn connect_with_retry<C: Connector>(
        &self,
        connector: &C,
        address: Address,
    ) -> Result<Session<C::Peer>, WorkflowError> {
        let policy = self.config.workflow.retry;
        let max_attempts = policy.attempts();
        let mut attempt = 1;

        loop {
            match self.try_connect(connector, address).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    info!("Retrying connection in {:?}...", policy.delay());
                    sleep(policy.delay()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect<C: Connector>(
        &self,
        connector: &C,
        address: Address,
    ) -> Result<Session<C::Peer>, WorkflowError> {
        let connect_timeout = Duration::from_secs(self.config.connection.connect_timeout_secs);
        let peer = connector.connect_peer(address, connect_timeout).await?;
        info!("Connected to {}, discovering services...", address);

        match self.explore(&peer).await {
            Ok((services, subscriptions)) => Ok(Session {
                peer,
                services,
                subscriptions,
            }),
            Err(e) => {
                // Leave nothing half set up behind
                match timeout(connect_timeout, peer.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(disconnect_error)) => {
                        debug!("Disconnect after failure: {}", disconnect_error)
                    }
                    Err(_) => warn!("Timed out disconnecting from {}", address),
                }
                Err(e.into())
            }
        }
    }

    async fn explore<P: GattPeer>(
        &self,
        peer: &P,
    ) -> Result<(Vec<DiscoveredService>, Vec<Subscription>), AttError> {
        match peer.exchange_mtu(self.config.gatt.preferred_mtu).await {
            Ok(mtu) => debug!("Using ATT MTU {}", mtu),
            Err(AttError::NotConnected) => return Err(AttError::NotConnected),
            Err(e) => warn!("MTU exchange failed: {}", e),
        }

        let mut services = Vec::new();
        for service in peer.discover_services().await? {
            let characteristics = peer.discover_characteristics(&service).await?;
            info!(
                "Service {} [0x{:04x}..0x{:04x}] with {} characteristic(s)",
                service.uuid,
                service.start_handle,
                service.end_handle,
                characteristics.len()
            );
            services.push(DiscoveredService {
                service,
                characteristics,
            });
        }

        let forwarder = NotificationForwarder::new(peer.peer_address(), self.notifications.clone());
        let mut subscriptions = Vec::new();
        for characteristic in services
            .iter()
            .flat_map(|discovered| discovered.characteristics.iter())
            .filter(|c| c.properties.contains(CharacteristicProperties::NOTIFY))
        {
            let subscription = peer
                .subscribe(characteristic, forwarder.handler_for(characteristic))
                .await?;
            subscriptions.push(subscription);
        }

        Ok((services, subscriptions))
    }
}
