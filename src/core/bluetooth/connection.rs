//! Connection establishment
//! This module issues connect requests, tracks the single pending attempt,
//! and hands out live connections.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;

use crate::config::{ConnectionConfig, GattConfig};
use crate::core::bluetooth::commands::{
    CommandFamily, CommandSender, CreateConnectionParameters, HciCommand,
};
use crate::core::bluetooth::constants::{ATT_CID, CONNECT_CANCEL_SETTLE_MS, status};
use crate::core::bluetooth::error::{ConnectError, ControllerError};
use crate::core::bluetooth::gatt::{GattClient, GattPeer};
use crate::core::bluetooth::hci::{ConnectionComplete, ConnectionEvent, Host, LinkChannels};
use crate::core::bluetooth::types::{Address, Phy};

/// State of an established link. Disconnected is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Established,
    Disconnected { reason: u8 },
}

impl ConnectionState {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected { .. })
    }
}

/// Link parameters reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// 1.25 ms units
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units
    pub supervision_timeout: u16,
}

/// A live (or formerly live) LE connection
pub struct Connection {
    handle: u16,
    peer: Address,
    host: Host,
    state: watch::Receiver<ConnectionState>,
    att_rx: SyncMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    parameters: ConnectionParameters,
}

impl Connection {
    fn new(host: Host, complete: ConnectionComplete, link: LinkChannels) -> Self {
        Self {
            handle: complete.handle,
            peer: complete.peer,
            host,
            state: link.state,
            att_rx: SyncMutex::new(Some(link.att_rx)),
            parameters: ConnectionParameters {
                interval: complete.interval,
                latency: complete.latency,
                supervision_timeout: complete.supervision_timeout,
            },
        }
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn peer(&self) -> Address {
        self.peer
    }

    pub fn parameters(&self) -> ConnectionParameters {
        self.parameters
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        !self.state().is_disconnected()
    }

    /// A fresh observer of the connection state
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Hands out the inbound ATT channel. Only the first caller gets it.
    pub fn take_att_receiver(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.att_rx.lock().take()
    }

    /// Sends one ATT PDU on the fixed channel
    pub async fn send_att(&self, pdu: &[u8]) -> Result<(), ConnectError> {
        if !self.is_connected() {
            return Err(ConnectError::NotConnected);
        }
        self.host.send_l2cap(self.handle, ATT_CID, pdu).await?;
        Ok(())
    }

    /// Resolves with the disconnect reason once the link is gone
    pub async fn wait_disconnected(&self) -> u8 {
        let mut state = self.state.clone();
        match state.wait_for(ConnectionState::is_disconnected).await {
            Ok(current) => match *current {
                ConnectionState::Disconnected { reason } => reason,
                ConnectionState::Established => status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
            },
            Err(_) => status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
        }
    }

    /// Terminates the link and waits for the controller to confirm it
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        if !self.is_connected() {
            return Err(ConnectError::NotConnected);
        }
        info!("Disconnecting from {}", self.peer);
        match self
            .host
            .disconnect(self.handle, status::REMOTE_USER_TERMINATED_CONNECTION)
            .await
        {
            Ok(()) => {}
            // The link went down while the command was in flight
            Err(ControllerError::CommandFailed {
                status: status::UNKNOWN_CONNECTION_IDENTIFIER,
                ..
            }) => debug!("Handle 0x{:04x} already gone", self.handle),
            Err(e) => return Err(e.into()),
        }
        self.wait_disconnected().await;
        info!("Disconnected from {}", self.peer);
        Ok(())
    }
}

/// Holds the single pending-attempt slot until dropped
struct PendingAttempt<'a> {
    slot: &'a SyncMutex<Option<Address>>,
}

impl<'a> PendingAttempt<'a> {
    fn claim(slot: &'a SyncMutex<Option<Address>>, peer: Address) -> Result<Self, ConnectError> {
        let mut pending = slot.lock();
        if let Some(other) = *pending {
            debug!("Connection to {} already pending", other);
            return Err(ConnectError::AlreadyPending);
        }
        *pending = Some(peer);
        Ok(Self { slot })
    }
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

/// Connection manager for the central role
pub struct ConnectionManager {
    host: Host,
    events: Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
    pending: SyncMutex<Option<Address>>,
    config: ConnectionConfig,
    gatt: GattConfig,
}

impl ConnectionManager {
    pub fn new(host: Host, config: ConnectionConfig, gatt: GattConfig) -> Result<Self> {
        let events = host
            .take_connection_events()
            .ok_or_else(|| anyhow!("Connection events are already owned by another manager"))?;
        Ok(Self {
            host,
            events: Mutex::new(events),
            pending: SyncMutex::new(None),
            config,
            gatt,
        })
    }

    /// Address of the attempt in flight, if any
    pub fn pending(&self) -> Option<Address> {
        *self.pending.lock()
    }

    /// Connects to `peer`, giving up after `limit`
    pub async fn connect(&self, peer: Address, limit: Duration) -> Result<Connection, ConnectError> {
        let _attempt = PendingAttempt::claim(&self.pending, peer)?;
        let mut events = self.events.lock().await;
        self.discard_stale_events(&mut events).await;

        info!("Connecting to {:?} (timeout {:?})", peer, limit);
        let params = CreateConnectionParameters {
            peer,
            scan_interval: self.config.scan_interval,
            scan_window: self.config.scan_window,
            interval_min: self.config.interval_min,
            interval_max: self.config.interval_max,
            max_latency: self.config.max_latency,
            supervision_timeout: self.config.supervision_timeout,
        };
        // The controller refuses legacy commands once extended ones were used
        let command = match self.host.command_family() {
            Some(CommandFamily::Extended) => HciCommand::LeExtendedCreateConnection {
                params,
                phys: vec![Phy::Le1M, Phy::LeCoded],
            },
            _ => HciCommand::LeCreateConnection(params),
        };
        match self.host.send_command(command).await {
            Ok(_) => {}
            Err(ControllerError::CommandFailed { status, .. }) => {
                warn!("Controller rejected connection to {} with status 0x{:02x}", peer, status);
                return Err(ConnectError::Rejected(status));
            }
            Err(e) => return Err(e.into()),
        }

        match timeout(limit, self.await_established(&mut events, peer)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Connection to {} timed out, cancelling", peer);
                if let Err(e) = self.host.send_command(HciCommand::LeCreateConnectionCancel).await {
                    warn!("Failed to cancel connection attempt: {}", e);
                }
                self.settle_cancelled(&mut events).await;
                Err(ConnectError::Timeout)
            }
        }
    }

    async fn await_established(
        &self,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        peer: Address,
    ) -> Result<Connection, ConnectError> {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.host.closed() => None,
            };
            match event {
                Some(ConnectionEvent::Established { complete, link }) if complete.peer == peer => {
                    return Ok(Connection::new(self.host.clone(), complete, link));
                }
                Some(ConnectionEvent::Established { complete, .. }) => {
                    warn!("Unexpected connection to {:?}, dropping it", complete.peer);
                    self.drop_link(complete.handle).await;
                }
                Some(ConnectionEvent::Failed { status }) => {
                    warn!("Connection to {} failed with status 0x{:02x}", peer, status);
                    return Err(ConnectError::Rejected(status));
                }
                None => return Err(ControllerError::Closed.into()),
            }
        }
    }

    /// Waits for the completion a cancel produces. A connection that won
    /// the race with the cancel is torn down.
    async fn settle_cancelled(&self, events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) {
        let settle = Duration::from_millis(CONNECT_CANCEL_SETTLE_MS);
        let event = tokio::select! {
            event = timeout(settle, events.recv()) => event,
            _ = self.host.closed() => return,
        };
        match event {
            Ok(Some(ConnectionEvent::Established { complete, .. })) => {
                warn!(
                    "Connection to {:?} completed after the cancel, dropping it",
                    complete.peer
                );
                self.drop_link(complete.handle).await;
            }
            Ok(Some(ConnectionEvent::Failed { status })) => {
                debug!("Cancelled attempt ended with status 0x{:02x}", status);
            }
            Ok(None) => {}
            Err(_) => debug!("No completion followed the cancel"),
        }
    }

    /// Events left over from an earlier cancelled or timed out attempt
    async fn discard_stale_events(&self, events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::Established { complete, .. } => {
                    debug!("Dropping stale connection to {:?}", complete.peer);
                    self.drop_link(complete.handle).await;
                }
                ConnectionEvent::Failed { status } => {
                    debug!("Discarding stale connection failure 0x{:02x}", status);
                }
            }
        }
    }

    async fn drop_link(&self, handle: u16) {
        if let Err(e) = self
            .host
            .disconnect(handle, status::REMOTE_USER_TERMINATED_CONNECTION)
            .await
        {
            warn!("Failed to disconnect handle 0x{:04x}: {}", handle, e);
        }
    }
}

/// Something that can produce a connected GATT peer
#[async_trait]
pub trait Connector: Send + Sync {
    type Peer: GattPeer;

    async fn connect_peer(&self, peer: Address, limit: Duration) -> Result<Self::Peer, ConnectError>;
}

#[async_trait]
impl Connector for ConnectionManager {
    type Peer = GattClient;

    async fn connect_peer(&self, peer: Address, limit: Duration) -> Result<GattClient, ConnectError> {
        let connection = self.connect(peer, limit).await?;
        Ok(GattClient::new(Arc::new(connection), &self.gatt))
    }
}
