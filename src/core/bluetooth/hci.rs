//! HCI command/event layer
//! Owns the transport, serializes commands and correlates their completion
//! events, and demultiplexes unsolicited events: advertising reports to the
//! scanner, connection events to the connection manager, and ATT data to
//! the connection it belongs to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::{CommandFamily, CommandSender, HciCommand};
use crate::core::bluetooth::connection::ConnectionState;
use crate::core::bluetooth::constants::{
    ACL_PB_CONTINUING, ACL_PB_FIRST_NON_FLUSHABLE, ATT_CID, EVENT_MASK, LE_EVENT_MASK, events,
    le_events, status,
};
use crate::core::bluetooth::error::ControllerError;
use crate::core::bluetooth::transport::{HciPacket, HciSink, HciSource, Transport};
use crate::core::bluetooth::types::{Address, AddressType};

/// Payload of LE (Enhanced) Connection Complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub role: u8,
    pub peer: Address,
    /// 1.25 ms units
    pub interval: u16,
    pub latency: u16,
    /// 10 ms units
    pub supervision_timeout: u16,
}

/// One advertising report, legacy or extended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    pub event_type: u16,
    pub address: Address,
    pub rssi: i8,
    pub data: Vec<u8>,
    pub connectable: bool,
}

/// Decoded HCI events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    CommandComplete { opcode: u16, return_parameters: Vec<u8> },
    CommandStatus { status: u8, opcode: u16 },
    DisconnectionComplete { status: u8, handle: u16, reason: u8 },
    HardwareError(u8),
    LeConnectionComplete(ConnectionComplete),
    LeAdvertisingReports(Vec<AdvertisingReport>),
    Other { code: u8 },
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<(), ControllerError> {
    if buf.remaining() < len {
        return Err(ControllerError::Malformed(format!(
            "{} needs {} bytes, {} left",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_address(buf: &mut &[u8]) -> [u8; 6] {
    let mut le = [0u8; 6];
    buf.copy_to_slice(&mut le);
    le
}

impl HciEvent {
    /// Decodes an event packet (event code, parameter length, parameters)
    pub fn decode(packet: &[u8]) -> Result<Self, ControllerError> {
        need(packet, 2, "event header")?;
        let code = packet[0];
        let mut buf = &packet[2..];
        if buf.len() != packet[1] as usize {
            return Err(ControllerError::Malformed(format!(
                "event 0x{:02x} length {} does not match {} parameter bytes",
                code,
                packet[1],
                buf.len()
            )));
        }

        match code {
            events::COMMAND_COMPLETE => {
                need(buf, 3, "Command Complete")?;
                let _num_packets = buf.get_u8();
                let opcode = buf.get_u16_le();
                Ok(HciEvent::CommandComplete {
                    opcode,
                    return_parameters: buf.to_vec(),
                })
            }
            events::COMMAND_STATUS => {
                need(buf, 4, "Command Status")?;
                let status = buf.get_u8();
                let _num_packets = buf.get_u8();
                let opcode = buf.get_u16_le();
                Ok(HciEvent::CommandStatus { status, opcode })
            }
            events::DISCONNECTION_COMPLETE => {
                need(buf, 4, "Disconnection Complete")?;
                Ok(HciEvent::DisconnectionComplete {
                    status: buf.get_u8(),
                    handle: buf.get_u16_le() & 0x0FFF,
                    reason: buf.get_u8(),
                })
            }
            events::HARDWARE_ERROR => {
                need(buf, 1, "Hardware Error")?;
                Ok(HciEvent::HardwareError(buf.get_u8()))
            }
            events::LE_META => {
                need(buf, 1, "LE Meta")?;
                let subevent = buf.get_u8();
                Self::decode_le_meta(subevent, buf)
            }
            _ => Ok(HciEvent::Other { code }),
        }
    }

    fn decode_le_meta(subevent: u8, mut buf: &[u8]) -> Result<Self, ControllerError> {
        match subevent {
            le_events::CONNECTION_COMPLETE | le_events::ENHANCED_CONNECTION_COMPLETE => {
                let enhanced = subevent == le_events::ENHANCED_CONNECTION_COMPLETE;
                need(buf, if enhanced { 30 } else { 18 }, "LE Connection Complete")?;
                let status = buf.get_u8();
                let handle = buf.get_u16_le() & 0x0FFF;
                let role = buf.get_u8();
                let address_type =
                    AddressType::from_hci(buf.get_u8()).unwrap_or(AddressType::Public);
                let peer = Address::from_le_bytes(read_address(&mut buf), address_type);
                if enhanced {
                    // local and peer resolvable private addresses
                    buf.advance(12);
                }
                Ok(HciEvent::LeConnectionComplete(ConnectionComplete {
                    status,
                    handle,
                    role,
                    peer,
                    interval: buf.get_u16_le(),
                    latency: buf.get_u16_le(),
                    supervision_timeout: buf.get_u16_le(),
                }))
            }
            le_events::ADVERTISING_REPORT => {
                need(buf, 1, "LE Advertising Report")?;
                let count = buf.get_u8();
                let mut reports = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    need(buf, 9, "advertising report")?;
                    let event_type = buf.get_u8() as u16;
                    let address_type = buf.get_u8();
                    let address = read_address(&mut buf);
                    let len = buf.get_u8() as usize;
                    need(buf, len + 1, "advertising data")?;
                    let data = buf[..len].to_vec();
                    buf.advance(len);
                    let rssi = buf.get_i8();

                    let Some(address_type) = AddressType::from_hci(address_type) else {
                        debug!("Skipping report with address type 0x{:02x}", address_type);
                        continue;
                    };
                    reports.push(AdvertisingReport {
                        event_type,
                        address: Address::from_le_bytes(address, address_type),
                        rssi,
                        data,
                        // ADV_IND and ADV_DIRECT_IND
                        connectable: event_type <= 0x01,
                    });
                }
                Ok(HciEvent::LeAdvertisingReports(reports))
            }
            le_events::EXTENDED_ADVERTISING_REPORT => {
                need(buf, 1, "LE Extended Advertising Report")?;
                let count = buf.get_u8();
                let mut reports = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    need(buf, 24, "extended advertising report")?;
                    let event_type = buf.get_u16_le();
                    let address_type = buf.get_u8();
                    let address = read_address(&mut buf);
                    // primary PHY, secondary PHY, SID, TX power
                    buf.advance(4);
                    let rssi = buf.get_i8();
                    // periodic interval, direct address type and address
                    buf.advance(9);
                    let len = buf.get_u8() as usize;
                    need(buf, len, "extended advertising data")?;
                    let data = buf[..len].to_vec();
                    buf.advance(len);

                    let Some(address_type) = AddressType::from_hci(address_type) else {
                        debug!("Skipping anonymous extended report");
                        continue;
                    };
                    reports.push(AdvertisingReport {
                        event_type,
                        address: Address::from_le_bytes(address, address_type),
                        rssi,
                        data,
                        connectable: event_type & 0x0001 != 0,
                    });
                }
                Ok(HciEvent::LeAdvertisingReports(reports))
            }
            _ => Ok(HciEvent::Other { code: events::LE_META }),
        }
    }
}

/// Reassembles ACL fragments into complete L2CAP basic frames
#[derive(Debug, Default)]
pub struct AclReassembler {
    partial: HashMap<u16, Vec<u8>>,
}

impl AclReassembler {
    /// Feeds one ACL packet. Returns `(handle, cid, payload)` once an L2CAP frame is complete.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<(u16, u16, Vec<u8>)>, ControllerError> {
        need(packet, 4, "ACL header")?;
        let mut buf = packet;
        let handle_flags = buf.get_u16_le();
        let len = buf.get_u16_le() as usize;
        need(buf, len, "ACL payload")?;
        let handle = handle_flags & 0x0FFF;
        let boundary = ((handle_flags >> 12) & 0b11) as u8;
        let fragment = &buf[..len];

        if boundary == ACL_PB_CONTINUING {
            let Some(pending) = self.partial.get_mut(&handle) else {
                return Err(ControllerError::Malformed(format!(
                    "continuing fragment without a start on handle 0x{:04x}",
                    handle
                )));
            };
            pending.extend_from_slice(fragment);
        } else if self.partial.insert(handle, fragment.to_vec()).is_some() {
            warn!("Discarding incomplete L2CAP frame on handle 0x{:04x}", handle);
        }

        let Some(pending) = self.partial.get(&handle) else {
            return Ok(None);
        };
        if pending.len() < 4 {
            return Ok(None);
        }
        let frame_len = u16::from_le_bytes([pending[0], pending[1]]) as usize;
        if pending.len() < frame_len + 4 {
            return Ok(None);
        }

        let frame = self.partial.remove(&handle).unwrap_or_default();
        if frame.len() > frame_len + 4 {
            return Err(ControllerError::Malformed(format!(
                "L2CAP frame on handle 0x{:04x} longer than its header",
                handle
            )));
        }
        let cid = u16::from_le_bytes([frame[2], frame[3]]);
        Ok(Some((handle, cid, frame[4..].to_vec())))
    }

    /// Forgets partial frames of a closed connection
    pub fn forget(&mut self, handle: u16) {
        self.partial.remove(&handle);
    }
}

/// Builds a single-fragment ACL packet carrying one L2CAP basic frame
pub fn encode_acl(handle: u16, cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    let handle_flags = (handle & 0x0FFF) | ((ACL_PB_FIRST_NON_FLUSHABLE as u16) << 12);
    packet.extend_from_slice(&handle_flags.to_le_bytes());
    packet.extend_from_slice(&((payload.len() + 4) as u16).to_le_bytes());
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(&cid.to_le_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Channels handed to the owner of a newly established link
#[derive(Debug)]
pub struct LinkChannels {
    /// ATT PDUs received on this link; closes when the link goes down
    pub att_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub state: watch::Receiver<ConnectionState>,
}

/// Connection events delivered to the connection manager
#[derive(Debug)]
pub enum ConnectionEvent {
    Established {
        complete: ConnectionComplete,
        link: LinkChannels,
    },
    Failed {
        status: u8,
    },
}

struct PendingCommand {
    opcode: u16,
    reply: oneshot::Sender<HciEvent>,
}

struct Link {
    att_tx: mpsc::UnboundedSender<Vec<u8>>,
    state_tx: watch::Sender<ConnectionState>,
}

struct HostInner {
    sink: Mutex<HciSink>,
    /// Held for the whole command/completion exchange
    command_lock: Mutex<()>,
    pending_command: SyncMutex<Option<PendingCommand>>,
    advertising_reports: SyncMutex<Option<mpsc::UnboundedSender<AdvertisingReport>>>,
    connection_events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_events_rx: SyncMutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    links: SyncMutex<HashMap<u16, Link>>,
    /// LE command family the controller accepted since the last reset
    command_family: SyncMutex<Option<CommandFamily>>,
    shutdown: CancellationToken,
    command_timeout: Duration,
}

/// The host side of the HCI. Cheap to clone; all clones share one transport.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Takes ownership of the transport and starts the reader task
    pub fn new(transport: Transport, command_timeout: Duration) -> Self {
        let (connection_events_tx, connection_events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HostInner {
            sink: Mutex::new(transport.sink),
            command_lock: Mutex::new(()),
            pending_command: SyncMutex::new(None),
            advertising_reports: SyncMutex::new(None),
            connection_events_tx,
            connection_events_rx: SyncMutex::new(Some(connection_events_rx)),
            links: SyncMutex::new(HashMap::new()),
            command_family: SyncMutex::new(None),
            shutdown: CancellationToken::new(),
            command_timeout,
        });

        tokio::spawn(Self::run_reader(inner.clone(), transport.source));
        Self { inner }
    }

    /// Resets the controller and enables the events the central workflow needs
    pub async fn power_on(&self) -> Result<(), ControllerError> {
        info!("Powering on controller");
        self.send_command(HciCommand::Reset).await?;
        self.send_command(HciCommand::SetEventMask(EVENT_MASK)).await?;
        self.send_command(HciCommand::LeSetEventMask(LE_EVENT_MASK)).await?;
        Ok(())
    }

    /// Routes advertising reports to `sink`, or drops them when `None`
    pub fn set_advertising_report_sink(
        &self,
        sink: Option<mpsc::UnboundedSender<AdvertisingReport>>,
    ) {
        *self.inner.advertising_reports.lock() = sink;
    }

    /// Hands out the connection event stream. Only the first caller gets it.
    pub fn take_connection_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.inner.connection_events_rx.lock().take()
    }

    /// Sends one L2CAP frame on a connection
    pub async fn send_l2cap(&self, handle: u16, cid: u16, payload: &[u8]) -> Result<(), ControllerError> {
        if self.is_closed() {
            return Err(ControllerError::Closed);
        }
        let packet = HciPacket::AclData(encode_acl(handle, cid, payload));
        self.inner.sink.lock().await.send(packet).await
    }

    pub async fn disconnect(&self, handle: u16, reason: u8) -> Result<(), ControllerError> {
        self.send_command(HciCommand::Disconnect { handle, reason }).await?;
        Ok(())
    }

    /// Legacy or extended, once the controller has accepted an LE command of either kind
    pub fn command_family(&self) -> Option<CommandFamily> {
        *self.inner.command_family.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the transport has closed
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Stops the reader task; every link is reported as disconnected
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    async fn run_reader(inner: Arc<HostInner>, mut source: HciSource) {
        let mut reassembler = AclReassembler::default();
        loop {
            let packet = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                packet = source.next() => packet,
            };

            match packet {
                Some(Ok(HciPacket::Event(bytes))) => match HciEvent::decode(&bytes) {
                    Ok(HciEvent::DisconnectionComplete { status: 0, handle, reason }) => {
                        reassembler.forget(handle);
                        inner.handle_disconnection(handle, reason);
                    }
                    Ok(event) => inner.handle_event(event),
                    Err(e) => warn!("Dropping undecodable HCI event: {}", e),
                },
                Some(Ok(HciPacket::AclData(bytes))) => match reassembler.push(&bytes) {
                    Ok(Some((handle, cid, payload))) => inner.route_l2cap(handle, cid, payload),
                    Ok(None) => {}
                    Err(e) => warn!("Dropping ACL data: {}", e),
                },
                Some(Ok(HciPacket::Command(_))) => {
                    warn!("Ignoring command packet received from the controller")
                }
                Some(Err(e)) => {
                    error!("HCI transport error: {}", e);
                    break;
                }
                None => {
                    info!("HCI transport closed");
                    break;
                }
            }
        }
        inner.shut_down();
    }
}

impl HostInner {
    fn handle_event(&self, event: HciEvent) {
        match event {
            HciEvent::CommandComplete { opcode, .. } | HciEvent::CommandStatus { opcode, .. } => {
                let mut pending = self.pending_command.lock();
                match pending.take() {
                    Some(command) if command.opcode == opcode => {
                        let _ = command.reply.send(event);
                    }
                    other => {
                        *pending = other;
                        // opcode 0 only reports free command slots
                        if opcode != 0 {
                            debug!("Unsolicited completion for opcode 0x{:04x}", opcode);
                        }
                    }
                }
            }
            HciEvent::DisconnectionComplete { status, handle, .. } => {
                warn!(
                    "Disconnection of handle 0x{:04x} failed with status 0x{:02x}",
                    handle, status
                );
            }
            HciEvent::LeConnectionComplete(complete) => self.handle_connection_complete(complete),
            HciEvent::LeAdvertisingReports(reports) => {
                let mut sink = self.advertising_reports.lock();
                if let Some(tx) = sink.as_ref() {
                    for report in reports {
                        if tx.send(report).is_err() {
                            debug!("Advertising report receiver dropped");
                            *sink = None;
                            break;
                        }
                    }
                }
            }
            HciEvent::HardwareError(code) => error!("Controller hardware error 0x{:02x}", code),
            HciEvent::Other { code } => debug!("Ignoring HCI event 0x{:02x}", code),
        }
    }

    fn handle_connection_complete(&self, complete: ConnectionComplete) {
        if complete.status != status::SUCCESS {
            info!("Connection attempt ended with status 0x{:02x}", complete.status);
            let _ = self.connection_events_tx.send(ConnectionEvent::Failed {
                status: complete.status,
            });
            return;
        }

        info!(
            "Connected to {:?} with handle 0x{:04x}",
            complete.peer, complete.handle
        );
        let (att_tx, att_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Established);
        self.links.lock().insert(complete.handle, Link { att_tx, state_tx });
        let _ = self.connection_events_tx.send(ConnectionEvent::Established {
            complete,
            link: LinkChannels { att_rx, state },
        });
    }

    fn handle_disconnection(&self, handle: u16, reason: u8) {
        let link = self.links.lock().remove(&handle);
        match link {
            Some(link) => {
                info!("Handle 0x{:04x} disconnected, reason 0x{:02x}", handle, reason);
                // State first, so nothing is dispatched once the ATT channel drains
                link.state_tx.send_replace(ConnectionState::Disconnected { reason });
            }
            None => debug!("Disconnection for unknown handle 0x{:04x}", handle),
        }
    }

    fn route_l2cap(&self, handle: u16, cid: u16, payload: Vec<u8>) {
        if cid != ATT_CID {
            debug!("Ignoring L2CAP frame on CID 0x{:04x}", cid);
            return;
        }
        match self.links.lock().get(&handle) {
            Some(link) => {
                let _ = link.att_tx.send(payload);
            }
            None => debug!("ATT data for unknown handle 0x{:04x}", handle),
        }
    }

    fn shut_down(&self) {
        self.shutdown.cancel();
        // Dropping the reply sender fails the waiting command with Closed
        self.pending_command.lock().take();
        self.advertising_reports.lock().take();
        for (handle, link) in self.links.lock().drain() {
            debug!("Dropping link 0x{:04x} with the transport", handle);
            link.state_tx.send_replace(ConnectionState::Disconnected {
                reason: status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
            });
        }
    }
}

#[async_trait]
impl CommandSender for Host {
    async fn send_command(&self, command: HciCommand) -> Result<Vec<u8>, ControllerError> {
        let opcode = command.opcode();
        let _serialized = self.inner.command_lock.lock().await;
        if self.is_closed() {
            return Err(ControllerError::Closed);
        }

        let (reply, completion) = oneshot::channel();
        *self.inner.pending_command.lock() = Some(PendingCommand { opcode, reply });
        debug!("HCI command {:?}", command);
        let sent = self
            .inner
            .sink
            .lock()
            .await
            .send(HciPacket::Command(command.to_bytes()))
            .await;
        if let Err(e) = sent {
            self.inner.pending_command.lock().take();
            return Err(e);
        }

        let waited = timeout(self.inner.command_timeout, async {
            tokio::select! {
                event = completion => event.map_err(|_| ControllerError::Closed),
                _ = self.inner.shutdown.cancelled() => Err(ControllerError::Closed),
            }
        })
        .await;
        let event = match waited {
            Ok(result) => result?,
            Err(_) => {
                self.inner.pending_command.lock().take();
                return Err(ControllerError::Timeout(opcode));
            }
        };

        let result = completion_result(opcode, event);
        if result.is_ok() {
            if command == HciCommand::Reset {
                *self.inner.command_family.lock() = None;
            } else if let Some(family) = command.family() {
                *self.inner.command_family.lock() = Some(family);
            }
        }
        result
    }
}

fn completion_result(opcode: u16, event: HciEvent) -> Result<Vec<u8>, ControllerError> {
    match event {
        HciEvent::CommandComplete {
            return_parameters, ..
        } => match return_parameters.split_first() {
            Some((&status::SUCCESS, rest)) => Ok(rest.to_vec()),
            Some((&status, _)) => Err(ControllerError::CommandFailed { opcode, status }),
            None => Ok(Vec::new()),
        },
        HciEvent::CommandStatus {
            status: status::SUCCESS,
            ..
        } => Ok(Vec::new()),
        HciEvent::CommandStatus { status, .. } => {
            Err(ControllerError::CommandFailed { opcode, status })
        }
        other => Err(ControllerError::Malformed(format!(
            "unexpected completion {:?}",
            other
        ))),
    }
}
