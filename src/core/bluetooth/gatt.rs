//! GATT client
//! Sequenced ATT requests over one connection, primary service,
//! characteristic and descriptor discovery, and notification subscriptions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::GattConfig;
use crate::core::bluetooth::att::{AttPdu, is_response_opcode};
use crate::core::bluetooth::connection::{Connection, ConnectionState};
use crate::core::bluetooth::constants::{
    CCCD_DISABLED, CCCD_INDICATE, CCCD_NOTIFY, DEFAULT_ATT_MTU, FIRST_ATTRIBUTE_HANDLE,
    LAST_ATTRIBUTE_HANDLE, UUID_CHARACTERISTIC, UUID_CLIENT_CHARACTERISTIC_CONFIGURATION,
    UUID_PRIMARY_SERVICE, att_errors,
};
use crate::core::bluetooth::error::{AttError, ConnectError};
use crate::core::bluetooth::notification::{NotificationCallback, NotificationHandlers, Subscription};
use crate::core::bluetooth::types::{
    Address, Characteristic, CharacteristicProperties, Descriptor, Service, uuid_from_le_slice,
    uuid_from_u16,
};

/// The capabilities the workflow needs from a connected peer
#[async_trait]
pub trait GattPeer: Send + Sync {
    fn peer_address(&self) -> Address;

    /// Negotiates the ATT MTU, returning the value in effect
    async fn exchange_mtu(&self, mtu: u16) -> Result<u16, AttError>;

    /// All primary services in ascending handle order
    async fn discover_services(&self) -> Result<Vec<Service>, AttError>;

    async fn discover_characteristics(&self, service: &Service) -> Result<Vec<Characteristic>, AttError>;

    async fn subscribe(
        &self,
        characteristic: &Characteristic,
        handler: NotificationCallback,
    ) -> Result<Subscription, AttError>;

    /// Resolves with the disconnect reason once the link is gone
    async fn disconnected(&self) -> u8;

    async fn disconnect(&self) -> Result<(), ConnectError>;
}

fn unexpected(request: &str, response: &AttPdu) -> AttError {
    AttError::Malformed(format!(
        "{} answered with opcode 0x{:02x}",
        request,
        response.opcode()
    ))
}

fn is_attribute_not_found(error: &AttError) -> bool {
    matches!(
        error,
        AttError::Protocol {
            code: att_errors::ATTRIBUTE_NOT_FOUND,
            ..
        }
    )
}

/// GATT client bound to one connection
pub struct GattClient {
    connection: Arc<Connection>,
    /// Held for a whole request/response transaction
    responses: Mutex<mpsc::UnboundedReceiver<Result<AttPdu, AttError>>>,
    handlers: NotificationHandlers,
    request_timeout: Duration,
    mtu: AtomicU16,
    /// Set once a transaction timed out; the bearer takes no further requests
    timed_out: AtomicBool,
    dispatch_task: JoinHandle<()>,
}

impl GattClient {
    /// Takes over the connection's inbound ATT channel and starts dispatching it
    pub fn new(connection: Arc<Connection>, config: &GattConfig) -> Self {
        let handlers = NotificationHandlers::new();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let dispatch_task = match connection.take_att_receiver() {
            Some(att_rx) => tokio::spawn(Self::dispatch(
                connection.clone(),
                att_rx,
                response_tx,
                handlers.clone(),
            )),
            None => {
                warn!("ATT channel of {} is already in use", connection.peer());
                handlers.close();
                tokio::spawn(async {})
            }
        };

        Self {
            connection,
            responses: Mutex::new(response_rx),
            handlers,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            mtu: AtomicU16::new(DEFAULT_ATT_MTU),
            timed_out: AtomicBool::new(false),
            dispatch_task,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// ATT MTU currently in effect
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Delivery path of one connection: routes responses to the waiting
    /// request and notifications to their handlers, in arrival order.
    async fn dispatch(
        connection: Arc<Connection>,
        mut att_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        responses: mpsc::UnboundedSender<Result<AttPdu, AttError>>,
        handlers: NotificationHandlers,
    ) {
        let mut state = connection.state_receiver();
        loop {
            let bytes = tokio::select! {
                biased;
                _ = Self::until_disconnected(&mut state) => break,
                bytes = att_rx.recv() => match bytes {
                    Some(bytes) => bytes,
                    None => break,
                },
            };

            let pdu = match AttPdu::decode(&bytes) {
                Ok(pdu) => pdu,
                Err(e) => {
                    warn!("Undecodable ATT PDU from {}: {}", connection.peer(), e);
                    // A broken response still ends the transaction it answers
                    if bytes.first().copied().is_some_and(is_response_opcode)
                        && responses.send(Err(e)).is_err()
                    {
                        break;
                    }
                    continue;
                }
            };

            match pdu {
                AttPdu::HandleValueNotification { handle, value } => {
                    if !handlers.dispatch(handle, &value) {
                        debug!("Notification for unsubscribed handle 0x{:04x}", handle);
                    }
                }
                AttPdu::HandleValueIndication { handle, value } => {
                    if !handlers.dispatch(handle, &value) {
                        debug!("Indication for unsubscribed handle 0x{:04x}", handle);
                    }
                    if let Err(e) = connection
                        .send_att(&AttPdu::HandleValueConfirmation.encode())
                        .await
                    {
                        warn!("Failed to confirm indication: {}", e);
                    }
                }
                AttPdu::ExchangeMtuRequest(_) => {
                    let reply = AttPdu::ExchangeMtuResponse(DEFAULT_ATT_MTU);
                    if let Err(e) = connection.send_att(&reply.encode()).await {
                        warn!("Failed to answer MTU exchange: {}", e);
                    }
                }
                pdu if pdu.expects_response() => {
                    // No attribute database on this side
                    let reply = AttPdu::ErrorResponse {
                        request_opcode: pdu.opcode(),
                        handle: 0x0000,
                        code: att_errors::REQUEST_NOT_SUPPORTED,
                    };
                    if let Err(e) = connection.send_att(&reply.encode()).await {
                        warn!("Failed to reject ATT request: {}", e);
                    }
                }
                pdu if pdu.is_response() => {
                    if responses.send(Ok(pdu)).is_err() {
                        debug!("ATT response arrived after the client was dropped");
                    }
                }
                other => debug!("Ignoring ATT PDU {:?}", other),
            }
        }

        handlers.close();
        debug!("ATT dispatch for {} finished", connection.peer());
    }

    async fn until_disconnected(state: &mut watch::Receiver<ConnectionState>) {
        let _ = state.wait_for(ConnectionState::is_disconnected).await;
    }

    /// One request/response transaction. Error responses become `AttError::Protocol`.
    /// After a timeout every later request fails with `AttError::Timeout`.
    async fn request(&self, request: AttPdu) -> Result<AttPdu, AttError> {
        let mut responses = self.responses.lock().await;
        if self.timed_out.load(Ordering::Acquire) {
            return Err(AttError::Timeout);
        }
        // Late answers to requests that already timed out
        while let Ok(stale) = responses.try_recv() {
            debug!("Discarding stale ATT response {:?}", stale);
        }

        debug!("ATT request {:?}", request);
        self.connection.send_att(&request.encode()).await?;
        let response = match timeout(self.request_timeout, responses.recv()).await {
            Ok(Some(response)) => response?,
            Ok(None) => return Err(AttError::NotConnected),
            Err(_) => {
                self.timed_out.store(true, Ordering::Release);
                warn!(
                    "ATT request 0x{:02x} to {} timed out",
                    request.opcode(),
                    self.connection.peer()
                );
                return Err(AttError::Timeout);
            }
        };

        match response {
            AttPdu::ErrorResponse {
                request_opcode,
                handle,
                code,
            } => Err(AttError::Protocol {
                request_opcode,
                handle,
                code,
            }),
            response => Ok(response),
        }
    }

    /// Descriptors between the value handle and the end of the characteristic
    pub async fn discover_descriptors(
        &self,
        characteristic: &Characteristic,
    ) -> Result<Vec<Descriptor>, AttError> {
        let mut descriptors = Vec::new();
        let end = characteristic.end_handle;
        let mut start = characteristic.value_handle as u32 + 1;

        while start <= end as u32 {
            let response = self
                .request(AttPdu::FindInformationRequest {
                    start: start as u16,
                    end,
                })
                .await;
            let entries = match response {
                Ok(AttPdu::FindInformationResponse(entries)) => entries,
                Ok(other) => return Err(unexpected("Find Information", &other)),
                Err(e) if is_attribute_not_found(&e) => break,
                Err(e) => return Err(e),
            };
            for (handle, uuid) in entries {
                if (handle as u32) < start || handle > end {
                    return Err(AttError::Malformed(format!(
                        "descriptor handle 0x{:04x} outside 0x{:04x}..=0x{:04x}",
                        handle, start, end
                    )));
                }
                descriptors.push(Descriptor { handle, uuid });
                start = handle as u32 + 1;
            }
        }
        Ok(descriptors)
    }

    /// Handle of the characteristic's CCCD, assumed to follow the value when not listed
    async fn find_cccd(&self, characteristic: &Characteristic) -> Result<u16, AttError> {
        let cccd = uuid_from_u16(UUID_CLIENT_CHARACTERISTIC_CONFIGURATION);
        let descriptors = self.discover_descriptors(characteristic).await?;
        match descriptors.iter().find(|d| d.uuid == cccd) {
            Some(descriptor) => Ok(descriptor.handle),
            None => {
                debug!(
                    "No CCCD listed for {}, using handle 0x{:04x}",
                    characteristic.uuid,
                    characteristic.value_handle.wrapping_add(1)
                );
                Ok(characteristic.value_handle.wrapping_add(1))
            }
        }
    }

    pub async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, AttError> {
        match self.request(AttPdu::ReadRequest(characteristic.value_handle)).await? {
            AttPdu::ReadResponse(value) => Ok(value),
            other => Err(unexpected("Read", &other)),
        }
    }

    pub async fn write(&self, handle: u16, value: &[u8]) -> Result<(), AttError> {
        let request = AttPdu::WriteRequest {
            handle,
            value: value.to_vec(),
        };
        match self.request(request).await? {
            AttPdu::WriteResponse => Ok(()),
            other => Err(unexpected("Write", &other)),
        }
    }

    /// Disables the notification and drops its handler
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AttError> {
        if !self.handlers.remove(subscription.value_handle) {
            debug!("Handle 0x{:04x} was not subscribed", subscription.value_handle);
        }
        self.write(subscription.cccd_handle, &CCCD_DISABLED.to_le_bytes())
            .await?;
        info!("Unsubscribed from {}", subscription.uuid);
        Ok(())
    }
}

impl Drop for GattClient {
    fn drop(&mut self) {
        self.dispatch_task.abort();
        self.handlers.close();
    }
}

#[async_trait]
impl GattPeer for GattClient {
    fn peer_address(&self) -> Address {
        self.connection.peer()
    }

    async fn exchange_mtu(&self, mtu: u16) -> Result<u16, AttError> {
        let server_mtu = match self.request(AttPdu::ExchangeMtuRequest(mtu)).await? {
            AttPdu::ExchangeMtuResponse(server_mtu) => server_mtu,
            other => return Err(unexpected("Exchange MTU", &other)),
        };
        let negotiated = mtu.min(server_mtu).max(DEFAULT_ATT_MTU);
        self.mtu.store(negotiated, Ordering::Relaxed);
        info!("ATT MTU with {} is {}", self.connection.peer(), negotiated);
        Ok(negotiated)
    }

    async fn discover_services(&self) -> Result<Vec<Service>, AttError> {
        let mut services: Vec<Service> = Vec::new();
        let mut start = FIRST_ATTRIBUTE_HANDLE as u32;

        while start <= LAST_ATTRIBUTE_HANDLE as u32 {
            let response = self
                .request(AttPdu::ReadByGroupTypeRequest {
                    start: start as u16,
                    end: LAST_ATTRIBUTE_HANDLE,
                    group_type: uuid_from_u16(UUID_PRIMARY_SERVICE),
                })
                .await;
            let entries = match response {
                Ok(AttPdu::ReadByGroupTypeResponse(entries)) => entries,
                Ok(other) => return Err(unexpected("Read By Group Type", &other)),
                Err(e) if is_attribute_not_found(&e) => break,
                Err(e) => return Err(e),
            };

            for entry in entries {
                if (entry.handle as u32) < start || entry.end_handle < entry.handle {
                    return Err(AttError::Malformed(format!(
                        "service range 0x{:04x}..=0x{:04x} overlaps or is not ascending",
                        entry.handle, entry.end_handle
                    )));
                }
                let uuid = match entry.value.len() {
                    2 | 16 => uuid_from_le_slice(&entry.value),
                    _ => None,
                }
                .ok_or_else(|| {
                    AttError::Malformed(format!("service UUID of {} bytes", entry.value.len()))
                })?;

                debug!(
                    "Service {} at 0x{:04x}..=0x{:04x}",
                    uuid, entry.handle, entry.end_handle
                );
                services.push(Service {
                    uuid,
                    start_handle: entry.handle,
                    end_handle: entry.end_handle,
                });
                start = entry.end_handle as u32 + 1;
            }
        }

        info!("Discovered {} service(s)", services.len());
        Ok(services)
    }

    async fn discover_characteristics(&self, service: &Service) -> Result<Vec<Characteristic>, AttError> {
        let mut characteristics: Vec<Characteristic> = Vec::new();
        let mut start = service.start_handle as u32;

        while start <= service.end_handle as u32 {
            let response = self
                .request(AttPdu::ReadByTypeRequest {
                    start: start as u16,
                    end: service.end_handle,
                    attribute_type: uuid_from_u16(UUID_CHARACTERISTIC),
                })
                .await;
            let entries = match response {
                Ok(AttPdu::ReadByTypeResponse(entries)) => entries,
                Ok(other) => return Err(unexpected("Read By Type", &other)),
                Err(e) if is_attribute_not_found(&e) => break,
                Err(e) => return Err(e),
            };

            for (handle, value) in entries {
                if (handle as u32) < start || !service.contains(handle) {
                    return Err(AttError::Malformed(format!(
                        "declaration handle 0x{:04x} outside the expected range",
                        handle
                    )));
                }
                if value.len() != 5 && value.len() != 19 {
                    return Err(AttError::Malformed(format!(
                        "characteristic declaration of {} bytes",
                        value.len()
                    )));
                }
                let value_handle = u16::from_le_bytes([value[1], value[2]]);
                if value_handle <= handle || !service.contains(value_handle) {
                    return Err(AttError::Malformed(format!(
                        "value handle 0x{:04x} outside service 0x{:04x}..=0x{:04x}",
                        value_handle, service.start_handle, service.end_handle
                    )));
                }
                let uuid: Uuid = uuid_from_le_slice(&value[3..]).ok_or_else(|| {
                    AttError::Malformed("characteristic UUID".to_string())
                })?;

                characteristics.push(Characteristic {
                    uuid,
                    declaration_handle: handle,
                    value_handle,
                    end_handle: service.end_handle,
                    properties: CharacteristicProperties::from_bits(value[0]),
                });
                start = handle as u32 + 1;
            }
        }

        // Each characteristic ends right before the next declaration
        for i in 1..characteristics.len() {
            let next = characteristics[i].declaration_handle;
            let previous = &mut characteristics[i - 1];
            if next <= previous.value_handle {
                return Err(AttError::Malformed(format!(
                    "declaration 0x{:04x} precedes value handle 0x{:04x}",
                    next, previous.value_handle
                )));
            }
            previous.end_handle = next - 1;
        }

        for characteristic in &characteristics {
            debug!(
                "Characteristic {} value 0x{:04x} [{}]",
                characteristic.uuid, characteristic.value_handle, characteristic.properties
            );
        }
        Ok(characteristics)
    }

    async fn subscribe(
        &self,
        characteristic: &Characteristic,
        handler: NotificationCallback,
    ) -> Result<Subscription, AttError> {
        let properties = characteristic.properties;
        if !properties.can_subscribe() {
            return Err(AttError::NotNotifiable);
        }
        if !self.connection.is_connected() {
            return Err(AttError::NotConnected);
        }

        let cccd_handle = self.find_cccd(characteristic).await?;
        let value = if properties.contains(CharacteristicProperties::NOTIFY) {
            CCCD_NOTIFY
        } else {
            CCCD_INDICATE
        };

        // Registered first so the first notification after the write is not missed
        self.handlers.insert(characteristic.value_handle, handler)?;
        if let Err(e) = self.write(cccd_handle, &value.to_le_bytes()).await {
            self.handlers.remove(characteristic.value_handle);
            return Err(e);
        }

        info!(
            "Subscribed to {} (value 0x{:04x}, CCCD 0x{:04x})",
            characteristic.uuid, characteristic.value_handle, cccd_handle
        );
        Ok(Subscription::new(
            characteristic.uuid,
            characteristic.value_handle,
            cccd_handle,
            &self.handlers,
        ))
    }

    async fn disconnected(&self) -> u8 {
        self.connection.wait_disconnected().await
    }

    async fn disconnect(&self) -> Result<(), ConnectError> {
        self.connection.disconnect().await
    }
}
