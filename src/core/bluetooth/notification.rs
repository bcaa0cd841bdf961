//! Notification handling
//! This module keeps the per-connection table of notification handlers and
//! the forwarding handler the workflow installs on every subscription.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::AttError;
use crate::core::bluetooth::types::{Address, Characteristic};

/// Invoked once per notification or indication payload
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

type HandlerTable = Mutex<Option<HashMap<u16, NotificationCallback>>>;

/// Handlers of one connection, keyed by value handle.
/// Closing the table drops every handler at once.
#[derive(Clone)]
pub struct NotificationHandlers {
    table: Arc<HandlerTable>,
}

impl Default for NotificationHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHandlers {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Some(HashMap::new()))),
        }
    }

    pub fn insert(&self, value_handle: u16, callback: NotificationCallback) -> Result<(), AttError> {
        match self.table.lock().as_mut() {
            Some(handlers) => {
                if handlers.insert(value_handle, callback).is_some() {
                    debug!("Replaced handler for handle 0x{:04x}", value_handle);
                }
                Ok(())
            }
            None => Err(AttError::NotConnected),
        }
    }

    pub fn remove(&self, value_handle: u16) -> bool {
        self.table
            .lock()
            .as_mut()
            .is_some_and(|handlers| handlers.remove(&value_handle).is_some())
    }

    pub fn contains(&self, value_handle: u16) -> bool {
        self.table
            .lock()
            .as_ref()
            .is_some_and(|handlers| handlers.contains_key(&value_handle))
    }

    /// Runs the handler for `value_handle`. Returns false when none is registered.
    pub fn dispatch(&self, value_handle: u16, payload: &[u8]) -> bool {
        // Clone out so a handler may touch the table without deadlocking
        let callback = self
            .table
            .lock()
            .as_ref()
            .and_then(|handlers| handlers.get(&value_handle).cloned());
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }

    /// Drops every handler; later inserts fail with `NotConnected`
    pub fn close(&self) {
        if let Some(handlers) = self.table.lock().take() {
            debug!("Dropping {} notification handler(s)", handlers.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().is_none()
    }

    fn downgrade(&self) -> Weak<HandlerTable> {
        Arc::downgrade(&self.table)
    }
}

/// An enabled notification or indication on one characteristic
#[derive(Clone)]
pub struct Subscription {
    pub uuid: Uuid,
    pub value_handle: u16,
    pub cccd_handle: u16,
    table: Weak<HandlerTable>,
}

impl Subscription {
    pub fn new(
        uuid: Uuid,
        value_handle: u16,
        cccd_handle: u16,
        handlers: &NotificationHandlers,
    ) -> Self {
        Self {
            uuid,
            value_handle,
            cccd_handle,
            table: handlers.downgrade(),
        }
    }

    /// False once unsubscribed or once the connection has gone down
    pub fn is_active(&self) -> bool {
        self.table.upgrade().is_some_and(|table| {
            table
                .lock()
                .as_ref()
                .is_some_and(|handlers| handlers.contains_key(&self.value_handle))
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("uuid", &self.uuid)
            .field("value_handle", &self.value_handle)
            .field("cccd_handle", &self.cccd_handle)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A notification payload as delivered by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub peer: Address,
    pub value_handle: u16,
    pub uuid: Uuid,
    pub payload: Vec<u8>,
}

/// Builds handlers that log every payload and forward it unmodified
#[derive(Clone)]
pub struct NotificationForwarder {
    peer: Address,
    sender: Option<mpsc::UnboundedSender<Notification>>,
}

impl NotificationForwarder {
    pub fn new(peer: Address, sender: Option<mpsc::UnboundedSender<Notification>>) -> Self {
        Self { peer, sender }
    }

    pub fn handler_for(&self, characteristic: &Characteristic) -> NotificationCallback {
        let peer = self.peer;
        let uuid = characteristic.uuid;
        let value_handle = characteristic.value_handle;
        let sender = self.sender.clone();
        info!("Forwarding notifications of {} (handle 0x{:04x})", uuid, value_handle);

        Arc::new(move |payload: &[u8]| {
            info!(
                "Notification from {} on {} (0x{:04x}): {}",
                peer,
                uuid,
                value_handle,
                hex::encode(payload)
            );
            if let Some(sender) = &sender {
                let notification = Notification {
                    peer,
                    value_handle,
                    uuid,
                    payload: payload.to_vec(),
                };
                if sender.send(notification).is_err() {
                    warn!("Notification receiver dropped");
                }
            }
        })
    }
}
