//! Bluetooth LE central stack
//! This module implements the host side of the HCI, scanning, connection
//! establishment and a GATT client, plus the workflow that drives them.

pub mod adv_data;
pub mod att;
pub mod commands;
pub mod connection;
pub mod constants;
pub mod error;
pub mod gatt;
pub mod hci;
pub mod manager;
pub mod notification;
pub mod scanner;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use commands::{CommandFamily, CommandSender, HciCommand};
pub use connection::{Connection, ConnectionManager, ConnectionState, Connector};
pub use error::{AttError, ConfigError, ConnectError, ControllerError, WorkflowError};
pub use gatt::{GattClient, GattPeer};
pub use hci::Host;
pub use manager::{BluetoothManager, DiscoveredService, WorkflowOutcome};
pub use notification::{Notification, NotificationCallback, NotificationForwarder, Subscription};
pub use scanner::{AdvertisementScanner, AdvertisementSink, BluetoothScanner};
pub use transport::Transport;
pub use types::{
    Address, AddressType, AdvertisementRecord, Characteristic, CharacteristicProperties,
    Descriptor, Phy, Service,
};
