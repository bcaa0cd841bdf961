//! BLE central library
//! A minimal Bluetooth LE central: HCI transport, scanner, connection
//! manager, GATT client and the workflow tying them together.

pub mod config;
pub mod core;
pub mod logging;
pub mod utils;
