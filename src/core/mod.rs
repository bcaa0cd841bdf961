//! Core functionality of the BLE central
//! This module contains the Bluetooth host stack and the central workflow.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, WorkflowOutcome};
