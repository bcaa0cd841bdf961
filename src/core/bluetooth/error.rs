//! Error types for the Bluetooth stack

use thiserror::Error;

/// Invalid configuration values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Scan interval {0} ms is outside 2.5..=10240 ms")]
    InvalidScanInterval(u32),
    #[error("Scan window {0} ms is outside 2.5..=10240 ms")]
    InvalidScanWindow(u32),
    #[error("Scan window ({window} ms) must not exceed scan interval ({interval} ms)")]
    WindowExceedsInterval { window: u32, interval: u32 },
    #[error("Unsupported PHY: {0}")]
    UnsupportedPhy(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid transport specification: {0}")]
    InvalidTransport(String),
    #[error("Invalid connection parameters: {0}")]
    InvalidConnectionParameters(String),
}

/// Transport or controller-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Transport closed")]
    Closed,
    #[error("Command 0x{opcode:04x} failed with status 0x{status:02x}")]
    CommandFailed { opcode: u16, status: u8 },
    #[error("Timed out waiting for command 0x{0:04x}")]
    Timeout(u16),
    #[error("Malformed packet: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self {
        ControllerError::Transport(e.to_string())
    }
}

/// Connection attempt outcomes and stale-handle use
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Connection attempt timed out")]
    Timeout,
    #[error("Connection rejected with status 0x{0:02x}")]
    Rejected(u8),
    #[error("Not connected")]
    NotConnected,
    #[error("Another connection attempt is already pending")]
    AlreadyPending,
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Attribute protocol failures during discovery and subscription
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttError {
    #[error("Malformed ATT PDU: {0}")]
    Malformed(String),
    #[error("Characteristic does not support notifications or indications")]
    NotNotifiable,
    #[error("Not connected")]
    NotConnected,
    #[error("ATT request timed out")]
    Timeout,
    #[error("ATT error 0x{code:02x} for request 0x{request_opcode:02x} on handle 0x{handle:04x}")]
    Protocol { request_opcode: u8, handle: u16, code: u8 },
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl From<ConnectError> for AttError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Controller(inner) => AttError::Controller(inner),
            _ => AttError::NotConnected,
        }
    }
}

/// Failures of the connect-and-discover stage of the workflow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("GATT discovery failed: {0}")]
    Att(#[from] AttError),
}

impl WorkflowError {
    /// Whether reconnecting may cure this failure
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Connect(ConnectError::Timeout)
                | WorkflowError::Connect(ConnectError::Rejected(_))
                | WorkflowError::Att(AttError::NotConnected)
                | WorkflowError::Att(AttError::Timeout)
        )
    }
}
