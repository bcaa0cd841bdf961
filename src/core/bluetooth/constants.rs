//! Constants used throughout the Bluetooth stack
//! This module contains HCI opcodes and event codes, ATT opcodes and error
//! codes, well-known GATT UUIDs, and default timeouts.

/// How long to wait for the completion of a cancelled connection attempt
pub const CONNECT_CANCEL_SETTLE_MS: u64 = 1000;

/// Default transport the CLI connects to
pub const DEFAULT_TRANSPORT: &str = "tcp-client:localhost:9000";

/// HCI command opcodes (OGF << 10 | OCF)
pub mod opcodes {
    pub const SET_EVENT_MASK: u16 = 0x0C01;
    pub const RESET: u16 = 0x0C03;
    pub const DISCONNECT: u16 = 0x0406;
    pub const LE_SET_EVENT_MASK: u16 = 0x2001;
    pub const LE_SET_SCAN_PARAMETERS: u16 = 0x200B;
    pub const LE_SET_SCAN_ENABLE: u16 = 0x200C;
    pub const LE_CREATE_CONNECTION: u16 = 0x200D;
    pub const LE_CREATE_CONNECTION_CANCEL: u16 = 0x200E;
    pub const LE_SET_EXTENDED_SCAN_PARAMETERS: u16 = 0x2041;
    pub const LE_SET_EXTENDED_SCAN_ENABLE: u16 = 0x2042;
    pub const LE_EXTENDED_CREATE_CONNECTION: u16 = 0x2043;
}

/// HCI event codes
pub mod events {
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const LE_META: u8 = 0x3E;
}

/// LE meta event sub-event codes
pub mod le_events {
    pub const CONNECTION_COMPLETE: u8 = 0x01;
    pub const ADVERTISING_REPORT: u8 = 0x02;
    pub const ENHANCED_CONNECTION_COMPLETE: u8 = 0x0A;
    pub const EXTENDED_ADVERTISING_REPORT: u8 = 0x0D;
}

/// HCI status codes the host reacts to
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const UNKNOWN_CONNECTION_IDENTIFIER: u8 = 0x02;
    pub const COMMAND_DISALLOWED: u8 = 0x0C;
    pub const REMOTE_USER_TERMINATED_CONNECTION: u8 = 0x13;
    pub const CONNECTION_TERMINATED_BY_LOCAL_HOST: u8 = 0x16;
}

/// H4 packet indicators
pub mod packet_types {
    pub const COMMAND: u8 = 0x01;
    pub const ACL_DATA: u8 = 0x02;
    pub const EVENT: u8 = 0x04;
}

/// Events enabled by Set Event Mask: Disconnection Complete, Hardware Error, LE Meta
pub const EVENT_MASK: u64 = 0x2000_0000_0000_8010;

/// LE events enabled: Connection Complete, Advertising Report,
/// Enhanced Connection Complete, Extended Advertising Report
pub const LE_EVENT_MASK: u64 = 0x0000_0000_0000_1203;

/// ACL packet boundary flag for the first fragment of a non-flushable PDU
pub const ACL_PB_FIRST_NON_FLUSHABLE: u8 = 0b00;
/// ACL packet boundary flag for a continuing fragment
pub const ACL_PB_CONTINUING: u8 = 0b01;

/// L2CAP fixed channel carrying ATT
pub const ATT_CID: u16 = 0x0004;

/// ATT protocol opcodes
pub mod att_opcodes {
    pub const ERROR_RESPONSE: u8 = 0x01;
    pub const EXCHANGE_MTU_REQUEST: u8 = 0x02;
    pub const EXCHANGE_MTU_RESPONSE: u8 = 0x03;
    pub const FIND_INFORMATION_REQUEST: u8 = 0x04;
    pub const FIND_INFORMATION_RESPONSE: u8 = 0x05;
    pub const READ_BY_TYPE_REQUEST: u8 = 0x08;
    pub const READ_BY_TYPE_RESPONSE: u8 = 0x09;
    pub const READ_REQUEST: u8 = 0x0A;
    pub const READ_RESPONSE: u8 = 0x0B;
    pub const READ_BY_GROUP_TYPE_REQUEST: u8 = 0x10;
    pub const READ_BY_GROUP_TYPE_RESPONSE: u8 = 0x11;
    pub const WRITE_REQUEST: u8 = 0x12;
    pub const WRITE_RESPONSE: u8 = 0x13;
    pub const HANDLE_VALUE_NOTIFICATION: u8 = 0x1B;
    pub const HANDLE_VALUE_INDICATION: u8 = 0x1D;
    pub const HANDLE_VALUE_CONFIRMATION: u8 = 0x1E;
}

/// ATT error codes
pub mod att_errors {
    pub const INVALID_HANDLE: u8 = 0x01;
    pub const REQUEST_NOT_SUPPORTED: u8 = 0x06;
    pub const ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
}

/// Minimum (and default) ATT MTU on LE
pub const DEFAULT_ATT_MTU: u16 = 23;

/// First and last valid attribute handles
pub const FIRST_ATTRIBUTE_HANDLE: u16 = 0x0001;
pub const LAST_ATTRIBUTE_HANDLE: u16 = 0xFFFF;

/// GATT attribute type: Primary Service declaration
pub const UUID_PRIMARY_SERVICE: u16 = 0x2800;
/// GATT attribute type: Characteristic declaration
pub const UUID_CHARACTERISTIC: u16 = 0x2803;
/// Client Characteristic Configuration descriptor
pub const UUID_CLIENT_CHARACTERISTIC_CONFIGURATION: u16 = 0x2902;

/// CCCD values
pub const CCCD_DISABLED: u16 = 0x0000;
pub const CCCD_NOTIFY: u16 = 0x0001;
pub const CCCD_INDICATE: u16 = 0x0002;

/// Time to wait for the first advertisement
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 5;

/// Time to wait for a connection to be established
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// ATT transaction timeout
pub const DEFAULT_ATT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Time to wait for Command Complete / Command Status
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 5;

/// Scan interval and window defaults in milliseconds
pub const DEFAULT_SCAN_INTERVAL_MS: u32 = 60;
pub const DEFAULT_SCAN_WINDOW_MS: u32 = 60;

/// Initiator connection parameters (1.25 ms units for intervals, 10 ms units for timeout)
pub const DEFAULT_CONN_INTERVAL_MIN: u16 = 0x18;
pub const DEFAULT_CONN_INTERVAL_MAX: u16 = 0x28;
pub const DEFAULT_CONN_LATENCY: u16 = 0;
pub const DEFAULT_SUPERVISION_TIMEOUT: u16 = 400;

/// MTU requested after connecting
pub const DEFAULT_PREFERRED_MTU: u16 = 247;
