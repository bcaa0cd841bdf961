//! HCI commands the host issues to the controller
//! This module contains every command the central workflow sends, their
//! encoding, and the trait through which they are sent.

use async_trait::async_trait;
use bytes::BufMut;

use crate::core::bluetooth::constants::opcodes;
use crate::core::bluetooth::error::ControllerError;
use crate::core::bluetooth::types::{Address, Phy};

/// Per-PHY parameters of the extended scan command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPhyParameters {
    pub phy: Phy,
    pub active: bool,
    /// 0.625 ms units
    pub interval: u16,
    /// 0.625 ms units
    pub window: u16,
}

/// Parameters of LE Create Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateConnectionParameters {
    pub peer: Address,
    /// 0.625 ms units
    pub scan_interval: u16,
    /// 0.625 ms units
    pub scan_window: u16,
    /// 1.25 ms units
    pub interval_min: u16,
    /// 1.25 ms units
    pub interval_max: u16,
    pub max_latency: u16,
    /// 10 ms units
    pub supervision_timeout: u16,
}

/// Legacy and extended LE commands must not be mixed between two resets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Legacy,
    Extended,
}

/// HCI commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciCommand {
    Reset,
    SetEventMask(u64),
    LeSetEventMask(u64),
    LeSetScanParameters {
        active: bool,
        interval: u16,
        window: u16,
    },
    LeSetScanEnable {
        enable: bool,
        filter_duplicates: bool,
    },
    LeSetExtendedScanParameters {
        phys: Vec<ScanPhyParameters>,
    },
    LeSetExtendedScanEnable {
        enable: bool,
        filter_duplicates: bool,
    },
    LeCreateConnection(CreateConnectionParameters),
    /// Same parameters applied on every listed initiating PHY
    LeExtendedCreateConnection {
        params: CreateConnectionParameters,
        phys: Vec<Phy>,
    },
    LeCreateConnectionCancel,
    Disconnect {
        handle: u16,
        reason: u8,
    },
}

impl HciCommand {
    pub fn opcode(&self) -> u16 {
        match self {
            Self::Reset => opcodes::RESET,
            Self::SetEventMask(_) => opcodes::SET_EVENT_MASK,
            Self::LeSetEventMask(_) => opcodes::LE_SET_EVENT_MASK,
            Self::LeSetScanParameters { .. } => opcodes::LE_SET_SCAN_PARAMETERS,
            Self::LeSetScanEnable { .. } => opcodes::LE_SET_SCAN_ENABLE,
            Self::LeSetExtendedScanParameters { .. } => opcodes::LE_SET_EXTENDED_SCAN_PARAMETERS,
            Self::LeSetExtendedScanEnable { .. } => opcodes::LE_SET_EXTENDED_SCAN_ENABLE,
            Self::LeCreateConnection(_) => opcodes::LE_CREATE_CONNECTION,
            Self::LeExtendedCreateConnection { .. } => opcodes::LE_EXTENDED_CREATE_CONNECTION,
            Self::LeCreateConnectionCancel => opcodes::LE_CREATE_CONNECTION_CANCEL,
            Self::Disconnect { .. } => opcodes::DISCONNECT,
        }
    }

    /// Which LE command family this belongs to, if either
    pub fn family(&self) -> Option<CommandFamily> {
        match self {
            Self::LeSetScanParameters { .. }
            | Self::LeSetScanEnable { .. }
            | Self::LeCreateConnection(_) => Some(CommandFamily::Legacy),
            Self::LeSetExtendedScanParameters { .. }
            | Self::LeSetExtendedScanEnable { .. }
            | Self::LeExtendedCreateConnection { .. } => Some(CommandFamily::Extended),
            _ => None,
        }
    }

    /// Command parameters in controller byte order
    pub fn parameters(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            Self::Reset | Self::LeCreateConnectionCancel => {}
            Self::SetEventMask(mask) | Self::LeSetEventMask(mask) => p.put_u64_le(*mask),
            Self::LeSetScanParameters {
                active,
                interval,
                window,
            } => {
                p.put_u8(*active as u8);
                p.put_u16_le(*interval);
                p.put_u16_le(*window);
                p.put_u8(0x00); // own address type: public
                p.put_u8(0x00); // accept all advertisements
            }
            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => {
                p.put_u8(*enable as u8);
                p.put_u8(*filter_duplicates as u8);
            }
            Self::LeSetExtendedScanParameters { phys } => {
                p.put_u8(0x00); // own address type: public
                p.put_u8(0x00); // accept all advertisements
                p.put_u8(phys.iter().fold(0, |bits, entry| bits | entry.phy.scanning_bit()));
                // Entries are ordered by PHY bit, as the controller expects
                let mut ordered = phys.clone();
                ordered.sort_by_key(|entry| entry.phy.scanning_bit());
                for entry in ordered {
                    p.put_u8(entry.active as u8);
                    p.put_u16_le(entry.interval);
                    p.put_u16_le(entry.window);
                }
            }
            Self::LeSetExtendedScanEnable {
                enable,
                filter_duplicates,
            } => {
                p.put_u8(*enable as u8);
                p.put_u8(*filter_duplicates as u8);
                p.put_u16_le(0); // duration: until disabled
                p.put_u16_le(0); // period: continuous
            }
            Self::LeCreateConnection(params) => {
                p.put_u16_le(params.scan_interval);
                p.put_u16_le(params.scan_window);
                p.put_u8(0x00); // use the peer address, not the filter accept list
                p.put_u8(params.peer.address_type().hci_code());
                p.put_slice(&params.peer.to_le_bytes());
                p.put_u8(0x00); // own address type: public
                p.put_u16_le(params.interval_min);
                p.put_u16_le(params.interval_max);
                p.put_u16_le(params.max_latency);
                p.put_u16_le(params.supervision_timeout);
                p.put_u16_le(0); // min CE length
                p.put_u16_le(0); // max CE length
            }
            Self::LeExtendedCreateConnection { params, phys } => {
                p.put_u8(0x00); // use the peer address, not the filter accept list
                p.put_u8(0x00); // own address type: public
                p.put_u8(params.peer.address_type().hci_code());
                p.put_slice(&params.peer.to_le_bytes());
                let mut ordered = phys.clone();
                ordered.sort_by_key(|phy| phy.scanning_bit());
                ordered.dedup();
                p.put_u8(ordered.iter().fold(0, |bits, phy| bits | phy.scanning_bit()));
                for _ in &ordered {
                    p.put_u16_le(params.scan_interval);
                    p.put_u16_le(params.scan_window);
                    p.put_u16_le(params.interval_min);
                    p.put_u16_le(params.interval_max);
                    p.put_u16_le(params.max_latency);
                    p.put_u16_le(params.supervision_timeout);
                    p.put_u16_le(0); // min CE length
                    p.put_u16_le(0); // max CE length
                }
            }
            Self::Disconnect { handle, reason } => {
                p.put_u16_le(*handle);
                p.put_u8(*reason);
            }
        }
        p
    }

    /// Full command packet: opcode, parameter length, parameters
    pub fn to_bytes(&self) -> Vec<u8> {
        let params = self.parameters();
        let mut bytes = Vec::with_capacity(3 + params.len());
        bytes.put_u16_le(self.opcode());
        bytes.put_u8(params.len() as u8);
        bytes.extend_from_slice(&params);
        bytes
    }
}

/// Command sender trait
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Send a command and wait for its Command Complete or Command Status.
    /// Returns the return parameters after the status byte (empty for Command Status).
    async fn send_command(&self, command: HciCommand) -> Result<Vec<u8>, ControllerError>;
}
