//! Advertising data (AD structure) parsing.

use uuid::Uuid;

use crate::core::bluetooth::types::{uuid_from_le_slice, uuid_from_u16};

mod ad_types {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_16: u8 = 0x02;
    pub const COMPLETE_16: u8 = 0x03;
    pub const INCOMPLETE_32: u8 = 0x04;
    pub const COMPLETE_32: u8 = 0x05;
    pub const INCOMPLETE_128: u8 = 0x06;
    pub const COMPLETE_128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const APPEARANCE: u8 = 0x19;
    pub const SERVICE_DATA_32: u8 = 0x20;
    pub const SERVICE_DATA_128: u8 = 0x21;
    pub const MANUFACTURER_SPECIFIC: u8 = 0xFF;
}

/// One parsed AD structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdStructure {
    Flags(u8),
    ServiceUuids { complete: bool, uuids: Vec<Uuid> },
    LocalName { complete: bool, name: String },
    TxPowerLevel(i8),
    ServiceData { uuid: Uuid, data: Vec<u8> },
    Appearance(u16),
    ManufacturerData { company_id: u16, data: Vec<u8> },
    /// Unknown types and structures whose payload did not fit their type
    Other { ad_type: u8, data: Vec<u8> },
}

/// Parses every well-formed AD structure in `data`.
///
/// Parsing stops at a zero length byte (the remainder is padding) or at a
/// structure whose length runs past the end of the buffer.
pub fn parse(data: &[u8]) -> Vec<AdStructure> {
    let mut structures = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            break;
        }
        let ad_type = data[i + 1];
        let payload = &data[i + 2..i + 1 + len];
        structures.push(parse_structure(ad_type, payload));
        i += len + 1;
    }
    structures
}

fn parse_structure(ad_type: u8, payload: &[u8]) -> AdStructure {
    use ad_types::*;

    let parsed = match ad_type {
        FLAGS if payload.len() == 1 => Some(AdStructure::Flags(payload[0])),
        INCOMPLETE_16 | COMPLETE_16 => uuid_list(payload, 2, ad_type == COMPLETE_16),
        INCOMPLETE_32 | COMPLETE_32 => uuid_list(payload, 4, ad_type == COMPLETE_32),
        INCOMPLETE_128 | COMPLETE_128 => uuid_list(payload, 16, ad_type == COMPLETE_128),
        SHORTENED_LOCAL_NAME | COMPLETE_LOCAL_NAME => Some(AdStructure::LocalName {
            complete: ad_type == COMPLETE_LOCAL_NAME,
            name: String::from_utf8_lossy(payload).into_owned(),
        }),
        TX_POWER_LEVEL if payload.len() == 1 => Some(AdStructure::TxPowerLevel(payload[0] as i8)),
        SERVICE_DATA_16 => service_data(payload, 2),
        SERVICE_DATA_32 => service_data(payload, 4),
        SERVICE_DATA_128 => service_data(payload, 16),
        APPEARANCE if payload.len() == 2 => {
            Some(AdStructure::Appearance(u16::from_le_bytes([payload[0], payload[1]])))
        }
        MANUFACTURER_SPECIFIC if payload.len() >= 2 => Some(AdStructure::ManufacturerData {
            company_id: u16::from_le_bytes([payload[0], payload[1]]),
            data: payload[2..].to_vec(),
        }),
        _ => None,
    };

    parsed.unwrap_or_else(|| AdStructure::Other {
        ad_type,
        data: payload.to_vec(),
    })
}

fn uuid_list(payload: &[u8], width: usize, complete: bool) -> Option<AdStructure> {
    if payload.len() % width != 0 {
        log::debug!("AD malformed: UUID list of {} bytes with {} byte entries", payload.len(), width);
        return None;
    }
    let uuids = payload
        .chunks_exact(width)
        .filter_map(uuid_from_le_slice)
        .collect();
    Some(AdStructure::ServiceUuids { complete, uuids })
}

fn service_data(payload: &[u8], width: usize) -> Option<AdStructure> {
    if payload.len() < width {
        return None;
    }
    let uuid = uuid_from_le_slice(&payload[..width])?;
    Some(AdStructure::ServiceData {
        uuid,
        data: payload[width..].to_vec(),
    })
}

/// Convenience check used by filters: does the data advertise `service`?
pub fn advertises_service(data: &[AdStructure], service: u16) -> bool {
    let wanted = uuid_from_u16(service);
    data.iter().any(|ad| match ad {
        AdStructure::ServiceUuids { uuids, .. } => uuids.contains(&wanted),
        _ => false,
    })
}
