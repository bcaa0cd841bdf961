//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::bluetooth::adv_data::AdStructure;
use crate::core::bluetooth::error::ConfigError;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2})(?:/([PRpr]))?$")
        .expect("address pattern is valid")
});

/// Bluetooth base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Type tag of a device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    /// Maps an HCI address type code. Identity types collapse onto their base type.
    pub fn from_hci(code: u8) -> Option<Self> {
        match code {
            0x00 | 0x02 => Some(AddressType::Public),
            0x01 | 0x03 => Some(AddressType::Random),
            _ => None,
        }
    }

    pub fn hci_code(self) -> u8 {
        match self {
            AddressType::Public => 0x00,
            AddressType::Random => 0x01,
        }
    }
}

/// A 6-byte device address plus its type. Bytes are stored most significant first.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    bytes: [u8; 6],
    address_type: AddressType,
}

impl Address {
    pub const fn new(bytes: [u8; 6], address_type: AddressType) -> Self {
        Self { bytes, address_type }
    }

    /// Builds an address from HCI (little-endian) byte order
    pub fn from_le_bytes(le: [u8; 6], address_type: AddressType) -> Self {
        let mut bytes = le;
        bytes.reverse();
        Self { bytes, address_type }
    }

    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut le = self.bytes;
        le.reverse();
        le
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.bytes
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.address_type {
            AddressType::Public => "P",
            AddressType::Random => "R",
        };
        write!(f, "{}/{}", self, tag)
    }
}

/// Parses `AA:BB:CC:DD:EE:FF`, optionally suffixed with `/P` or `/R`.
/// Addresses without a suffix are public.
impl FromStr for Address {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = ADDRESS_RE
            .captures(s.trim())
            .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;

        let mut bytes = [0u8; 6];
        for (i, part) in caps[1].split(|c| c == ':' || c == '-').enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
        }

        let address_type = match caps.get(2).map(|m| m.as_str()) {
            Some("R") | Some("r") => AddressType::Random,
            _ => AddressType::Public,
        };
        Ok(Self::new(bytes, address_type))
    }
}

/// LE physical layers the scanner can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phy {
    #[serde(rename = "1m")]
    Le1M,
    #[serde(rename = "coded")]
    LeCoded,
}

impl Phy {
    /// Bit in the Scanning_PHYs field of the extended scan commands
    pub fn scanning_bit(self) -> u8 {
        match self {
            Phy::Le1M => 0x01,
            Phy::LeCoded => 0x04,
        }
    }
}

impl fmt::Display for Phy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phy::Le1M => write!(f, "1m"),
            Phy::LeCoded => write!(f, "coded"),
        }
    }
}

impl FromStr for Phy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1m" => Ok(Phy::Le1M),
            "coded" => Ok(Phy::LeCoded),
            other => Err(ConfigError::UnsupportedPhy(other.to_string())),
        }
    }
}

/// A received advertisement, created once per report (or once per address
/// per session when duplicate filtering is on).
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
    pub address: Address,
    /// Signal strength in dBm
    pub rssi: i8,
    pub data: Vec<AdStructure>,
    pub connectable: bool,
    /// Position of this record within its scan session
    pub sequence: u64,
    pub discovered_at: Instant,
}

impl AdvertisementRecord {
    /// Complete or shortened local name, if advertised
    pub fn local_name(&self) -> Option<&str> {
        self.data.iter().find_map(|ad| match ad {
            AdStructure::LocalName { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// All advertised service UUIDs
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.data
            .iter()
            .filter_map(|ad| match ad {
                AdStructure::ServiceUuids { uuids, .. } => Some(uuids.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// A primary service and its attribute handle range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
}

impl Service {
    pub fn contains(&self, handle: u16) -> bool {
        (self.start_handle..=self.end_handle).contains(&handle)
    }
}

/// Characteristic property flags from the declaration
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "BROADCAST"),
        (Self::READ, "READ"),
        (Self::WRITE_WITHOUT_RESPONSE, "WRITE_WITHOUT_RESPONSE"),
        (Self::WRITE, "WRITE"),
        (Self::NOTIFY, "NOTIFY"),
        (Self::INDICATE, "INDICATE"),
        (Self::AUTHENTICATED_SIGNED_WRITES, "AUTHENTICATED_SIGNED_WRITES"),
        (Self::EXTENDED_PROPERTIES, "EXTENDED_PROPERTIES"),
    ];

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether a subscription may be made to this characteristic
    pub const fn can_subscribe(self) -> bool {
        self.contains(Self::NOTIFY) || self.contains(Self::INDICATE)
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

impl fmt::Debug for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self, self.0)
    }
}

/// A characteristic discovered inside a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub declaration_handle: u16,
    pub value_handle: u16,
    /// Last handle belonging to this characteristic (its descriptors end here)
    pub end_handle: u16,
    pub properties: CharacteristicProperties,
}

/// A characteristic descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub handle: u16,
    pub uuid: Uuid,
}

/// Expands a 16-bit assigned number over the Bluetooth base UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Expands a 32-bit assigned number over the Bluetooth base UUID
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Returns the 16-bit form when the UUID is derived from the base UUID
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !(0xFFFF_u128 << 96) == BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Decodes a little-endian 2, 4 or 16 byte UUID
pub fn uuid_from_le_slice(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid_from_u16(u16::from_le_bytes([bytes[0], bytes[1]]))),
        4 => Some(uuid_from_u32(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        16 => {
            let mut be = [0u8; 16];
            be.copy_from_slice(bytes);
            be.reverse();
            Some(Uuid::from_bytes(be))
        }
        _ => None,
    }
}

/// Encodes a UUID the way ATT expects it: 2 bytes when possible, else 16, little-endian
pub fn uuid_to_le_bytes(uuid: &Uuid) -> Vec<u8> {
    match short_uuid(uuid) {
        Some(short) => short.to_le_bytes().to_vec(),
        None => {
            let mut le = *uuid.as_bytes();
            le.reverse();
            le.to_vec()
        }
    }
}
