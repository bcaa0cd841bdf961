//! A scripted controller on the far end of an in-memory transport

#![allow(dead_code)]

use std::time::Duration;

use ble_central_lib::core::bluetooth::att::{AttPdu, GroupEntry};
use ble_central_lib::core::bluetooth::constants::{ATT_CID, att_errors, opcodes};
use ble_central_lib::core::bluetooth::hci::{AclReassembler, encode_acl};
use ble_central_lib::core::bluetooth::transport::{H4Codec, HciPacket};
use ble_central_lib::core::bluetooth::types::{uuid_from_u16, Address};
use ble_central_lib::core::bluetooth::{Host, Transport};
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use uuid::Uuid;

pub const HANDLE: u16 = 0x0040;

pub fn peer() -> Address {
    "AA:BB:CC:DD:EE:FF".parse().unwrap()
}

/// Host wired to a fake controller. Must be called inside a runtime.
pub fn host_pair() -> (Host, FakeController) {
    let (host_side, controller_side) = tokio::io::duplex(64 * 1024);
    let host = Host::new(Transport::from_stream(host_side), Duration::from_secs(5));
    let controller = FakeController {
        framed: Framed::new(controller_side, H4Codec),
    };
    (host, controller)
}

pub struct FakeController {
    framed: Framed<DuplexStream, H4Codec>,
}

impl FakeController {
    pub async fn next_packet(&mut self) -> HciPacket {
        self.framed
            .next()
            .await
            .expect("host closed the transport")
            .expect("host sent a malformed packet")
    }

    /// True when the host sends nothing for `wait`
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.framed.next()).await.is_err()
    }

    pub async fn send(&mut self, packet: HciPacket) {
        self.framed.send(packet).await.unwrap();
    }

    pub async fn event(&mut self, code: u8, params: &[u8]) {
        let mut bytes = vec![code, params.len() as u8];
        bytes.extend_from_slice(params);
        self.send(HciPacket::Event(bytes)).await;
    }

    /// Next command as (opcode, parameters)
    pub async fn expect_command(&mut self) -> (u16, Vec<u8>) {
        match self.next_packet().await {
            HciPacket::Command(bytes) => {
                let opcode = u16::from_le_bytes([bytes[0], bytes[1]]);
                assert_eq!(bytes[2] as usize, bytes.len() - 3);
                (opcode, bytes[3..].to_vec())
            }
            other => panic!("expected a command, got {:?}", other),
        }
    }

    pub async fn command_complete(&mut self, opcode: u16, status: u8) {
        let [lo, hi] = opcode.to_le_bytes();
        self.event(0x0E, &[0x01, lo, hi, status]).await;
    }

    pub async fn command_status(&mut self, opcode: u16, status: u8) {
        let [lo, hi] = opcode.to_le_bytes();
        self.event(0x0F, &[status, 0x01, lo, hi]).await;
    }

    /// Reads one command and acknowledges it the way a controller would
    pub async fn answer_command(&mut self) -> (u16, Vec<u8>) {
        self.answer_command_with(0x00).await
    }

    pub async fn answer_command_with(&mut self, status: u8) -> (u16, Vec<u8>) {
        let (opcode, params) = self.expect_command().await;
        match opcode {
            opcodes::LE_CREATE_CONNECTION
            | opcodes::LE_EXTENDED_CREATE_CONNECTION
            | opcodes::DISCONNECT => {
                self.command_status(opcode, status).await
            }
            _ => self.command_complete(opcode, status).await,
        }
        (opcode, params)
    }

    /// Legacy ADV_IND report
    pub async fn advertise(&mut self, address: Address, data: &[u8], rssi: i8) {
        let mut params = vec![0x02, 0x01, 0x00, address.address_type().hci_code()];
        params.extend_from_slice(&address.to_le_bytes());
        params.push(data.len() as u8);
        params.extend_from_slice(data);
        params.push(rssi as u8);
        self.event(0x3E, &params).await;
    }

    pub async fn connection_complete(&mut self, status: u8, handle: u16, peer: Address) {
        let mut params = vec![0x01, status];
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(0x00); // central
        params.push(peer.address_type().hci_code());
        params.extend_from_slice(&peer.to_le_bytes());
        params.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0x90, 0x01, 0x00]);
        self.event(0x3E, &params).await;
    }

    /// Connection complete in the layout sent after extended create connection
    pub async fn enhanced_connection_complete(&mut self, status: u8, handle: u16, peer: Address) {
        let mut params = vec![0x0A, status];
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(0x00); // central
        params.push(peer.address_type().hci_code());
        params.extend_from_slice(&peer.to_le_bytes());
        params.extend_from_slice(&[0x00; 12]);
        params.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0x90, 0x01, 0x00]);
        self.event(0x3E, &params).await;
    }

    pub async fn disconnection(&mut self, handle: u16, reason: u8) {
        let [lo, hi] = handle.to_le_bytes();
        self.event(0x05, &[0x00, lo, hi, reason]).await;
    }

    pub async fn send_att(&mut self, handle: u16, pdu: &AttPdu) {
        self.send(HciPacket::AclData(encode_acl(handle, ATT_CID, &pdu.encode())))
            .await;
    }

    /// ATT bytes sent as-is, without going through the encoder
    pub async fn send_raw_att(&mut self, handle: u16, bytes: &[u8]) {
        self.send(HciPacket::AclData(encode_acl(handle, ATT_CID, bytes)))
            .await;
    }

    pub async fn expect_att(&mut self) -> (u16, AttPdu) {
        match self.next_packet().await {
            HciPacket::AclData(bytes) => {
                let (handle, cid, payload) = AclReassembler::default()
                    .push(&bytes)
                    .unwrap()
                    .expect("ATT PDU in a single fragment");
                assert_eq!(cid, ATT_CID);
                (handle, AttPdu::decode(&payload).unwrap())
            }
            other => panic!("expected ACL data, got {:?}", other),
        }
    }

    /// Answers one ATT request from `db` and returns it
    pub async fn serve_att(&mut self, db: &AttributeDb) -> AttPdu {
        let (handle, request) = self.expect_att().await;
        let response = db.respond(&request);
        self.send_att(handle, &response).await;
        request
    }

    /// Serves requests until the host writes an attribute; returns (handle, value)
    pub async fn serve_until_write(&mut self, db: &AttributeDb) -> (u16, Vec<u8>) {
        loop {
            if let AttPdu::WriteRequest { handle, value } = self.serve_att(db).await {
                return (handle, value);
            }
        }
    }

    /// Lets the host connect to `peer` on `handle`; returns the create connection opcode
    pub async fn accept_connection(&mut self, handle: u16, peer: Address) -> u16 {
        let (opcode, _) = self.answer_command().await;
        match opcode {
            opcodes::LE_CREATE_CONNECTION => self.connection_complete(0x00, handle, peer).await,
            opcodes::LE_EXTENDED_CREATE_CONNECTION => {
                self.enhanced_connection_complete(0x00, handle, peer).await
            }
            other => panic!("expected create connection, got 0x{:04x}", other),
        }
        opcode
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub handle: u16,
    pub attribute_type: Uuid,
    pub value: Vec<u8>,
    /// Last handle of the group, for service declarations
    pub group_end: u16,
}

/// A tiny attribute server answering one entry per response
#[derive(Debug, Clone, Default)]
pub struct AttributeDb {
    pub attributes: Vec<Attribute>,
}

impl AttributeDb {
    pub fn service(mut self, handle: u16, end: u16, uuid: u16) -> Self {
        self.attributes.push(Attribute {
            handle,
            attribute_type: uuid_from_u16(0x2800),
            value: uuid.to_le_bytes().to_vec(),
            group_end: end,
        });
        self
    }

    /// Declaration at `handle`, value right after it
    pub fn characteristic(mut self, handle: u16, properties: u8, uuid: u16) -> Self {
        let value_handle = handle + 1;
        let mut declaration = vec![properties];
        declaration.extend_from_slice(&value_handle.to_le_bytes());
        declaration.extend_from_slice(&uuid.to_le_bytes());
        self.attributes.push(Attribute {
            handle,
            attribute_type: uuid_from_u16(0x2803),
            value: declaration,
            group_end: handle,
        });
        self.attributes.push(Attribute {
            handle: value_handle,
            attribute_type: uuid_from_u16(uuid),
            value: vec![0x00],
            group_end: value_handle,
        });
        self
    }

    pub fn cccd(mut self, handle: u16) -> Self {
        self.attributes.push(Attribute {
            handle,
            attribute_type: uuid_from_u16(0x2902),
            value: vec![0x00, 0x00],
            group_end: handle,
        });
        self
    }

    /// One heart rate service [1..4] with a notifying measurement at handle 3
    pub fn heart_rate() -> Self {
        Self::default()
            .service(0x0001, 0x0004, 0x180D)
            .characteristic(0x0002, 0x10, 0x2A37)
            .cccd(0x0004)
    }

    fn find(&self, start: u16, end: u16, attribute_type: Option<Uuid>) -> Option<&Attribute> {
        let mut matching: Vec<&Attribute> = self
            .attributes
            .iter()
            .filter(|a| (start..=end).contains(&a.handle))
            .filter(|a| attribute_type.is_none_or(|t| a.attribute_type == t))
            .collect();
        matching.sort_by_key(|a| a.handle);
        matching.first().copied()
    }

    pub fn respond(&self, request: &AttPdu) -> AttPdu {
        let not_found = |start: u16| AttPdu::ErrorResponse {
            request_opcode: request.opcode(),
            handle: start,
            code: att_errors::ATTRIBUTE_NOT_FOUND,
        };
        match request {
            AttPdu::ExchangeMtuRequest(_) => AttPdu::ExchangeMtuResponse(185),
            AttPdu::ReadByGroupTypeRequest {
                start,
                end,
                group_type,
            } => match self.find(*start, *end, Some(*group_type)) {
                Some(a) => AttPdu::ReadByGroupTypeResponse(vec![GroupEntry {
                    handle: a.handle,
                    end_handle: a.group_end,
                    value: a.value.clone(),
                }]),
                None => not_found(*start),
            },
            AttPdu::ReadByTypeRequest {
                start,
                end,
                attribute_type,
            } => match self.find(*start, *end, Some(*attribute_type)) {
                Some(a) => AttPdu::ReadByTypeResponse(vec![(a.handle, a.value.clone())]),
                None => not_found(*start),
            },
            AttPdu::FindInformationRequest { start, end } => match self.find(*start, *end, None) {
                Some(a) => AttPdu::FindInformationResponse(vec![(a.handle, a.attribute_type)]),
                None => not_found(*start),
            },
            AttPdu::ReadRequest(handle) => match self.find(*handle, *handle, None) {
                Some(a) => AttPdu::ReadResponse(a.value.clone()),
                None => AttPdu::ErrorResponse {
                    request_opcode: request.opcode(),
                    handle: *handle,
                    code: att_errors::INVALID_HANDLE,
                },
            },
            AttPdu::WriteRequest { .. } => AttPdu::WriteResponse,
            other => AttPdu::ErrorResponse {
                request_opcode: other.opcode(),
                handle: 0,
                code: att_errors::REQUEST_NOT_SUPPORTED,
            },
        }
    }
}
