//! Attribute protocol PDUs
//! Encoding and validated decoding of the ATT PDUs a GATT client exchanges.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::core::bluetooth::constants::att_opcodes;
use crate::core::bluetooth::error::AttError;
use crate::core::bluetooth::types::{uuid_from_le_slice, uuid_to_le_bytes};

/// One entry of a Read By Group Type response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub handle: u16,
    pub end_handle: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorResponse {
        request_opcode: u8,
        handle: u16,
        code: u8,
    },
    ExchangeMtuRequest(u16),
    ExchangeMtuResponse(u16),
    FindInformationRequest {
        start: u16,
        end: u16,
    },
    FindInformationResponse(Vec<(u16, Uuid)>),
    ReadByTypeRequest {
        start: u16,
        end: u16,
        attribute_type: Uuid,
    },
    ReadByTypeResponse(Vec<(u16, Vec<u8>)>),
    ReadRequest(u16),
    ReadResponse(Vec<u8>),
    ReadByGroupTypeRequest {
        start: u16,
        end: u16,
        group_type: Uuid,
    },
    ReadByGroupTypeResponse(Vec<GroupEntry>),
    WriteRequest {
        handle: u16,
        value: Vec<u8>,
    },
    WriteResponse,
    HandleValueNotification {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueIndication {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueConfirmation,
    /// Any PDU this client does not interpret
    Unsupported { opcode: u8, data: Vec<u8> },
}

fn malformed(what: impl Into<String>) -> AttError {
    AttError::Malformed(what.into())
}

/// Whether `opcode` answers a client request. Responses have odd opcodes;
/// notifications and indications are odd too but arrive unsolicited.
pub fn is_response_opcode(opcode: u8) -> bool {
    opcode % 2 == 1
        && opcode != att_opcodes::HANDLE_VALUE_NOTIFICATION
        && opcode != att_opcodes::HANDLE_VALUE_INDICATION
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<(), AttError> {
    if buf.remaining() < len {
        return Err(malformed(format!("{} is shorter than {} bytes", what, len)));
    }
    Ok(())
}

/// Splits a list of fixed-length records, rejecting empty lists and stray bytes
fn records<'a>(data: &'a [u8], len: usize, what: &str) -> Result<std::slice::ChunksExact<'a, u8>, AttError> {
    if data.is_empty() || data.len() % len != 0 {
        return Err(malformed(format!(
            "{} carries {} bytes of {} byte records",
            what,
            data.len(),
            len
        )));
    }
    Ok(data.chunks_exact(len))
}

impl AttPdu {
    pub fn opcode(&self) -> u8 {
        use att_opcodes::*;
        match self {
            AttPdu::ErrorResponse { .. } => ERROR_RESPONSE,
            AttPdu::ExchangeMtuRequest(_) => EXCHANGE_MTU_REQUEST,
            AttPdu::ExchangeMtuResponse(_) => EXCHANGE_MTU_RESPONSE,
            AttPdu::FindInformationRequest { .. } => FIND_INFORMATION_REQUEST,
            AttPdu::FindInformationResponse(_) => FIND_INFORMATION_RESPONSE,
            AttPdu::ReadByTypeRequest { .. } => READ_BY_TYPE_REQUEST,
            AttPdu::ReadByTypeResponse(_) => READ_BY_TYPE_RESPONSE,
            AttPdu::ReadRequest(_) => READ_REQUEST,
            AttPdu::ReadResponse(_) => READ_RESPONSE,
            AttPdu::ReadByGroupTypeRequest { .. } => READ_BY_GROUP_TYPE_REQUEST,
            AttPdu::ReadByGroupTypeResponse(_) => READ_BY_GROUP_TYPE_RESPONSE,
            AttPdu::WriteRequest { .. } => WRITE_REQUEST,
            AttPdu::WriteResponse => WRITE_RESPONSE,
            AttPdu::HandleValueNotification { .. } => HANDLE_VALUE_NOTIFICATION,
            AttPdu::HandleValueIndication { .. } => HANDLE_VALUE_INDICATION,
            AttPdu::HandleValueConfirmation => HANDLE_VALUE_CONFIRMATION,
            AttPdu::Unsupported { opcode, .. } => *opcode,
        }
    }

    /// Whether the peer expects a response from us for this PDU
    pub fn expects_response(&self) -> bool {
        match self {
            AttPdu::ExchangeMtuRequest(_)
            | AttPdu::FindInformationRequest { .. }
            | AttPdu::ReadByTypeRequest { .. }
            | AttPdu::ReadRequest(_)
            | AttPdu::ReadByGroupTypeRequest { .. }
            | AttPdu::WriteRequest { .. } => true,
            // Requests have even opcodes; bit 6 marks commands
            AttPdu::Unsupported { opcode, .. } => opcode & 0x40 == 0 && opcode % 2 == 0,
            _ => false,
        }
    }

    /// Whether this PDU answers a request we sent
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            AttPdu::ErrorResponse { .. }
                | AttPdu::ExchangeMtuResponse(_)
                | AttPdu::FindInformationResponse(_)
                | AttPdu::ReadByTypeResponse(_)
                | AttPdu::ReadResponse(_)
                | AttPdu::ReadByGroupTypeResponse(_)
                | AttPdu::WriteResponse
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = vec![self.opcode()];
        match self {
            AttPdu::ErrorResponse {
                request_opcode,
                handle,
                code,
            } => {
                p.put_u8(*request_opcode);
                p.put_u16_le(*handle);
                p.put_u8(*code);
            }
            AttPdu::ExchangeMtuRequest(mtu) | AttPdu::ExchangeMtuResponse(mtu) => p.put_u16_le(*mtu),
            AttPdu::FindInformationRequest { start, end } => {
                p.put_u16_le(*start);
                p.put_u16_le(*end);
            }
            AttPdu::FindInformationResponse(entries) => {
                let wide = entries.iter().any(|(_, uuid)| uuid_to_le_bytes(uuid).len() == 16);
                p.put_u8(if wide { 0x02 } else { 0x01 });
                for (handle, uuid) in entries {
                    p.put_u16_le(*handle);
                    if wide {
                        let mut le = *uuid.as_bytes();
                        le.reverse();
                        p.put_slice(&le);
                    } else {
                        p.put_slice(&uuid_to_le_bytes(uuid));
                    }
                }
            }
            AttPdu::ReadByTypeRequest {
                start,
                end,
                attribute_type: uuid,
            }
            | AttPdu::ReadByGroupTypeRequest {
                start,
                end,
                group_type: uuid,
            } => {
                p.put_u16_le(*start);
                p.put_u16_le(*end);
                p.put_slice(&uuid_to_le_bytes(uuid));
            }
            AttPdu::ReadByTypeResponse(entries) => {
                let len = entries.first().map_or(2, |(_, value)| 2 + value.len());
                p.put_u8(len as u8);
                for (handle, value) in entries {
                    p.put_u16_le(*handle);
                    p.put_slice(value);
                }
            }
            AttPdu::ReadRequest(handle) => p.put_u16_le(*handle),
            AttPdu::ReadResponse(value) => p.put_slice(value),
            AttPdu::ReadByGroupTypeResponse(entries) => {
                let len = entries.first().map_or(4, |entry| 4 + entry.value.len());
                p.put_u8(len as u8);
                for entry in entries {
                    p.put_u16_le(entry.handle);
                    p.put_u16_le(entry.end_handle);
                    p.put_slice(&entry.value);
                }
            }
            AttPdu::WriteRequest { handle, value }
            | AttPdu::HandleValueNotification { handle, value }
            | AttPdu::HandleValueIndication { handle, value } => {
                p.put_u16_le(*handle);
                p.put_slice(value);
            }
            AttPdu::WriteResponse | AttPdu::HandleValueConfirmation => {}
            AttPdu::Unsupported { data, .. } => p.put_slice(data),
        }
        p
    }

    pub fn decode(pdu: &[u8]) -> Result<Self, AttError> {
        use att_opcodes::*;

        let Some((&opcode, mut buf)) = pdu.split_first() else {
            return Err(malformed("empty PDU"));
        };
        let pdu = match opcode {
            ERROR_RESPONSE => {
                need(buf, 4, "Error Response")?;
                AttPdu::ErrorResponse {
                    request_opcode: buf.get_u8(),
                    handle: buf.get_u16_le(),
                    code: buf.get_u8(),
                }
            }
            EXCHANGE_MTU_REQUEST => {
                need(buf, 2, "Exchange MTU Request")?;
                AttPdu::ExchangeMtuRequest(buf.get_u16_le())
            }
            EXCHANGE_MTU_RESPONSE => {
                need(buf, 2, "Exchange MTU Response")?;
                AttPdu::ExchangeMtuResponse(buf.get_u16_le())
            }
            FIND_INFORMATION_REQUEST => {
                need(buf, 4, "Find Information Request")?;
                AttPdu::FindInformationRequest {
                    start: buf.get_u16_le(),
                    end: buf.get_u16_le(),
                }
            }
            FIND_INFORMATION_RESPONSE => {
                need(buf, 1, "Find Information Response")?;
                let uuid_len = match buf.get_u8() {
                    0x01 => 2,
                    0x02 => 16,
                    other => {
                        return Err(malformed(format!("Find Information format 0x{:02x}", other)));
                    }
                };
                let entries = records(buf, 2 + uuid_len, "Find Information Response")?
                    .filter_map(|record| {
                        let handle = u16::from_le_bytes([record[0], record[1]]);
                        uuid_from_le_slice(&record[2..]).map(|uuid| (handle, uuid))
                    })
                    .collect();
                AttPdu::FindInformationResponse(entries)
            }
            READ_BY_TYPE_REQUEST | READ_BY_GROUP_TYPE_REQUEST => {
                need(buf, 6, "Read By Type Request")?;
                let start = buf.get_u16_le();
                let end = buf.get_u16_le();
                let uuid = uuid_from_le_slice(buf)
                    .ok_or_else(|| malformed(format!("attribute type of {} bytes", buf.len())))?;
                if opcode == READ_BY_TYPE_REQUEST {
                    AttPdu::ReadByTypeRequest {
                        start,
                        end,
                        attribute_type: uuid,
                    }
                } else {
                    AttPdu::ReadByGroupTypeRequest {
                        start,
                        end,
                        group_type: uuid,
                    }
                }
            }
            READ_BY_TYPE_RESPONSE => {
                need(buf, 1, "Read By Type Response")?;
                let len = buf.get_u8() as usize;
                if len < 2 {
                    return Err(malformed(format!("Read By Type record length {}", len)));
                }
                let entries = records(buf, len, "Read By Type Response")?
                    .map(|record| (u16::from_le_bytes([record[0], record[1]]), record[2..].to_vec()))
                    .collect();
                AttPdu::ReadByTypeResponse(entries)
            }
            READ_REQUEST => {
                need(buf, 2, "Read Request")?;
                AttPdu::ReadRequest(buf.get_u16_le())
            }
            READ_RESPONSE => AttPdu::ReadResponse(buf.to_vec()),
            READ_BY_GROUP_TYPE_RESPONSE => {
                need(buf, 1, "Read By Group Type Response")?;
                let len = buf.get_u8() as usize;
                if len < 4 {
                    return Err(malformed(format!("Read By Group Type record length {}", len)));
                }
                let entries = records(buf, len, "Read By Group Type Response")?
                    .map(|record| GroupEntry {
                        handle: u16::from_le_bytes([record[0], record[1]]),
                        end_handle: u16::from_le_bytes([record[2], record[3]]),
                        value: record[4..].to_vec(),
                    })
                    .collect();
                AttPdu::ReadByGroupTypeResponse(entries)
            }
            WRITE_REQUEST | HANDLE_VALUE_NOTIFICATION | HANDLE_VALUE_INDICATION => {
                need(buf, 2, "handle")?;
                let handle = buf.get_u16_le();
                let value = buf.to_vec();
                match opcode {
                    WRITE_REQUEST => AttPdu::WriteRequest { handle, value },
                    HANDLE_VALUE_NOTIFICATION => AttPdu::HandleValueNotification { handle, value },
                    _ => AttPdu::HandleValueIndication { handle, value },
                }
            }
            WRITE_RESPONSE => AttPdu::WriteResponse,
            HANDLE_VALUE_CONFIRMATION => AttPdu::HandleValueConfirmation,
            _ => AttPdu::Unsupported {
                opcode,
                data: buf.to_vec(),
            },
        };
        Ok(pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::uuid_from_u16;

    #[test]
    fn response_opcodes_exclude_server_initiated_pdus() {
        assert!(is_response_opcode(att_opcodes::ERROR_RESPONSE));
        assert!(is_response_opcode(att_opcodes::READ_BY_GROUP_TYPE_RESPONSE));
        assert!(is_response_opcode(att_opcodes::WRITE_RESPONSE));
        assert!(!is_response_opcode(att_opcodes::HANDLE_VALUE_NOTIFICATION));
        assert!(!is_response_opcode(att_opcodes::HANDLE_VALUE_INDICATION));
        assert!(!is_response_opcode(att_opcodes::READ_REQUEST));
    }

    #[test]
    fn encodes_discovery_requests() {
        let request = AttPdu::ReadByGroupTypeRequest {
            start: 0x0001,
            end: 0xFFFF,
            group_type: uuid_from_u16(0x2800),
        };
        assert_eq!(request.encode(), vec![0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);

        let request = AttPdu::FindInformationRequest { start: 4, end: 5 };
        assert_eq!(request.encode(), vec![0x04, 0x04, 0x00, 0x05, 0x00]);
    }

    #[test]
    fn decodes_group_type_response() {
        let pdu = [0x11, 0x06, 0x01, 0x00, 0x04, 0x00, 0x0D, 0x18];
        assert_eq!(
            AttPdu::decode(&pdu).unwrap(),
            AttPdu::ReadByGroupTypeResponse(vec![GroupEntry {
                handle: 1,
                end_handle: 4,
                value: vec![0x0D, 0x18],
            }])
        );
    }

    #[test]
    fn group_type_response_with_stray_bytes_is_malformed() {
        let pdu = [0x11, 0x06, 0x01, 0x00, 0x04, 0x00, 0x0D];
        assert!(matches!(AttPdu::decode(&pdu), Err(AttError::Malformed(_))));
        let pdu = [0x11, 0x03, 0x01, 0x00, 0x04];
        assert!(matches!(AttPdu::decode(&pdu), Err(AttError::Malformed(_))));
    }

    #[test]
    fn read_by_type_response_needs_records() {
        assert!(matches!(AttPdu::decode(&[0x09, 0x07]), Err(AttError::Malformed(_))));
        let pdu = [0x09, 0x07, 0x02, 0x00, 0x10, 0x03, 0x00, 0x37, 0x2A];
        assert_eq!(
            AttPdu::decode(&pdu).unwrap(),
            AttPdu::ReadByTypeResponse(vec![(2, vec![0x10, 0x03, 0x00, 0x37, 0x2A])])
        );
    }

    #[test]
    fn find_information_formats() {
        let pdu = [0x05, 0x01, 0x04, 0x00, 0x02, 0x29];
        assert_eq!(
            AttPdu::decode(&pdu).unwrap(),
            AttPdu::FindInformationResponse(vec![(4, uuid_from_u16(0x2902))])
        );
        assert!(matches!(
            AttPdu::decode(&[0x05, 0x03, 0x04, 0x00]),
            Err(AttError::Malformed(_))
        ));
    }

    #[test]
    fn error_response_and_notifications() {
        assert_eq!(
            AttPdu::decode(&[0x01, 0x10, 0x05, 0x00, 0x0A]).unwrap(),
            AttPdu::ErrorResponse {
                request_opcode: 0x10,
                handle: 5,
                code: 0x0A,
            }
        );
        assert!(AttPdu::decode(&[0x01, 0x10]).is_err());

        let notification = AttPdu::decode(&[0x1B, 0x03, 0x00, 0xDE, 0xAD]).unwrap();
        assert_eq!(
            notification,
            AttPdu::HandleValueNotification {
                handle: 3,
                value: vec![0xDE, 0xAD],
            }
        );
        assert!(!notification.is_response());
    }

    #[test]
    fn unknown_requests_expect_a_response() {
        let prepare_write = AttPdu::decode(&[0x16, 0x01, 0x00]).unwrap();
        assert!(prepare_write.expects_response());
        let write_command = AttPdu::decode(&[0x52, 0x01, 0x00, 0xFF]).unwrap();
        assert!(!write_command.expects_response());
    }
}
