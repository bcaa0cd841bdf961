//! HCI transport link
//! H4 framing (one packet indicator byte followed by the HCI packet) over
//! any async byte stream, plus an opener for transport specification strings.

use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{SplitSink, SplitStream};
use log::info;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::core::bluetooth::constants::packet_types;
use crate::core::bluetooth::error::{ConfigError, ControllerError};

/// An HCI packet without its H4 indicator byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
    Command(Vec<u8>),
    AclData(Vec<u8>),
    Event(Vec<u8>),
}

impl HciPacket {
    fn indicator(&self) -> u8 {
        match self {
            HciPacket::Command(_) => packet_types::COMMAND,
            HciPacket::AclData(_) => packet_types::ACL_DATA,
            HciPacket::Event(_) => packet_types::EVENT,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            HciPacket::Command(p) | HciPacket::AclData(p) | HciPacket::Event(p) => p,
        }
    }
}

/// H4 codec
#[derive(Debug, Default, Clone, Copy)]
pub struct H4Codec;

impl Decoder for H4Codec {
    type Item = HciPacket;
    type Error = ControllerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HciPacket>, ControllerError> {
        let Some(&indicator) = src.first() else {
            return Ok(None);
        };

        // (header length, parameter length) for each packet kind
        let (header_len, body_len) = match indicator {
            packet_types::COMMAND => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (3, src[3] as usize)
            }
            packet_types::ACL_DATA => {
                if src.len() < 5 {
                    return Ok(None);
                }
                (4, u16::from_le_bytes([src[3], src[4]]) as usize)
            }
            packet_types::EVENT => {
                if src.len() < 3 {
                    return Ok(None);
                }
                (2, src[2] as usize)
            }
            other => {
                return Err(ControllerError::Malformed(format!(
                    "unknown H4 packet indicator 0x{:02x}",
                    other
                )));
            }
        };

        let total = 1 + header_len + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(1);
        let packet = src.split_to(header_len + body_len).to_vec();
        Ok(Some(match indicator {
            packet_types::COMMAND => HciPacket::Command(packet),
            packet_types::ACL_DATA => HciPacket::AclData(packet),
            _ => HciPacket::Event(packet),
        }))
    }
}

impl Encoder<HciPacket> for H4Codec {
    type Error = ControllerError;

    fn encode(&mut self, item: HciPacket, dst: &mut BytesMut) -> Result<(), ControllerError> {
        let payload = item.payload();
        dst.reserve(1 + payload.len());
        dst.put_u8(item.indicator());
        dst.put_slice(payload);
        Ok(())
    }
}

/// Byte streams a transport can run over
pub trait HciStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> HciStream for T {}

pub type HciFramed = Framed<Box<dyn HciStream>, H4Codec>;
pub type HciSink = SplitSink<HciFramed, HciPacket>;
pub type HciSource = SplitStream<HciFramed>;

/// Where the controller lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    TcpClient { host: String, port: u16 },
}

/// Parses `tcp-client:<host>:<port>`
impl FromStr for TransportSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTransport(s.to_string());
        let (kind, endpoint) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "tcp-client" => {
                let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
                if host.is_empty() {
                    return Err(invalid());
                }
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(TransportSpec::TcpClient {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// An open, framed transport split into its reading and writing halves
pub struct Transport {
    pub source: HciSource,
    pub sink: HciSink,
}

impl Transport {
    /// Frames an already open byte stream
    pub fn from_stream<S: HciStream>(stream: S) -> Self {
        let boxed: Box<dyn HciStream> = Box::new(stream);
        let (sink, source) = Framed::new(boxed, H4Codec).split();
        Self { source, sink }
    }

    /// Opens the transport described by `spec`
    pub async fn open(spec: &str) -> Result<Self, ControllerError> {
        let spec: TransportSpec = spec
            .parse()
            .map_err(|e: ConfigError| ControllerError::Transport(e.to_string()))?;
        match spec {
            TransportSpec::TcpClient { host, port } => {
                info!("Opening HCI transport tcp-client {}:{}", host, port);
                let stream = TcpStream::connect((host.as_str(), port)).await?;
                stream.set_nodelay(true)?;
                Ok(Self::from_stream(stream))
            }
        }
    }
}
