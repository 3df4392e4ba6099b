#![forbid(unsafe_code)]
//! Blocking TCP client for the RAID bus protocol.
//!
//! One exchange is: 8-byte opcode word, 8-byte payload-length word, then
//! (WRITE only) the outbound payload; the server answers with its own
//! opcode word, length word and (READ only) the inbound payload. Both
//! words are big-endian. `RaidBus` is the seam the driver engine talks
//! through; `TcpRaidBus` is the production implementation.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::TcpStream;
use tagline_error::{Result, TagError};
use tagline_wire::{RaidOp, RequestType};
use tracing::{debug, trace};

/// Default RAID server address.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1";
/// Default RAID server port.
pub const DEFAULT_SERVER_PORT: u16 = 19001;

/// Endpoint configuration for the RAID server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub addr: String,
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_SERVER_ADDR.to_owned(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

/// Payload carried by one exchange.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Header-only request (INIT, FORMAT, STATUS, CLOSE).
    None,
    /// READ: the server's payload lands in this buffer.
    Read(&'a mut [u8]),
    /// WRITE: this buffer is sent after the header words.
    Write(&'a [u8]),
}

/// One request/response exchange with the RAID server.
///
/// Synchronous and single-threaded: one outstanding request at a time.
pub trait RaidBus {
    fn exchange(&mut self, request: RaidOp, payload: Payload<'_>) -> Result<RaidOp>;
}

/// Production bus: owns at most one blocking stream socket.
#[derive(Debug)]
pub struct TcpRaidBus {
    config: BusConfig,
    block_size: usize,
    stream: Option<TcpStream>,
}

impl TcpRaidBus {
    /// Build an unconnected bus; INIT opens the socket.
    #[must_use]
    pub fn new(config: BusConfig, block_size: usize) -> Self {
        Self {
            config,
            block_size,
            stream: None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl RaidBus for TcpRaidBus {
    fn exchange(&mut self, request: RaidOp, payload: Payload<'_>) -> Result<RaidOp> {
        let payload_len = if request.request.carries_payload() {
            usize::from(request.block_quantity) * self.block_size
        } else {
            0
        };

        let (outbound, inbound): (Option<&[u8]>, Option<&mut [u8]>) = match payload {
            Payload::None => (None, None),
            Payload::Write(buf) => (Some(buf), None),
            Payload::Read(buf) => (None, Some(buf)),
        };
        let buffer_len = match (&outbound, &inbound, request.request) {
            (Some(buf), None, RequestType::Write) => buf.len(),
            (None, Some(buf), RequestType::Read) => buf.len(),
            (None, None, kind) if !kind.carries_payload() => 0,
            _ => {
                return Err(TagError::InvalidArgument(format!(
                    "payload does not match {} request",
                    request.request.name()
                )));
            }
        };
        if buffer_len != payload_len {
            return Err(TagError::InvalidArgument(format!(
                "{} payload is {buffer_len} bytes, opcode announces {payload_len}",
                request.request.name()
            )));
        }

        if request.request == RequestType::Init {
            debug!(
                target: "tagline::bus",
                addr = %self.config.addr,
                port = self.config.port,
                "connecting to raid server",
            );
            self.stream = Some(TcpStream::connect((
                self.config.addr.as_str(),
                self.config.port,
            ))?);
        }
        let stream = self.stream.as_mut().ok_or(TagError::NotConnected)?;

        stream.write_all(&request.encode().to_be_bytes())?;
        stream.write_all(&(payload_len as u64).to_be_bytes())?;
        if let Some(buf) = outbound {
            stream.write_all(buf)?;
        }

        let mut word = [0_u8; 8];
        stream.read_exact(&mut word)?;
        let response = RaidOp::decode(u64::from_be_bytes(word))?;
        stream.read_exact(&mut word)?;
        let response_len = u64::from_be_bytes(word);

        let expected_len = if request.request == RequestType::Read {
            payload_len as u64
        } else {
            0
        };
        if response_len != expected_len {
            return Err(TagError::MalformedResponse {
                field: "length",
                expected: expected_len,
                actual: response_len,
            });
        }
        if let Some(buf) = inbound {
            stream.read_exact(buf)?;
        }

        trace!(
            target: "tagline::bus",
            request = request.request.name(),
            disk = request.disk,
            blocks = request.block_quantity,
            id = request.id,
            "exchange complete",
        );

        if request.request == RequestType::Close {
            self.stream = None;
        }
        Ok(response)
    }
}
