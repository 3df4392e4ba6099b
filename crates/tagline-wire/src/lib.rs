#![forbid(unsafe_code)]
//! 64-bit opcode codec for the RAID bus protocol.
//!
//! One request or response is a single `u64` with this layout, most to
//! least significant bit:
//!
//! ```text
//! [63..56] request_type   (8 bits)
//! [55..48] block_quantity (8 bits)
//! [47..40] disk_number    (8 bits)
//! [39..33] unused         (7 bits, zero on request)
//! [32]     status         (1 bit: 0 = ok, 1 = error on response)
//! [31..0]  id             (32 bits: starting offset for READ/WRITE)
//! ```
//!
//! Opcode and length words travel as big-endian 64-bit integers
//! (`u64::to_be_bytes` / `u64::from_be_bytes` are the host↔network
//! transform).

use tagline_error::{Result, TagError};

const TYPE_SHIFT: u32 = 56;
const QUANTITY_SHIFT: u32 = 48;
const DISK_SHIFT: u32 = 40;
const STATUS_SHIFT: u32 = 32;
const BYTE_MASK: u64 = 0xFF;
const ID_MASK: u64 = 0xFFFF_FFFF;

/// STATUS response `id` value reporting a failed disk.
pub const DISK_FAILED: u32 = 2;

/// Request type carried in the opcode's top byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    Init = 0,
    Format = 1,
    Read = 2,
    Write = 3,
    Status = 4,
    Close = 5,
}

impl RequestType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Init),
            1 => Ok(Self::Format),
            2 => Ok(Self::Read),
            3 => Ok(Self::Write),
            4 => Ok(Self::Status),
            5 => Ok(Self::Close),
            other => Err(TagError::UnknownRequestType(other)),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Format => "FORMAT",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Status => "STATUS",
            Self::Close => "CLOSE",
        }
    }

    /// READ and WRITE move block payloads; everything else is header-only.
    #[must_use]
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

/// Decoded form of one opcode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidOp {
    pub request: RequestType,
    pub block_quantity: u8,
    pub disk: u8,
    /// Status bit; always false on requests.
    pub error: bool,
    /// Starting offset for READ/WRITE, disk condition on STATUS responses.
    pub id: u32,
}

impl RaidOp {
    /// Build a request opcode (status bit clear).
    #[must_use]
    pub fn new(request: RequestType, block_quantity: u8, disk: u8, id: u32) -> Self {
        Self {
            request,
            block_quantity,
            disk,
            error: false,
            id,
        }
    }

    /// Pack the fields into the wire word.
    #[must_use]
    pub fn encode(self) -> u64 {
        u64::from(self.request as u8) << TYPE_SHIFT
            | u64::from(self.block_quantity) << QUANTITY_SHIFT
            | u64::from(self.disk) << DISK_SHIFT
            | u64::from(self.error) << STATUS_SHIFT
            | u64::from(self.id)
    }

    /// Unpack a wire word. The seven unused bits are ignored.
    #[allow(clippy::cast_possible_truncation)] // all extractions are masked
    pub fn decode(raw: u64) -> Result<Self> {
        let request = RequestType::from_u8((raw >> TYPE_SHIFT) as u8)?;
        Ok(Self {
            request,
            block_quantity: ((raw >> QUANTITY_SHIFT) & BYTE_MASK) as u8,
            disk: ((raw >> DISK_SHIFT) & BYTE_MASK) as u8,
            error: (raw >> STATUS_SHIFT) & 1 == 1,
            id: (raw & ID_MASK) as u32,
        })
    }
}

/// Check that a response is well-formed for its request.
///
/// The server must echo `type`, `block_quantity` and `disk` unchanged with
/// the status bit clear; `id` must match too, except for STATUS where the
/// server repurposes it to report the disk condition.
pub fn verify_response(request: &RaidOp, response: &RaidOp) -> Result<()> {
    if response.error {
        return Err(TagError::ServerFault {
            request: request.request.name(),
        });
    }
    if response.request != request.request {
        return Err(TagError::MalformedResponse {
            field: "type",
            expected: u64::from(request.request as u8),
            actual: u64::from(response.request as u8),
        });
    }
    if response.block_quantity != request.block_quantity {
        return Err(TagError::MalformedResponse {
            field: "block_quantity",
            expected: u64::from(request.block_quantity),
            actual: u64::from(response.block_quantity),
        });
    }
    if response.disk != request.disk {
        return Err(TagError::MalformedResponse {
            field: "disk",
            expected: u64::from(request.disk),
            actual: u64::from(response.disk),
        });
    }
    if request.request != RequestType::Status && response.id != request.id {
        return Err(TagError::MalformedResponse {
            field: "id",
            expected: u64::from(request.id),
            actual: u64::from(response.id),
        });
    }
    Ok(())
}
