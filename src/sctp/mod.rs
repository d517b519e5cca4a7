//! SCTP wire decoding: common header, chunk walk, per-chunk field decoders,
//! parameter lists and the checksum oracle.
//!
//! Everything here is stateless. The stateful analyses live in
//! [`crate::association`], [`crate::tsn`] and [`crate::reassembly`].

pub mod checksum;
pub mod chunks;
mod error;
pub mod params;

pub use chunks::{Chunk, DataChunk, DataFlags, GapBlock, InitChunk, MessageSeq, SackChunk};
pub use error::DecodeError;

use std::fmt;

pub const COMMON_HEADER_LEN: usize = 12;
pub const CHUNK_HEADER_LEN: usize = 4;

/// Round a chunk or parameter length up to the next 4-byte boundary.
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// SCTP chunk types (RFC 9260 and extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Data,
    Init,
    InitAck,
    Sack,
    Heartbeat,
    HeartbeatAck,
    Abort,
    Shutdown,
    ShutdownAck,
    Error,
    CookieEcho,
    CookieAck,
    Ecne,
    Cwr,
    ShutdownComplete,
    Auth,
    NrSack,
    IData,
    AsconfAck,
    PktDrop,
    ReConfig,
    Pad,
    ForwardTsn,
    Asconf,
    IForwardTsn,
    Unknown(u8),
}

impl ChunkType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ChunkType::Data,
            1 => ChunkType::Init,
            2 => ChunkType::InitAck,
            3 => ChunkType::Sack,
            4 => ChunkType::Heartbeat,
            5 => ChunkType::HeartbeatAck,
            6 => ChunkType::Abort,
            7 => ChunkType::Shutdown,
            8 => ChunkType::ShutdownAck,
            9 => ChunkType::Error,
            10 => ChunkType::CookieEcho,
            11 => ChunkType::CookieAck,
            12 => ChunkType::Ecne,
            13 => ChunkType::Cwr,
            14 => ChunkType::ShutdownComplete,
            15 => ChunkType::Auth,
            16 => ChunkType::NrSack,
            64 => ChunkType::IData,
            128 => ChunkType::AsconfAck,
            129 => ChunkType::PktDrop,
            130 => ChunkType::ReConfig,
            132 => ChunkType::Pad,
            192 => ChunkType::ForwardTsn,
            193 => ChunkType::Asconf,
            194 => ChunkType::IForwardTsn,
            other => ChunkType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ChunkType::Data => 0,
            ChunkType::Init => 1,
            ChunkType::InitAck => 2,
            ChunkType::Sack => 3,
            ChunkType::Heartbeat => 4,
            ChunkType::HeartbeatAck => 5,
            ChunkType::Abort => 6,
            ChunkType::Shutdown => 7,
            ChunkType::ShutdownAck => 8,
            ChunkType::Error => 9,
            ChunkType::CookieEcho => 10,
            ChunkType::CookieAck => 11,
            ChunkType::Ecne => 12,
            ChunkType::Cwr => 13,
            ChunkType::ShutdownComplete => 14,
            ChunkType::Auth => 15,
            ChunkType::NrSack => 16,
            ChunkType::IData => 64,
            ChunkType::AsconfAck => 128,
            ChunkType::PktDrop => 129,
            ChunkType::ReConfig => 130,
            ChunkType::Pad => 132,
            ChunkType::ForwardTsn => 192,
            ChunkType::Asconf => 193,
            ChunkType::IForwardTsn => 194,
            ChunkType::Unknown(v) => v,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChunkType::Data => "DATA",
            ChunkType::Init => "INIT",
            ChunkType::InitAck => "INIT_ACK",
            ChunkType::Sack => "SACK",
            ChunkType::Heartbeat => "HEARTBEAT",
            ChunkType::HeartbeatAck => "HEARTBEAT_ACK",
            ChunkType::Abort => "ABORT",
            ChunkType::Shutdown => "SHUTDOWN",
            ChunkType::ShutdownAck => "SHUTDOWN_ACK",
            ChunkType::Error => "ERROR",
            ChunkType::CookieEcho => "COOKIE_ECHO",
            ChunkType::CookieAck => "COOKIE_ACK",
            ChunkType::Ecne => "ECNE",
            ChunkType::Cwr => "CWR",
            ChunkType::ShutdownComplete => "SHUTDOWN_COMPLETE",
            ChunkType::Auth => "AUTH",
            ChunkType::NrSack => "NR_SACK",
            ChunkType::IData => "I_DATA",
            ChunkType::AsconfAck => "ASCONF_ACK",
            ChunkType::PktDrop => "PKTDROP",
            ChunkType::ReConfig => "RE_CONFIG",
            ChunkType::Pad => "PAD",
            ChunkType::ForwardTsn => "FORWARD_TSN",
            ChunkType::Asconf => "ASCONF",
            ChunkType::IForwardTsn => "I_FORWARD_TSN",
            ChunkType::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkType::Unknown(v) => write!(f, "UNKNOWN({})", v),
            other => f.write_str(other.name()),
        }
    }
}

/// The 12-byte SCTP common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub verification_tag: u32,
    /// Checksum bytes exactly as they appear on the wire.
    pub checksum: [u8; 4],
}

/// A decoded SCTP packet: the common header plus a view onto the chunk bytes.
#[derive(Debug, Clone, Copy)]
pub struct SctpPacket<'a> {
    pub header: CommonHeader,
    bytes: &'a [u8],
}

impl<'a> SctpPacket<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        if bytes.len() < COMMON_HEADER_LEN {
            return Err(DecodeError::Truncated {
                available: bytes.len(),
            });
        }
        let header = CommonHeader {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            verification_tag: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: [bytes[8], bytes[9], bytes[10], bytes[11]],
        };
        Ok(SctpPacket { header, bytes })
    }

    pub fn chunks(&self) -> ChunkIter<'a> {
        ChunkIter {
            bytes: self.bytes,
            offset: COMMON_HEADER_LEN,
            done: false,
        }
    }
}

/// One chunk split into header and value, before field decoding.
#[derive(Debug, Clone, Copy)]
pub struct RawChunk<'a> {
    /// Offset of the chunk header from the start of the SCTP packet.
    pub offset: usize,
    pub chunk_type: ChunkType,
    pub flags: u8,
    /// Declared length, header included, padding excluded.
    pub length: u16,
    pub value: &'a [u8],
}

/// Walks the chunk list of a packet.
///
/// Yields `Err` once and then stops when a chunk header cannot be trusted
/// (declared length below 4 or beyond the captured bytes); the walk cannot
/// advance past such a chunk.
pub struct ChunkIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<RawChunk<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.bytes.len() {
            return None;
        }
        let remaining = self.bytes.len() - self.offset;
        if remaining < CHUNK_HEADER_LEN {
            // Trailing bytes too short for a chunk header are treated as padding.
            self.done = true;
            return None;
        }

        let at = self.offset;
        let chunk_type = ChunkType::from_u8(self.bytes[at]);
        let flags = self.bytes[at + 1];
        let length = u16::from_be_bytes([self.bytes[at + 2], self.bytes[at + 3]]);

        if (length as usize) < CHUNK_HEADER_LEN {
            self.done = true;
            return Some(Err(DecodeError::ChunkLengthTooSmall {
                offset: at,
                declared: length,
            }));
        }
        if length as usize > remaining {
            self.done = true;
            return Some(Err(DecodeError::ChunkOverrun {
                offset: at,
                chunk_type,
                declared: length,
                remaining,
            }));
        }

        let value = &self.bytes[at + CHUNK_HEADER_LEN..at + length as usize];
        self.offset = (at + pad4(length as usize)).min(self.bytes.len());

        Some(Ok(RawChunk {
            offset: at,
            chunk_type,
            flags,
            length,
            value,
        }))
    }
}
