use thiserror::Error;

use super::ChunkType;

/// Errors raised while decoding an SCTP packet.
///
/// Only [`DecodeError::Truncated`] aborts a whole packet; everything else is
/// scoped to one chunk, parameter or gap block and is turned into a
/// diagnostic by the analyzer while the rest of the packet is processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet too short for SCTP common header: {available} < 12 bytes")]
    Truncated { available: usize },

    #[error("chunk at offset {offset} declares length {declared} below the 4-byte header")]
    ChunkLengthTooSmall { offset: usize, declared: u16 },

    #[error("{chunk_type} chunk at offset {offset} declares length {declared} but only {remaining} bytes remain")]
    ChunkOverrun {
        offset: usize,
        chunk_type: ChunkType,
        declared: u16,
        remaining: usize,
    },

    #[error("{chunk_type} chunk of length {length} is shorter than its {minimum}-byte fixed header")]
    ChunkTooShort {
        chunk_type: ChunkType,
        length: usize,
        minimum: usize,
    },

    #[error("parameter at offset {offset} declares length {declared} below the 4-byte header")]
    ParameterLengthTooSmall { offset: usize, declared: u16 },

    #[error("parameter at offset {offset} declares length {declared} but only {remaining} bytes remain")]
    ParameterOverrun {
        offset: usize,
        declared: u16,
        remaining: usize,
    },

    #[error("{what} list declares {declared} entries but only {decoded} fit in the chunk")]
    ListTruncated {
        what: &'static str,
        declared: usize,
        decoded: usize,
    },

    #[error("gap ack block {start}-{end} has start after end")]
    MalformedGapBlock { start: u16, end: u16 },
}
