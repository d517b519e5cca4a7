//! Fixed-field decoders for the chunks the analyses consume.

use super::params::Parameters;
use super::{ChunkType, DecodeError, RawChunk, CHUNK_HEADER_LEN};

const DATA_FIXED_LEN: usize = 12;
const I_DATA_FIXED_LEN: usize = 16;
const INIT_FIXED_LEN: usize = 16;
const SACK_FIXED_LEN: usize = 12;
const NR_SACK_FIXED_LEN: usize = 16;
const GAP_BLOCK_LEN: usize = 4;
const DUP_TSN_LEN: usize = 4;

/// T bit of ABORT and SHUTDOWN_COMPLETE: the vtag is the receiver's reflected tag.
pub const T_BIT: u8 = 0x01;

/// DATA / I-DATA chunk flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFlags(pub u8);

impl DataFlags {
    pub const END: u8 = 0x01;
    pub const BEGIN: u8 = 0x02;
    pub const UNORDERED: u8 = 0x04;
    pub const IMMEDIATE: u8 = 0x08;

    pub fn end(self) -> bool {
        self.0 & Self::END != 0
    }

    pub fn begin(self) -> bool {
        self.0 & Self::BEGIN != 0
    }

    pub fn unordered(self) -> bool {
        self.0 & Self::UNORDERED != 0
    }

    pub fn immediate(self) -> bool {
        self.0 & Self::IMMEDIATE != 0
    }

    /// Both B and E set: the chunk carries a whole user message.
    pub fn unfragmented(self) -> bool {
        self.begin() && self.end()
    }
}

/// Where a fragment sits within its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeq {
    /// DATA: stream sequence number.
    Ssn(u16),
    /// I-DATA: message identifier and fragment sequence number.
    Mid { mid: u32, fsn: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChunk<'a> {
    pub i_data: bool,
    pub flags: DataFlags,
    pub tsn: u32,
    pub stream_id: u16,
    pub seq: MessageSeq,
    /// Zero for I-DATA fragments other than the first; the PPID travels on the B fragment.
    pub ppid: u32,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitChunk<'a> {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    params: &'a [u8],
}

impl<'a> InitChunk<'a> {
    pub fn params(&self) -> Parameters<'a> {
        Parameters::new(self.params)
    }
}

/// A gap ack block: offsets relative to the cumulative TSN ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapBlock {
    pub start: u16,
    pub end: u16,
}

impl GapBlock {
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.start > self.end {
            return Err(DecodeError::MalformedGapBlock {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Absolute TSNs covered by this block, wrapping in 32-bit space.
    pub fn tsn_range(&self, cumulative_tsn_ack: u32) -> (u32, u32) {
        (
            cumulative_tsn_ack.wrapping_add(self.start as u32),
            cumulative_tsn_ack.wrapping_add(self.end as u32),
        )
    }
}

/// SACK or NR-SACK. `truncation` is set when the declared block counts do not
/// fit in the chunk; whatever did fit is still decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackChunk {
    pub cumulative_tsn_ack: u32,
    pub a_rwnd: u32,
    pub gap_blocks: Vec<GapBlock>,
    pub nr_gap_blocks: Vec<GapBlock>,
    pub duplicate_tsns: Vec<u32>,
    pub truncation: Option<DecodeError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk<'a> {
    Data(DataChunk<'a>),
    Init(InitChunk<'a>),
    InitAck(InitChunk<'a>),
    Sack(SackChunk),
    NrSack(SackChunk),
    Shutdown { cumulative_tsn_ack: u32 },
    /// FORWARD_TSN and I_FORWARD_TSN.
    ForwardTsn { new_cumulative_tsn: u32 },
    Abort { t_bit: bool },
    ShutdownComplete { t_bit: bool },
    Other,
}

impl<'a> Chunk<'a> {
    pub fn decode(raw: &RawChunk<'a>) -> Result<Self, DecodeError> {
        let v = raw.value;
        let chunk = match raw.chunk_type {
            ChunkType::Data => {
                require(raw, DATA_FIXED_LEN)?;
                Chunk::Data(DataChunk {
                    i_data: false,
                    flags: DataFlags(raw.flags),
                    tsn: be32(v, 0),
                    stream_id: be16(v, 4),
                    seq: MessageSeq::Ssn(be16(v, 6)),
                    ppid: be32(v, 8),
                    payload: &v[DATA_FIXED_LEN..],
                })
            }
            ChunkType::IData => {
                require(raw, I_DATA_FIXED_LEN)?;
                let flags = DataFlags(raw.flags);
                let ppid_or_fsn = be32(v, 12);
                let (ppid, fsn) = if flags.begin() {
                    (ppid_or_fsn, 0)
                } else {
                    (0, ppid_or_fsn)
                };
                Chunk::Data(DataChunk {
                    i_data: true,
                    flags,
                    tsn: be32(v, 0),
                    stream_id: be16(v, 4),
                    seq: MessageSeq::Mid {
                        mid: be32(v, 8),
                        fsn,
                    },
                    ppid,
                    payload: &v[I_DATA_FIXED_LEN..],
                })
            }
            ChunkType::Init | ChunkType::InitAck => {
                require(raw, INIT_FIXED_LEN)?;
                let init = InitChunk {
                    initiate_tag: be32(v, 0),
                    a_rwnd: be32(v, 4),
                    outbound_streams: be16(v, 8),
                    inbound_streams: be16(v, 10),
                    initial_tsn: be32(v, 12),
                    params: &v[INIT_FIXED_LEN..],
                };
                if raw.chunk_type == ChunkType::Init {
                    Chunk::Init(init)
                } else {
                    Chunk::InitAck(init)
                }
            }
            ChunkType::Sack => {
                require(raw, SACK_FIXED_LEN)?;
                let num_gaps = be16(v, 8) as usize;
                let num_dups = be16(v, 10) as usize;
                Chunk::Sack(decode_sack(v, SACK_FIXED_LEN, num_gaps, 0, num_dups))
            }
            ChunkType::NrSack => {
                require(raw, NR_SACK_FIXED_LEN)?;
                let num_gaps = be16(v, 8) as usize;
                let num_nr_gaps = be16(v, 10) as usize;
                let num_dups = be16(v, 12) as usize;
                Chunk::NrSack(decode_sack(
                    v,
                    NR_SACK_FIXED_LEN,
                    num_gaps,
                    num_nr_gaps,
                    num_dups,
                ))
            }
            ChunkType::Shutdown => {
                require(raw, 4)?;
                Chunk::Shutdown {
                    cumulative_tsn_ack: be32(v, 0),
                }
            }
            ChunkType::ForwardTsn | ChunkType::IForwardTsn => {
                require(raw, 4)?;
                Chunk::ForwardTsn {
                    new_cumulative_tsn: be32(v, 0),
                }
            }
            ChunkType::Abort => Chunk::Abort {
                t_bit: raw.flags & T_BIT != 0,
            },
            ChunkType::ShutdownComplete => Chunk::ShutdownComplete {
                t_bit: raw.flags & T_BIT != 0,
            },
            _ => Chunk::Other,
        };
        Ok(chunk)
    }
}

fn require(raw: &RawChunk<'_>, fixed: usize) -> Result<(), DecodeError> {
    if raw.value.len() < fixed {
        return Err(DecodeError::ChunkTooShort {
            chunk_type: raw.chunk_type,
            length: raw.length as usize,
            minimum: fixed + CHUNK_HEADER_LEN,
        });
    }
    Ok(())
}

fn decode_sack(
    v: &[u8],
    fixed: usize,
    num_gaps: usize,
    num_nr_gaps: usize,
    num_dups: usize,
) -> SackChunk {
    let mut sack = SackChunk {
        cumulative_tsn_ack: be32(v, 0),
        a_rwnd: be32(v, 4),
        gap_blocks: Vec::new(),
        nr_gap_blocks: Vec::new(),
        duplicate_tsns: Vec::new(),
        truncation: None,
    };

    let mut offset = fixed;
    sack.gap_blocks = read_blocks(v, &mut offset, num_gaps, "gap ack block", &mut sack.truncation);
    sack.nr_gap_blocks = read_blocks(
        v,
        &mut offset,
        num_nr_gaps,
        "nr gap ack block",
        &mut sack.truncation,
    );

    let fit = (v.len().saturating_sub(offset) / DUP_TSN_LEN).min(num_dups);
    for i in 0..fit {
        sack.duplicate_tsns.push(be32(v, offset + i * DUP_TSN_LEN));
    }
    if fit < num_dups && sack.truncation.is_none() {
        sack.truncation = Some(DecodeError::ListTruncated {
            what: "duplicate TSN",
            declared: num_dups,
            decoded: fit,
        });
    }
    sack
}

fn read_blocks(
    v: &[u8],
    offset: &mut usize,
    declared: usize,
    what: &'static str,
    truncation: &mut Option<DecodeError>,
) -> Vec<GapBlock> {
    let fit = (v.len().saturating_sub(*offset) / GAP_BLOCK_LEN).min(declared);
    let blocks = (0..fit)
        .map(|i| {
            let at = *offset + i * GAP_BLOCK_LEN;
            GapBlock {
                start: be16(v, at),
                end: be16(v, at + 2),
            }
        })
        .collect();
    *offset += fit * GAP_BLOCK_LEN;
    if fit < declared && truncation.is_none() {
        *truncation = Some(DecodeError::ListTruncated {
            what,
            declared,
            decoded: fit,
        });
    }
    blocks
}

// Callers check lengths via `require` before reading fixed fields.
fn be16(v: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([v[at], v[at + 1]])
}

fn be32(v: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([v[at], v[at + 1], v[at + 2], v[at + 3]])
}
