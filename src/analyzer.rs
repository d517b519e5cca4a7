//! Per-capture analysis session.
//!
//! [`Analyzer`] owns every piece of cross-packet state (associations,
//! half-associations, fragment groups) and runs one SCTP packet at a time
//! through decoding, association correlation, TSN tracking and reassembly.
//! Frames are expected in ascending order within a pass; a frame number seen
//! before is treated as a revisit and only reports what earlier passes found.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::association::{Association, Candidate, Correlator, Direction, Resolution};
use crate::config::AnalyzerConfig;
use crate::reassembly::{AddOutcome, MessageKey, Reassembler, Reassembly};
use crate::sctp::checksum::{self, ChecksumKind, ChecksumStatus};
use crate::sctp::params::Parameter;
use crate::sctp::{
    Chunk, ChunkType, CommonHeader, DataChunk, DataFlags, DecodeError, GapBlock, InitChunk,
    MessageSeq, RawChunk, SackChunk, SctpPacket,
};
use crate::tsn::{AckedTsn, FrameInfo, HalfId, TsnAnnotation, TsnTracker};

/// Gap-acked TSN count in one SACK above which a note is raised.
const MANY_GAP_ACKED: u32 = 100;

/// Where a packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketContext {
    /// 1-based capture frame number. 0 disables TSN tracking.
    pub frame: u32,
    pub timestamp: SystemTime,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    /// The capture kept fewer bytes than were on the wire.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

/// A finding attached to a packet or chunk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("bad {kind} checksum: stored {stored:#010x}, computed {computed:#010x}")]
    BadChecksum {
        kind: ChecksumKind,
        computed: u32,
        stored: u32,
    },

    #[error("retransmission of TSN first sent in frame {first_frame}")]
    Retransmission { first_frame: u32 },

    #[error("TSN was acked in frame {ack_frame} before this retransmission (reneged ack?)")]
    RenegedAck { ack_frame: u32 },

    #[error("TSN was retransmitted {count} times")]
    RetransmittedMoreThanTwice { count: u32 },

    #[error("duplicate message fragment, first seen in frame {original_frame}")]
    DuplicateFragment { original_frame: u32 },

    #[error("advertised receiver window is zero")]
    ZeroWindow,

    #[error("gap ack block {start}-{end} is out of order")]
    GapBlockOutOfOrder { start: u16, end: u16 },

    #[error("more than {} TSNs gap-acked ({count})", MANY_GAP_ACKED)]
    ManyTsnsGapAcked { count: u32 },
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::Decode(_) | Diagnostic::BadChecksum { .. } => Severity::Error,
            Diagnostic::Retransmission { .. }
            | Diagnostic::ZeroWindow
            | Diagnostic::ManyTsnsGapAcked { .. } => Severity::Note,
            Diagnostic::RenegedAck { .. }
            | Diagnostic::RetransmittedMoreThanTwice { .. }
            | Diagnostic::DuplicateFragment { .. }
            | Diagnostic::GapBlockOutOfOrder { .. } => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Whole message in one chunk.
    Unfragmented,
    /// Reassembled from fragments.
    Reassembled,
    /// First fragment only, reassembly disabled.
    FirstFragment,
}

/// A user message ready for upper-layer dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub ppid: u32,
    pub stream_id: u16,
    pub delivery: Delivery,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentStatus {
    Unfragmented,
    Reassembled {
        begin: u32,
        end: u32,
        fragments: u64,
        len: usize,
    },
    PartOf {
        reassembled_in: u32,
    },
    Pending,
    Duplicate {
        original_frame: u32,
    },
    /// Reassembly disabled, retransmission, truncated frame or empty payload.
    NotReassembled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSummary {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub params: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackSummary {
    pub cumulative_tsn_ack: u32,
    pub a_rwnd: u32,
    /// Absolute TSN ranges.
    pub gap_blocks: Vec<(u32, u32)>,
    pub nr_gap_blocks: Vec<(u32, u32)>,
    pub duplicate_tsns: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkDetail {
    Data {
        i_data: bool,
        flags: DataFlags,
        tsn: u32,
        stream_id: u16,
        seq: MessageSeq,
        ppid: u32,
        payload_len: usize,
    },
    Init(InitSummary),
    InitAck(InitSummary),
    Sack(SackSummary),
    NrSack(SackSummary),
    Shutdown {
        cumulative_tsn_ack: u32,
    },
    ForwardTsn {
        new_cumulative_tsn: u32,
    },
    Abort {
        t_bit: bool,
    },
    ShutdownComplete {
        t_bit: bool,
    },
    Other,
    /// Fixed fields could not be decoded.
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub offset: usize,
    pub chunk_type: ChunkType,
    pub flags: u8,
    pub length: u16,
    pub association: usize,
    pub direction: Direction,
    pub detail: ChunkDetail,
    pub tsn: Option<TsnAnnotation>,
    pub acked: Vec<AckedTsn>,
    pub fragment: Option<FragmentStatus>,
    pub delivered: Option<DeliveredMessage>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketReport {
    pub frame: u32,
    pub timestamp: SystemTime,
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub header: CommonHeader,
    pub checksum: ChecksumStatus,
    /// The frame had already been processed by an earlier pass.
    pub revisit: bool,
    pub chunks: Vec<ChunkReport>,
    /// Packet-level findings: checksum and chunk-walk errors.
    pub diagnostics: Vec<Diagnostic>,
}

impl PacketReport {
    /// Association of the first chunk, which is the packet's association in
    /// all but pathological bundles.
    pub fn association(&self) -> Option<(usize, Direction)> {
        self.chunks.first().map(|c| (c.association, c.direction))
    }

    pub fn messages(&self) -> impl Iterator<Item = &DeliveredMessage> {
        self.chunks.iter().filter_map(|c| c.delivered.as_ref())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Note => f.write_str("note"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

fn is_tsn_chunk(chunk_type: ChunkType) -> bool {
    matches!(
        chunk_type,
        ChunkType::Data | ChunkType::IData | ChunkType::Sack | ChunkType::NrSack
    )
}

/// Per-packet facts shared by every chunk handler.
struct PacketScope {
    header: CommonHeader,
    frame: FrameInfo,
    half: Option<HalfId>,
    visited: bool,
    truncated: bool,
}

/// Analysis state for one loaded capture.
#[derive(Debug, Default)]
pub struct Analyzer {
    config: AnalyzerConfig,
    correlator: Correlator,
    tracker: TsnTracker,
    reassembler: Reassembler,
    visited: HashSet<u32>,
    /// First-pass resolution of each chunk, by frame and chunk offset.
    resolutions: HashMap<(u32, usize), Resolution>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Analyzer {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Forget everything; call when a different capture is loaded.
    pub fn reset(&mut self) {
        self.correlator.clear();
        self.tracker.clear();
        self.reassembler.clear();
        self.visited.clear();
        self.resolutions.clear();
    }

    pub fn associations(&self) -> &[Association] {
        self.correlator.associations()
    }

    pub fn tracker(&self) -> &TsnTracker {
        &self.tracker
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Analyze one SCTP packet (common header onward).
    ///
    /// Only a packet too short for the common header is an error; every
    /// other problem becomes a [`Diagnostic`] in the report.
    pub fn process(&mut self, ctx: &PacketContext, bytes: &[u8]) -> Result<PacketReport, DecodeError> {
        let packet = SctpPacket::parse(bytes)?;
        let header = packet.header;
        let visited = ctx.frame != 0 && !self.visited.insert(ctx.frame);

        let mut diagnostics = Vec::new();
        let checksum = checksum::verify(self.config.checksum, bytes, ctx.truncated);
        if let ChecksumStatus::Invalid {
            kind,
            computed,
            stored,
        } = checksum
        {
            diagnostics.push(Diagnostic::BadChecksum {
                kind,
                computed,
                stored,
            });
        }

        let carries_tsns = packet
            .chunks()
            .filter_map(Result::ok)
            .any(|c| is_tsn_chunk(c.chunk_type));
        let half = if self.config.tsn_analysis && carries_tsns {
            self.tracker.half_association(
                header.src_port,
                header.dst_port,
                header.verification_tag,
                ctx.src,
                ctx.dst,
            )
        } else {
            None
        };

        let scope = PacketScope {
            header,
            frame: FrameInfo {
                number: ctx.frame,
                timestamp: ctx.timestamp,
            },
            half,
            visited,
            truncated: ctx.truncated,
        };

        let mut chunks = Vec::new();
        for raw in packet.chunks() {
            match raw {
                Ok(raw) => chunks.push(self.process_chunk(&scope, &raw)),
                Err(err) => {
                    debug!(frame = ctx.frame, %err, "chunk walk stopped");
                    diagnostics.push(err.into());
                }
            }
        }

        if !visited {
            let touched: BTreeSet<usize> = chunks.iter().map(|c| c.association).collect();
            self.correlator.count_frame(touched);
        }

        trace!(frame = ctx.frame, chunks = chunks.len(), revisit = visited, "packet analyzed");
        Ok(PacketReport {
            frame: ctx.frame,
            timestamp: ctx.timestamp,
            src: ctx.src,
            dst: ctx.dst,
            header,
            checksum,
            revisit: visited,
            chunks,
            diagnostics,
        })
    }

    fn resolve(&mut self, scope: &PacketScope, raw: &RawChunk<'_>) -> Resolution {
        let reflected = matches!(raw.chunk_type, ChunkType::Abort | ChunkType::ShutdownComplete)
            && raw.flags & crate::sctp::chunks::T_BIT != 0;
        let initiate_tag = match raw.chunk_type {
            ChunkType::Init if raw.value.len() >= 4 => {
                u32::from_be_bytes([raw.value[0], raw.value[1], raw.value[2], raw.value[3]])
            }
            _ => 0,
        };
        let candidate = Candidate::new(
            scope.header.src_port,
            scope.header.dst_port,
            scope.header.verification_tag,
            reflected,
            initiate_tag,
        );
        let slot = (scope.frame.number, raw.offset);
        if scope.visited {
            return match self.resolutions.get(&slot) {
                Some(resolution) => Resolution {
                    created: false,
                    ..*resolution
                },
                None => self.correlator.resolve_replay(&candidate),
            };
        }
        let resolution = self.correlator.resolve(&candidate);
        if scope.frame.number != 0 {
            self.resolutions.insert(slot, resolution);
        }
        resolution
    }

    fn process_chunk(&mut self, scope: &PacketScope, raw: &RawChunk<'_>) -> ChunkReport {
        let resolution = self.resolve(scope, raw);
        let mut report = ChunkReport {
            offset: raw.offset,
            chunk_type: raw.chunk_type,
            flags: raw.flags,
            length: raw.length,
            association: resolution.index,
            direction: resolution.direction,
            detail: ChunkDetail::Other,
            tsn: None,
            acked: Vec::new(),
            fragment: None,
            delivered: None,
            diagnostics: Vec::new(),
        };

        let chunk = match Chunk::decode(raw) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(frame = scope.frame.number, %err, "malformed chunk");
                report.detail = ChunkDetail::Malformed;
                report.diagnostics.push(err.into());
                return report;
            }
        };

        match chunk {
            Chunk::Data(data) => self.process_data(scope, &data, &mut report),
            Chunk::Init(init) => report.detail = ChunkDetail::Init(init_summary(&init, &mut report.diagnostics)),
            Chunk::InitAck(init) => {
                report.detail = ChunkDetail::InitAck(init_summary(&init, &mut report.diagnostics))
            }
            Chunk::Sack(sack) => {
                self.process_sack(scope, &sack, &mut report);
                report.detail = ChunkDetail::Sack(sack_summary(&sack));
            }
            Chunk::NrSack(sack) => {
                self.process_sack(scope, &sack, &mut report);
                report.detail = ChunkDetail::NrSack(sack_summary(&sack));
            }
            Chunk::Shutdown { cumulative_tsn_ack } => {
                report.detail = ChunkDetail::Shutdown { cumulative_tsn_ack }
            }
            Chunk::ForwardTsn { new_cumulative_tsn } => {
                report.detail = ChunkDetail::ForwardTsn { new_cumulative_tsn }
            }
            Chunk::Abort { t_bit } => report.detail = ChunkDetail::Abort { t_bit },
            Chunk::ShutdownComplete { t_bit } => {
                report.detail = ChunkDetail::ShutdownComplete { t_bit }
            }
            Chunk::Other => {}
        }
        report
    }

    fn process_data(&mut self, scope: &PacketScope, data: &DataChunk<'_>, report: &mut ChunkReport) {
        report.detail = ChunkDetail::Data {
            i_data: data.i_data,
            flags: data.flags,
            tsn: data.tsn,
            stream_id: data.stream_id,
            seq: data.seq,
            ppid: data.ppid,
            payload_len: data.payload.len(),
        };

        let annotation = scope
            .half
            .and_then(|half| self.tracker.observe_tsn(half, data.tsn, scope.frame, scope.visited));
        let retransmission = annotation.as_ref().is_some_and(TsnAnnotation::is_retransmission);
        if let Some(ann) = &annotation {
            if let Some(first_frame) = ann.retransmission_of {
                report.diagnostics.push(Diagnostic::Retransmission { first_frame });
            } else if ann.retransmit_count > 2 {
                report.diagnostics.push(Diagnostic::RetransmittedMoreThanTwice {
                    count: ann.retransmit_count,
                });
            }
            if let Some(ack_frame) = ann.reneged_ack {
                report.diagnostics.push(Diagnostic::RenegedAck { ack_frame });
            }
        }
        report.tsn = annotation;

        if data.flags.unfragmented() {
            report.fragment = Some(FragmentStatus::Unfragmented);
            if !retransmission {
                report.delivered = Some(deliver(data, data.ppid, Delivery::Unfragmented, Bytes::copy_from_slice(data.payload)));
            }
            return;
        }

        if !self.config.reassembly {
            report.fragment = Some(FragmentStatus::NotReassembled);
            if data.flags.begin() && !retransmission {
                report.delivered = Some(deliver(data, data.ppid, Delivery::FirstFragment, Bytes::copy_from_slice(data.payload)));
            }
            return;
        }
        if retransmission || scope.truncated {
            report.fragment = Some(FragmentStatus::NotReassembled);
            return;
        }

        let (seq, position) = match data.seq {
            MessageSeq::Ssn(ssn) => (if data.flags.unordered() { 0 } else { u32::from(ssn) }, data.tsn),
            MessageSeq::Mid { mid, fsn } => (mid, fsn),
        };
        let key = MessageKey {
            src_port: scope.header.src_port,
            dst_port: scope.header.dst_port,
            vtag: scope.header.verification_tag,
            stream_id: data.stream_id,
            seq,
            unordered: data.flags.unordered(),
        };
        let outcome = self.reassembler.add_fragment(
            key,
            position,
            scope.frame.number,
            data.flags.begin(),
            data.flags.end(),
            data.ppid,
            data.payload,
        );

        report.fragment = Some(match outcome {
            AddOutcome::Duplicate { original_frame } => {
                report
                    .diagnostics
                    .push(Diagnostic::DuplicateFragment { original_frame });
                FragmentStatus::Duplicate { original_frame }
            }
            AddOutcome::Empty => FragmentStatus::NotReassembled,
            AddOutcome::Stored | AddOutcome::Revisit => {
                match self.reassembler.try_reassemble(&key, position, scope.frame.number) {
                    Reassembly::Complete(message) => {
                        let status = FragmentStatus::Reassembled {
                            begin: message.begin,
                            end: message.end,
                            fragments: message.fragment_count(),
                            len: message.data.len(),
                        };
                        report.delivered = Some(deliver(data, message.ppid, Delivery::Reassembled, message.data));
                        status
                    }
                    Reassembly::PartOf { reassembled_in } => FragmentStatus::PartOf { reassembled_in },
                    Reassembly::Pending => FragmentStatus::Pending,
                }
            }
        });
    }

    fn process_sack(&mut self, scope: &PacketScope, sack: &SackChunk, report: &mut ChunkReport) {
        if let Some(err) = &sack.truncation {
            report.diagnostics.push(err.clone().into());
        }
        if sack.a_rwnd == 0 {
            report.diagnostics.push(Diagnostic::ZeroWindow);
        }

        let mut last_end = 0u16;
        let mut gap_acked = 0u32;
        for block in &sack.gap_blocks {
            match block.validate() {
                Ok(()) => gap_acked += u32::from(block.end - block.start) + 1,
                Err(err) => report.diagnostics.push(err.into()),
            }
            if last_end > block.start {
                report.diagnostics.push(Diagnostic::GapBlockOutOfOrder {
                    start: block.start,
                    end: block.end,
                });
            }
            last_end = block.end;
        }
        if gap_acked > MANY_GAP_ACKED {
            report
                .diagnostics
                .push(Diagnostic::ManyTsnsGapAcked { count: gap_acked });
        }

        if let Some(half) = scope.half {
            report.acked = self.tracker.observe_sack(
                half,
                sack.cumulative_tsn_ack,
                &sack.gap_blocks,
                scope.frame,
                scope.visited,
            );
        }
    }
}

fn deliver(data: &DataChunk<'_>, ppid: u32, delivery: Delivery, payload: Bytes) -> DeliveredMessage {
    DeliveredMessage {
        ppid,
        stream_id: data.stream_id,
        delivery,
        data: payload,
    }
}

fn init_summary(init: &InitChunk<'_>, diagnostics: &mut Vec<Diagnostic>) -> InitSummary {
    let mut params = Vec::new();
    for param in init.params() {
        match param {
            Ok(p) => params.push(Parameter::name(&p)),
            Err(err) => diagnostics.push(err.into()),
        }
    }
    InitSummary {
        initiate_tag: init.initiate_tag,
        a_rwnd: init.a_rwnd,
        outbound_streams: init.outbound_streams,
        inbound_streams: init.inbound_streams,
        initial_tsn: init.initial_tsn,
        params,
    }
}

fn sack_summary(sack: &SackChunk) -> SackSummary {
    let ranges = |blocks: &[GapBlock]| -> Vec<(u32, u32)> {
        blocks
            .iter()
            .map(|b| b.tsn_range(sack.cumulative_tsn_ack))
            .collect()
    };
    SackSummary {
        cumulative_tsn_ack: sack.cumulative_tsn_ack,
        a_rwnd: sack.a_rwnd,
        gap_blocks: ranges(&sack.gap_blocks),
        nr_gap_blocks: ranges(&sack.nr_gap_blocks),
        duplicate_tsns: sack.duplicate_tsns.clone(),
    }
}
