//! Per-direction TSN tracking: retransmissions, SACK matching and RTT.
//!
//! Each direction of an association is a [`HalfAssociation`] identified by
//! (source port, destination port, verification tag). TSNs are stored
//! relative to the first TSN seen in that direction so that 32-bit wraparound
//! needs no special casing. A SACK sent in one direction acknowledges TSNs of
//! the opposite half, found through the peer link.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use crate::sctp::GapBlock;

/// Retransmission events stored per TSN. The counter keeps going past it.
pub const MAX_RETRANS_TRACKED_PER_TSN: usize = 100;
/// Larger ranges still move the cumulative ack point but are not walked.
pub const MAX_ACK_WALK: u32 = 5000;
const MAX_ACK_SPAN: u32 = 0xffff_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub number: u32,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsnRecord {
    pub tsn: u32,
    pub first_transmit: FrameInfo,
    pub ack: Option<FrameInfo>,
    pub retransmits: Vec<FrameInfo>,
    pub retransmit_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HalfKey {
    pub src_port: u16,
    pub dst_port: u16,
    pub vtag: u32,
}

pub type HalfId = usize;

#[derive(Debug, Clone)]
pub struct HalfAssociation {
    pub key: HalfKey,
    pub started: bool,
    pub first_tsn: u32,
    /// Next relative TSN not yet covered by a cumulative ack.
    pub cumulative_ack: u32,
    pub peer: Option<HalfId>,
    tsns: BTreeMap<u32, TsnRecord>,
    /// Frame number of a SACK to the relative TSNs it acknowledged first.
    acks: HashMap<u32, Vec<u32>>,
}

impl HalfAssociation {
    fn new(key: HalfKey) -> Self {
        HalfAssociation {
            key,
            started: false,
            first_tsn: 0,
            cumulative_ack: 0,
            peer: None,
            tsns: BTreeMap::new(),
            acks: HashMap::new(),
        }
    }

    /// `tsn` relative to this direction's first TSN, modulo 2^32.
    pub fn relative(&self, tsn: u32) -> u32 {
        tsn.wrapping_sub(self.first_tsn)
    }

    pub fn record(&self, tsn: u32) -> Option<&TsnRecord> {
        self.tsns.get(&self.relative(tsn))
    }
}

/// What the tracker knows about one DATA chunk's TSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsnAnnotation {
    pub tsn: u32,
    pub relative_tsn: u32,
    /// Frame of the first transmission when this one is a retransmission.
    pub retransmission_of: Option<u32>,
    /// Time since the first transmission, for retransmissions.
    pub retransmission_delay: Option<Duration>,
    /// Frame of an earlier acknowledgement when a retransmission follows it.
    pub reneged_ack: Option<u32>,
    pub retransmit_count: u32,
    /// Frames that retransmitted this TSN, reported on the first transmission.
    pub retransmitted_in: Vec<u32>,
    pub acked_in_frame: Option<u32>,
    pub rtt: Option<Duration>,
}

impl TsnAnnotation {
    pub fn is_retransmission(&self) -> bool {
        self.retransmission_of.is_some()
    }
}

/// One TSN acknowledged by a SACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedTsn {
    pub tsn: u32,
    pub sent_in_frame: u32,
    pub rtt: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AddrKey {
    src_port: u16,
    dst_port: u16,
    addr: Option<IpAddr>,
}

/// All half-associations of one capture.
#[derive(Debug, Default)]
pub struct TsnTracker {
    halves: Vec<HalfAssociation>,
    by_key: HashMap<HalfKey, HalfId>,
    /// Halves waiting for the opposite direction, keyed by their own source.
    /// An emptied slot is reused by the next unmatched half that looks it up.
    unmatched: HashMap<AddrKey, Option<HalfId>>,
}

fn elapsed(later: SystemTime, earlier: SystemTime) -> Duration {
    later.duration_since(earlier).unwrap_or(Duration::ZERO)
}

impl TsnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.halves.clear();
        self.by_key.clear();
        self.unmatched.clear();
    }

    pub fn half(&self, id: HalfId) -> Option<&HalfAssociation> {
        self.halves.get(id)
    }

    pub fn find(&self, key: &HalfKey) -> Option<HalfId> {
        self.by_key.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.halves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halves.is_empty()
    }

    /// Find or create the half-association for a packet and try to pair it
    /// with the opposite direction by ports and addresses.
    ///
    /// Returns `None` for a zero verification tag.
    pub fn half_association(
        &mut self,
        src_port: u16,
        dst_port: u16,
        vtag: u32,
        src: Option<IpAddr>,
        dst: Option<IpAddr>,
    ) -> Option<HalfId> {
        if vtag == 0 {
            return None;
        }
        let key = HalfKey {
            src_port,
            dst_port,
            vtag,
        };
        let id = match self.by_key.get(&key) {
            Some(&id) if self.halves[id].peer.is_some() => return Some(id),
            Some(&id) => id,
            None => {
                let id = self.halves.len();
                self.halves.push(HalfAssociation::new(key));
                self.by_key.insert(key, id);
                trace!(id, src_port, dst_port, vtag, "new half-association");
                id
            }
        };

        let mirrored = AddrKey {
            src_port: dst_port,
            dst_port: src_port,
            addr: dst,
        };
        match self.unmatched.get_mut(&mirrored) {
            Some(slot) => match slot.take() {
                None => *slot = Some(id),
                Some(other) if other == id => *slot = Some(other),
                Some(other) => {
                    self.halves[id].peer = Some(other);
                    self.halves[other].peer = Some(id);
                    debug!(a = id, b = other, "half-associations paired");
                }
            },
            None => {
                self.unmatched.insert(
                    AddrKey {
                        src_port,
                        dst_port,
                        addr: src,
                    },
                    Some(id),
                );
            }
        }
        Some(id)
    }

    /// Record a DATA chunk's TSN. Frame 0 means no frame numbering and
    /// disables tracking. On a revisited frame nothing new is recorded.
    pub fn observe_tsn(
        &mut self,
        half: HalfId,
        tsn: u32,
        frame: FrameInfo,
        visited: bool,
    ) -> Option<TsnAnnotation> {
        if frame.number == 0 {
            return None;
        }
        let h = self.halves.get_mut(half)?;
        if !h.started {
            h.first_tsn = tsn;
            h.started = true;
        }
        let relative_tsn = h.relative(tsn);
        let record = h.tsns.entry(relative_tsn).or_insert_with(|| TsnRecord {
            tsn,
            first_transmit: frame,
            ack: None,
            retransmits: Vec::new(),
            retransmit_count: 0,
        });

        let is_retransmission = record.first_transmit.number != frame.number;
        if is_retransmission && !visited {
            record.retransmit_count += 1;
            if record.retransmits.len() < MAX_RETRANS_TRACKED_PER_TSN {
                record.retransmits.push(frame);
            }
            trace!(tsn, frame = frame.number, first = record.first_transmit.number, "retransmission");
        }

        let mut annotation = TsnAnnotation {
            tsn,
            relative_tsn,
            retransmission_of: None,
            retransmission_delay: None,
            reneged_ack: None,
            retransmit_count: record.retransmit_count,
            retransmitted_in: Vec::new(),
            acked_in_frame: None,
            rtt: None,
        };
        if is_retransmission {
            annotation.retransmission_of = Some(record.first_transmit.number);
            annotation.retransmission_delay =
                Some(elapsed(frame.timestamp, record.first_transmit.timestamp));
            annotation.reneged_ack = record
                .ack
                .filter(|ack| ack.number < frame.number)
                .map(|ack| ack.number);
        } else {
            annotation.retransmitted_in = record.retransmits.iter().map(|r| r.number).collect();
        }
        if let Some(ack) = record.ack {
            annotation.acked_in_frame = Some(ack.number);
            annotation.rtt = Some(elapsed(ack.timestamp, record.first_transmit.timestamp));
        }
        Some(annotation)
    }

    /// Apply one acknowledged range sent by `half` to its peer's TSNs.
    ///
    /// `start` is `None` for the cumulative range, which begins at the peer's
    /// cumulative ack point and moves it past `end`. Returns the TSNs this
    /// frame acknowledged first within the range.
    pub fn ack_range(
        &mut self,
        half: HalfId,
        start: Option<u32>,
        end: u32,
        frame: FrameInfo,
        visited: bool,
    ) -> Vec<AckedTsn> {
        let mut acked = Vec::new();
        if frame.number == 0 {
            return acked;
        }
        let Some(peer_id) = self.halves.get(half).and_then(|h| h.peer) else {
            return acked;
        };
        let peer = &mut self.halves[peer_id];
        if !peer.started {
            return acked;
        }

        let rel_end = peer.relative(end);
        let rel_start = match start {
            Some(tsn) => peer.relative(tsn),
            None => peer.cumulative_ack,
        };

        if visited {
            if let Some(rels) = peer.acks.get(&frame.number) {
                for rel in rels {
                    let in_range = (start.is_none() || rel_start <= *rel) && *rel <= rel_end;
                    if !in_range {
                        continue;
                    }
                    if let Some(record) = peer.tsns.get(rel) {
                        push_acked(&mut acked, record, frame);
                    }
                }
            }
            return acked;
        }

        if rel_end < rel_start || rel_end - rel_start > MAX_ACK_SPAN {
            return acked;
        }
        if start.is_none() {
            peer.cumulative_ack = rel_end.wrapping_add(1);
        }
        if rel_end - rel_start >= MAX_ACK_WALK {
            debug!(rel_start, rel_end, "ack range too large to walk");
            return acked;
        }

        for rel in rel_start..=rel_end {
            let Some(record) = peer.tsns.get_mut(&rel) else {
                continue;
            };
            if record.ack.is_none() {
                record.ack = Some(frame);
                peer.acks.entry(frame.number).or_default().push(rel);
            }
            push_acked(&mut acked, record, frame);
        }
        acked
    }

    /// Apply a SACK: the cumulative range first, then each well-formed gap
    /// block. Malformed blocks (start after end) are skipped.
    pub fn observe_sack(
        &mut self,
        half: HalfId,
        cumulative_tsn_ack: u32,
        gap_blocks: &[GapBlock],
        frame: FrameInfo,
        visited: bool,
    ) -> Vec<AckedTsn> {
        let mut acked = self.ack_range(half, None, cumulative_tsn_ack, frame, visited);
        for block in gap_blocks {
            if block.validate().is_err() {
                continue;
            }
            let (start, end) = block.tsn_range(cumulative_tsn_ack);
            acked.extend(self.ack_range(half, Some(start), end, frame, visited));
        }
        acked
    }
}

fn push_acked(acked: &mut Vec<AckedTsn>, record: &TsnRecord, frame: FrameInfo) {
    if let Some(ack) = record.ack {
        if ack.number == frame.number {
            acked.push(AckedTsn {
                tsn: record.tsn,
                sent_in_frame: record.first_transmit.number,
                rtt: elapsed(ack.timestamp, record.first_transmit.timestamp),
            });
        }
    }
}
