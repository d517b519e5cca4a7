//! Reassembly of user messages fragmented across DATA / I-DATA chunks.
//!
//! Fragments are grouped by [`MessageKey`]. Within a group they are ordered by
//! TSN (or FSN for I-DATA) and a message is complete once a begin marker, an
//! end marker and every sequence number between them are present, allowing a
//! single wrap through `u32::MAX`. Completed ranges are remembered so that a
//! revisit of the completing fragment returns the cached message and other
//! fragments of it point at the frame where it was reassembled.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Identity of one message's fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub src_port: u16,
    pub dst_port: u16,
    pub vtag: u32,
    pub stream_id: u16,
    /// SSN for DATA (0 when unordered), MID for I-DATA.
    pub seq: u32,
    pub unordered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// TSN for DATA, FSN for I-DATA.
    pub tsn: u32,
    pub frame: u32,
    pub len: usize,
    /// Meaningful on the begin fragment only.
    pub ppid: u32,
    /// Released once the fragment is consumed into a message.
    pub data: Option<Bytes>,
}

/// A reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub begin: u32,
    pub end: u32,
    /// Fragment whose arrival completed the message.
    pub trigger_tsn: u32,
    pub reassembled_in: u32,
    pub ppid: u32,
    pub data: Bytes,
}

impl Message {
    pub fn fragment_count(&self) -> u64 {
        if self.begin <= self.end {
            u64::from(self.end - self.begin) + 1
        } else {
            u64::from(u32::MAX - self.begin) + 1 + u64::from(self.end) + 1
        }
    }

    fn contains(&self, tsn: u32) -> bool {
        if self.begin <= self.end {
            self.begin <= tsn && tsn <= self.end
        } else {
            self.begin <= tsn || tsn <= self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New fragment stored.
    Stored,
    /// Same fragment seen again in the same frame.
    Revisit,
    /// Same sequence number already stored from another frame.
    Duplicate { original_frame: u32 },
    /// Nothing to store.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// This fragment completed the message (now or on an earlier pass).
    Complete(Message),
    /// Fragment of a message completed by another fragment.
    PartOf { reassembled_in: u32 },
    /// More fragments needed.
    Pending,
}

#[derive(Debug, Default)]
struct MessageGroup {
    fragments: BTreeMap<u32, Fragment>,
    begins: BTreeSet<u32>,
    ends: BTreeSet<u32>,
    completed: Vec<Message>,
}

impl MessageGroup {
    fn count_present(&self, from: u32, to: u32) -> Option<u64> {
        let mut count = 0u64;
        for fragment in self.fragments.range(from..=to).map(|(_, f)| f) {
            // A released fragment in range belongs to another message.
            fragment.data.as_ref()?;
            count += 1;
        }
        Some(count)
    }

    fn contiguous(&self, begin: u32, end: u32) -> bool {
        if begin <= end {
            self.count_present(begin, end) == Some(u64::from(end - begin) + 1)
        } else {
            self.count_present(begin, u32::MAX) == Some(u64::from(u32::MAX - begin) + 1)
                && self.count_present(0, end) == Some(u64::from(end) + 1)
        }
    }

    fn take_payload(&mut self, from: u32, to: u32, out: &mut BytesMut) {
        for fragment in self.fragments.range_mut(from..=to).map(|(_, f)| f) {
            if let Some(data) = fragment.data.take() {
                out.extend_from_slice(&data);
            }
        }
    }
}

/// Fragment groups for one capture.
#[derive(Debug, Default)]
pub struct Reassembler {
    groups: HashMap<MessageKey, MessageGroup>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Fragments still holding payload, across all groups.
    pub fn pending_fragments(&self) -> usize {
        self.groups
            .values()
            .flat_map(|g| g.fragments.values())
            .filter(|f| f.data.is_some())
            .count()
    }

    pub fn fragment(&self, key: &MessageKey, tsn: u32) -> Option<&Fragment> {
        self.groups.get(key)?.fragments.get(&tsn)
    }

    /// Store one fragment. A message takes its PPID from its begin fragment.
    #[allow(clippy::too_many_arguments)]
    pub fn add_fragment(
        &mut self,
        key: MessageKey,
        tsn: u32,
        frame: u32,
        begin: bool,
        end: bool,
        ppid: u32,
        payload: &[u8],
    ) -> AddOutcome {
        let group = self.groups.entry(key).or_default();

        if let Some(existing) = group.fragments.get(&tsn) {
            if existing.frame == frame {
                return AddOutcome::Revisit;
            }
            trace!(tsn, frame, original = existing.frame, "duplicate fragment");
            return AddOutcome::Duplicate {
                original_frame: existing.frame,
            };
        }

        if payload.is_empty() {
            return AddOutcome::Empty;
        }

        group.fragments.insert(
            tsn,
            Fragment {
                tsn,
                frame,
                len: payload.len(),
                ppid,
                data: Some(Bytes::copy_from_slice(payload)),
            },
        );
        match (begin, end) {
            (true, false) => {
                group.begins.insert(tsn);
            }
            (false, true) => {
                group.ends.insert(tsn);
            }
            _ => {}
        }
        AddOutcome::Stored
    }

    /// Try to complete the message that the fragment `tsn` seen in `frame`
    /// belongs to.
    pub fn try_reassemble(&mut self, key: &MessageKey, tsn: u32, frame: u32) -> Reassembly {
        let Some(group) = self.groups.get_mut(key) else {
            return Reassembly::Pending;
        };

        if let Some(message) = group.completed.iter().find(|m| m.contains(tsn)) {
            if message.trigger_tsn == tsn && message.reassembled_in == frame {
                return Reassembly::Complete(message.clone());
            }
            return Reassembly::PartOf {
                reassembled_in: message.reassembled_in,
            };
        }

        // Nearest begin at or below, else the highest (the TSN space may
        // have wrapped since the message started). Ends mirror this.
        let begin = group
            .begins
            .range(..=tsn)
            .next_back()
            .or_else(|| group.begins.iter().next_back())
            .copied();
        let end = group
            .ends
            .range(tsn..)
            .next()
            .or_else(|| group.ends.iter().next())
            .copied();
        let (Some(begin), Some(end)) = (begin, end) else {
            return Reassembly::Pending;
        };
        let lowest = group.fragments.keys().next().copied();
        if begin > end && lowest != Some(0) {
            return Reassembly::Pending;
        }
        if !group.contiguous(begin, end) {
            return Reassembly::Pending;
        }

        let ppid = group.fragments.get(&begin).map_or(0, |f| f.ppid);
        let mut data = BytesMut::new();
        if begin <= end {
            group.take_payload(begin, end, &mut data);
        } else {
            group.take_payload(begin, u32::MAX, &mut data);
            group.take_payload(0, end, &mut data);
        }
        group.begins.remove(&begin);
        group.ends.remove(&end);

        let message = Message {
            begin,
            end,
            trigger_tsn: tsn,
            reassembled_in: frame,
            ppid,
            data: data.freeze(),
        };
        trace!(begin, end, frame, len = message.data.len(), "message reassembled");
        group.completed.push(message.clone());
        Reassembly::Complete(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MessageKey {
        MessageKey {
            src_port: 5000,
            dst_port: 9,
            vtag: 0x1234,
            stream_id: 3,
            seq: 7,
            unordered: false,
        }
    }

    fn add(r: &mut Reassembler, tsn: u32, frame: u32, b: bool, e: bool, data: &[u8]) -> AddOutcome {
        r.add_fragment(key(), tsn, frame, b, e, 46, data)
    }

    fn complete(result: Reassembly) -> Message {
        match result {
            Reassembly::Complete(msg) => msg,
            other => panic!("expected complete message, got {:?}", other),
        }
    }

    #[test]
    fn in_order_three_fragments() {
        let mut r = Reassembler::new();
        assert_eq!(add(&mut r, 10, 1, true, false, b"AB"), AddOutcome::Stored);
        assert_eq!(r.try_reassemble(&key(), 10, 1), Reassembly::Pending);
        add(&mut r, 11, 2, false, false, b"CD");
        assert_eq!(r.try_reassemble(&key(), 11, 2), Reassembly::Pending);
        add(&mut r, 12, 3, false, true, b"EF");
        let msg = complete(r.try_reassemble(&key(), 12, 3));
        assert_eq!(&msg.data[..], b"ABCDEF");
        assert_eq!((msg.begin, msg.end, msg.reassembled_in), (10, 12, 3));
        assert_eq!(msg.ppid, 46);
        assert_eq!(msg.fragment_count(), 3);
        assert_eq!(r.pending_fragments(), 0);
    }

    #[test]
    fn revisiting_trigger_returns_cached_message() {
        let mut r = Reassembler::new();
        add(&mut r, 10, 1, true, false, b"AB");
        add(&mut r, 11, 2, false, false, b"CD");
        add(&mut r, 12, 3, false, true, b"EF");
        let first = complete(r.try_reassemble(&key(), 12, 3));

        assert_eq!(add(&mut r, 12, 3, false, true, b"EF"), AddOutcome::Revisit);
        let again = complete(r.try_reassemble(&key(), 12, 3));
        assert_eq!(first, again);
        assert_eq!(
            r.try_reassemble(&key(), 10, 1),
            Reassembly::PartOf { reassembled_in: 3 }
        );
    }

    #[test]
    fn out_of_order_completion() {
        let mut r = Reassembler::new();
        add(&mut r, 12, 1, false, true, b"EF");
        assert_eq!(r.try_reassemble(&key(), 12, 1), Reassembly::Pending);
        add(&mut r, 10, 2, true, false, b"AB");
        assert_eq!(r.try_reassemble(&key(), 10, 2), Reassembly::Pending);
        add(&mut r, 11, 3, false, false, b"CD");
        let msg = complete(r.try_reassemble(&key(), 11, 3));
        assert_eq!(&msg.data[..], b"ABCDEF");
        assert_eq!(msg.trigger_tsn, 11);
    }

    #[test]
    fn duplicate_from_other_frame() {
        let mut r = Reassembler::new();
        add(&mut r, 10, 1, true, false, b"AB");
        assert_eq!(
            add(&mut r, 10, 4, true, false, b"AB"),
            AddOutcome::Duplicate { original_frame: 1 }
        );
        assert_eq!(r.fragment(&key(), 10).unwrap().frame, 1);
    }

    #[test]
    fn empty_payload_is_not_stored() {
        let mut r = Reassembler::new();
        assert_eq!(add(&mut r, 10, 1, true, false, b""), AddOutcome::Empty);
        assert!(r.fragment(&key(), 10).is_none());
    }

    #[test]
    fn missing_middle_stays_pending() {
        let mut r = Reassembler::new();
        add(&mut r, 10, 1, true, false, b"AB");
        add(&mut r, 12, 2, false, true, b"EF");
        assert_eq!(r.try_reassemble(&key(), 12, 2), Reassembly::Pending);
        assert_eq!(r.pending_fragments(), 2);
    }

    #[test]
    fn wraps_through_max_tsn() {
        let mut r = Reassembler::new();
        add(&mut r, u32::MAX - 1, 1, true, false, b"a");
        add(&mut r, u32::MAX, 2, false, false, b"b");
        add(&mut r, 0, 3, false, false, b"c");
        assert_eq!(r.try_reassemble(&key(), 0, 3), Reassembly::Pending);
        add(&mut r, 1, 4, false, true, b"d");
        let msg = complete(r.try_reassemble(&key(), 1, 4));
        assert_eq!(&msg.data[..], b"abcd");
        assert_eq!(msg.fragment_count(), 4);
        assert_eq!(
            r.try_reassemble(&key(), u32::MAX, 2),
            Reassembly::PartOf { reassembled_in: 4 }
        );
    }

    #[test]
    fn wrap_without_zero_is_pending() {
        let mut r = Reassembler::new();
        add(&mut r, u32::MAX, 1, true, false, b"a");
        add(&mut r, 1, 2, false, true, b"c");
        assert_eq!(r.try_reassemble(&key(), 1, 2), Reassembly::Pending);
    }

    #[test]
    fn two_unordered_messages_share_a_group() {
        let mut r = Reassembler::new();
        let k = MessageKey {
            seq: 0,
            unordered: true,
            ..key()
        };
        r.add_fragment(k, 20, 1, true, false, 1, b"x1");
        r.add_fragment(k, 21, 2, false, true, 1, b"x2");
        assert_eq!(&complete(r.try_reassemble(&k, 21, 2)).data[..], b"x1x2");

        r.add_fragment(k, 30, 3, true, false, 2, b"y1");
        r.add_fragment(k, 31, 4, false, true, 2, b"y2");
        let second = complete(r.try_reassemble(&k, 31, 4));
        assert_eq!(&second.data[..], b"y1y2");
        assert_eq!(second.ppid, 2);
        assert_eq!(r.group_count(), 1);
    }

    #[test]
    fn interleaved_unordered_messages_keep_their_own_ppid() {
        let mut r = Reassembler::new();
        let k = MessageKey {
            seq: 0,
            unordered: true,
            ..key()
        };
        r.add_fragment(k, 20, 1, true, false, 1, b"x1");
        assert_eq!(r.try_reassemble(&k, 20, 1), Reassembly::Pending);
        r.add_fragment(k, 22, 2, true, false, 2, b"y1");
        assert_eq!(r.try_reassemble(&k, 22, 2), Reassembly::Pending);
        r.add_fragment(k, 23, 3, false, true, 0, b"y2");
        let y = complete(r.try_reassemble(&k, 23, 3));
        r.add_fragment(k, 21, 4, false, true, 0, b"x2");
        let x = complete(r.try_reassemble(&k, 21, 4));

        assert_eq!((&y.data[..], y.ppid), (&b"y1y2"[..], 2));
        assert_eq!((&x.data[..], x.ppid), (&b"x1x2"[..], 1));
    }

    #[test]
    fn replayed_sequence_yields_same_state() {
        let mut r = Reassembler::new();
        let frames = [(10u32, 1u32, true, false, b"AB"), (11, 2, false, false, b"CD"), (12, 3, false, true, b"EF")];
        let mut results = Vec::new();
        for pass in 0..2 {
            for &(tsn, frame, b, e, data) in &frames {
                let outcome = add(&mut r, tsn, frame, b, e, data);
                if pass == 1 {
                    assert_eq!(outcome, AddOutcome::Revisit);
                }
                results.push(r.try_reassemble(&key(), tsn, frame));
            }
        }
        assert_eq!(results[2], results[5]);
        assert_eq!(results[3], Reassembly::PartOf { reassembled_in: 3 });
        assert_eq!(r.pending_fragments(), 0);
    }
}
