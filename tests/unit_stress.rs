//! Unit-level stress tests exercising the decoders and stateful analyses
//! with adversarial inputs. Nothing here may panic.

use sctpscope::analyzer::{Analyzer, PacketContext};
use sctpscope::config::{AnalyzerConfig, ChecksumMode};
use sctpscope::protocol::{extract_sctp, LinkType};
use sctpscope::reassembly::{MessageKey, Reassembler, Reassembly};
use sctpscope::sctp::params::Parameters;
use sctpscope::sctp::{Chunk, GapBlock, SctpPacket};
use sctpscope::tsn::{FrameInfo, TsnTracker};

use std::time::{Duration, SystemTime};

fn ctx(frame: u32) -> PacketContext {
    PacketContext {
        frame,
        timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(u64::from(frame)),
        src: None,
        dst: None,
        truncated: false,
    }
}

fn frame(number: u32) -> FrameInfo {
    FrameInfo {
        number,
        timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(u64::from(number)),
    }
}

fn header(vtag: u32) -> Vec<u8> {
    let mut pkt = vec![0x13, 0x88, 0x0b, 0x59];
    pkt.extend_from_slice(&vtag.to_be_bytes());
    pkt.extend_from_slice(&[0; 4]);
    pkt
}

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn bytes(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.next() as u8).collect()
    }
}

fn decode_everything(bytes: &[u8]) {
    let Ok(packet) = SctpPacket::parse(bytes) else {
        return;
    };
    for raw in packet.chunks().flatten() {
        if let Ok(Chunk::Init(init) | Chunk::InitAck(init)) = Chunk::decode(&raw) {
            for _ in init.params() {}
        }
    }
}

// =============================================================================
// Decoder
// =============================================================================

#[test]
fn decoder_empty_and_short_inputs() {
    for len in 0..16 {
        decode_everything(&vec![0xff; len]);
    }
}

#[test]
fn decoder_all_chunk_types_with_every_small_length() {
    for chunk_type in 0..=255u8 {
        for length in 0..24u16 {
            let mut pkt = header(1);
            pkt.push(chunk_type);
            pkt.push(0xff);
            pkt.extend_from_slice(&length.to_be_bytes());
            pkt.extend_from_slice(&[0xff; 20]);
            decode_everything(&pkt);
        }
    }
}

#[test]
fn decoder_random_bytes() {
    let mut rng = Lcg(7);
    for _ in 0..2_000 {
        let len = (rng.next() % 200) as usize;
        let mut pkt = header(rng.next());
        pkt.extend(rng.bytes(len));
        decode_everything(&pkt);
    }
}

#[test]
fn sack_with_huge_declared_counts() {
    let mut pkt = header(1);
    pkt.extend_from_slice(&[3, 0, 0, 20]);
    pkt.extend_from_slice(&1u32.to_be_bytes());
    pkt.extend_from_slice(&1u32.to_be_bytes());
    pkt.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    pkt.extend_from_slice(&[0, 1, 0, 2]);
    let packet = SctpPacket::parse(&pkt).unwrap();
    let raw = packet.chunks().next().unwrap().unwrap();
    let Ok(Chunk::Sack(sack)) = Chunk::decode(&raw) else {
        panic!("expected SACK");
    };
    assert_eq!(sack.gap_blocks.len(), 1);
    assert!(sack.truncation.is_some());
}

#[test]
fn parameter_walk_zero_length() {
    let bytes = [0, 1, 0, 0, 0, 5, 0, 8, 10, 0, 0, 1];
    let items: Vec<_> = Parameters::new(&bytes).collect();
    assert_eq!(items.len(), 1);
    assert!(items[0].is_err());
}

#[test]
fn gap_block_extremes() {
    let block = GapBlock { start: 1, end: u16::MAX };
    assert!(block.validate().is_ok());
    assert_eq!(block.tsn_range(u32::MAX), (0, u32::from(u16::MAX) - 1));
    assert!(GapBlock { start: 9, end: 1 }.validate().is_err());
}

// =============================================================================
// Frame extraction
// =============================================================================

#[test]
fn frame_extraction_random_bytes() {
    let mut rng = Lcg(99);
    for _ in 0..2_000 {
        let len = (rng.next() % 120) as usize;
        let data = rng.bytes(len);
        for lt in [LinkType::Ethernet, LinkType::RawIp, LinkType::LinuxSll] {
            let _ = extract_sctp(&data, lt, 9899);
        }
    }
}

// =============================================================================
// TSN tracker
// =============================================================================

#[test]
fn retransmission_list_is_capped_but_counter_is_not() {
    let mut t = TsnTracker::new();
    let h = t.half_association(1, 2, 3, None, None).unwrap();
    t.observe_tsn(h, 42, frame(1), false);
    for n in 2..=300 {
        t.observe_tsn(h, 42, frame(n), false);
    }
    let record = t.half(h).unwrap().record(42).unwrap();
    assert_eq!(record.retransmit_count, 299);
    assert_eq!(record.retransmits.len(), 100);
}

#[test]
fn huge_sack_range_moves_the_ack_point_without_walking() {
    let mut t = TsnTracker::new();
    let a = t.half_association(5000, 9, 0xb, None, None).unwrap();
    let b = t.half_association(9, 5000, 0xa, None, None).unwrap();
    t.observe_tsn(a, 0, frame(1), false);
    t.observe_tsn(a, 100_000, frame(2), false);

    let acked = t.observe_sack(b, 200_000, &[], frame(3), false);
    assert!(acked.is_empty());
    assert_eq!(t.half(a).unwrap().cumulative_ack, 200_001);

    let acked = t.observe_sack(b, 200_000, &[GapBlock { start: 1, end: u16::MAX }], frame(4), false);
    assert!(acked.is_empty());
}

#[test]
fn sack_without_peer_or_tsns() {
    let mut t = TsnTracker::new();
    let lonely = t.half_association(1, 2, 3, None, None).unwrap();
    assert!(t.observe_sack(lonely, 10, &[GapBlock { start: 2, end: 1 }], frame(1), false).is_empty());
    assert!(t.observe_tsn(lonely, 1, frame(0), false).is_none());
    assert!(t.observe_tsn(99, 1, frame(1), false).is_none());
}

// =============================================================================
// Reassembler
// =============================================================================

fn key() -> MessageKey {
    MessageKey {
        src_port: 1,
        dst_port: 2,
        vtag: 3,
        stream_id: 0,
        seq: 0,
        unordered: false,
    }
}

#[test]
fn many_begins_without_ends_stay_pending() {
    let mut r = Reassembler::new();
    for tsn in 0..2_000u32 {
        r.add_fragment(key(), tsn * 2, tsn + 1, true, false, 0, b"x");
        assert_eq!(r.try_reassemble(&key(), tsn * 2, tsn + 1), Reassembly::Pending);
    }
    assert_eq!(r.pending_fragments(), 2_000);
}

#[test]
fn interleaved_messages_in_one_group() {
    let mut r = Reassembler::new();
    let mut completed = 0;
    for msg in 0..50u32 {
        let base = msg * 3;
        let order = [base + 2, base, base + 1];
        for (i, tsn) in order.iter().enumerate() {
            let begin = *tsn == base;
            let end = *tsn == base + 2;
            let frame = base + i as u32 + 1;
            r.add_fragment(key(), *tsn, frame, begin, end, 0, b"ab");
            if let Reassembly::Complete(m) = r.try_reassemble(&key(), *tsn, frame) {
                assert_eq!(m.data.len(), 6);
                completed += 1;
            }
        }
    }
    assert_eq!(completed, 50);
}

#[test]
fn random_fragment_storm() {
    let mut rng = Lcg(3);
    let mut r = Reassembler::new();
    for n in 1..5_000u32 {
        let tsn = rng.next() % 64;
        let flags = rng.next();
        let len = (rng.next() % 4) as usize;
        let payload = rng.bytes(len);
        r.add_fragment(key(), tsn, n, flags & 1 != 0, flags & 2 != 0, 0, &payload);
        let _ = r.try_reassemble(&key(), tsn, n);
    }
}

// =============================================================================
// Analyzer
// =============================================================================

#[test]
fn analyzer_random_packets_under_every_config() {
    let configs = [
        AnalyzerConfig::default(),
        AnalyzerConfig {
            checksum: ChecksumMode::Automatic,
            tsn_analysis: false,
            reassembly: false,
            ..AnalyzerConfig::default()
        },
        AnalyzerConfig {
            checksum: ChecksumMode::Adler32,
            ..AnalyzerConfig::default()
        },
    ];
    for config in configs {
        let mut a = Analyzer::new(config);
        let mut rng = Lcg(11);
        for n in 1..1_500u32 {
            let mut pkt = header(rng.next() % 4);
            // Mostly DATA and SACK with random bodies.
            let chunk_type = [0u8, 3, 64, 16, 1, 6][(rng.next() % 6) as usize];
            let body_len = (rng.next() % 40) as usize;
            let body = rng.bytes(body_len);
            pkt.push(chunk_type);
            pkt.push(rng.next() as u8);
            pkt.extend_from_slice(&((4 + body.len()) as u16).to_be_bytes());
            pkt.extend(body);
            let frame = if n % 3 == 0 { n / 2 } else { n };
            let _ = a.process(&ctx(frame), &pkt);
        }
    }
}

#[test]
fn analyzer_truncated_frames_skip_checksum_and_reassembly() {
    let mut a = Analyzer::default();
    let mut pkt = header(5);
    pkt.extend_from_slice(&[0, 0x02, 0, 18, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, b'h', b'i', 0, 0]);
    let report = a
        .process(
            &PacketContext {
                truncated: true,
                ..ctx(1)
            },
            &pkt,
        )
        .unwrap();
    assert_eq!(report.checksum, sctpscope::sctp::checksum::ChecksumStatus::Unverified);
    assert_eq!(
        report.chunks[0].fragment,
        Some(sctpscope::analyzer::FragmentStatus::NotReassembled)
    );
    assert_eq!(a.reassembler().group_count(), 0);
}
