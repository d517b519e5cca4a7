//! Packet checksum oracle: CRC32c (RFC 9260) and legacy Adler-32 (RFC 2960).
//!
//! Both are computed over the packet with the checksum field zeroed.

use std::fmt;

use crate::config::ChecksumMode;

use super::COMMON_HEADER_LEN;

const ADLER_MOD: u32 = 65521;
// Largest n such that 255n(n+1)/2 + (n+1)(MOD-1) fits in u32.
const ADLER_NMAX: usize = 5552;
const ZERO_CHECKSUM: [u8; 4] = [0; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Adler32,
    Crc32c,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Adler32 => f.write_str("adler32"),
            ChecksumKind::Crc32c => f.write_str("crc32c"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Checking disabled, or the frame was truncated by the capture.
    Unverified,
    Valid(ChecksumKind),
    Invalid {
        kind: ChecksumKind,
        computed: u32,
        stored: u32,
    },
}

impl ChecksumStatus {
    pub fn is_invalid(&self) -> bool {
        matches!(self, ChecksumStatus::Invalid { .. })
    }
}

/// CRC32c over the packet with the checksum field treated as zero.
pub fn crc32c(packet: &[u8]) -> u32 {
    if packet.len() < COMMON_HEADER_LEN {
        return crc32c::crc32c(packet);
    }
    let crc = crc32c::crc32c(&packet[..8]);
    let crc = crc32c::crc32c_append(crc, &ZERO_CHECKSUM);
    crc32c::crc32c_append(crc, &packet[COMMON_HEADER_LEN..])
}

/// Adler-32 over the packet with the checksum field treated as zero.
pub fn adler32(packet: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    let mut feed = |bytes: &[u8]| {
        for block in bytes.chunks(ADLER_NMAX) {
            for &byte in block {
                a += byte as u32;
                b += a;
            }
            a %= ADLER_MOD;
            b %= ADLER_MOD;
        }
    };
    if packet.len() < COMMON_HEADER_LEN {
        feed(packet);
    } else {
        feed(&packet[..8]);
        feed(&ZERO_CHECKSUM);
        feed(&packet[COMMON_HEADER_LEN..]);
    }
    (b << 16) | a
}

fn check(kind: ChecksumKind, packet: &[u8], stored: [u8; 4]) -> ChecksumStatus {
    let (computed, stored) = match kind {
        // CRC32c is transmitted least significant byte first.
        ChecksumKind::Crc32c => (crc32c(packet), u32::from_le_bytes(stored)),
        ChecksumKind::Adler32 => (adler32(packet), u32::from_be_bytes(stored)),
    };
    if computed == stored {
        ChecksumStatus::Valid(kind)
    } else {
        ChecksumStatus::Invalid {
            kind,
            computed,
            stored,
        }
    }
}

/// Verify `packet` (common header included) under `mode`.
///
/// `Automatic` accepts whichever algorithm matches and reports a CRC32c
/// failure when neither does.
pub fn verify(mode: ChecksumMode, packet: &[u8], truncated: bool) -> ChecksumStatus {
    if truncated || packet.len() < COMMON_HEADER_LEN {
        return ChecksumStatus::Unverified;
    }
    let stored = [packet[8], packet[9], packet[10], packet[11]];
    match mode {
        ChecksumMode::None => ChecksumStatus::Unverified,
        ChecksumMode::Adler32 => check(ChecksumKind::Adler32, packet, stored),
        ChecksumMode::Crc32c => check(ChecksumKind::Crc32c, packet, stored),
        ChecksumMode::Automatic => {
            let crc = check(ChecksumKind::Crc32c, packet, stored);
            if crc.is_invalid() {
                let adler = check(ChecksumKind::Adler32, packet, stored);
                if !adler.is_invalid() {
                    return adler;
                }
            }
            crc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_cookie_ack() -> Vec<u8> {
        let mut pkt = vec![0x13, 0x88, 0x00, 0x09, 0, 0, 0, 1, 0, 0, 0, 0];
        pkt.extend_from_slice(&[11, 0, 0, 4]);
        pkt
    }

    #[test]
    fn crc32c_known_vector() {
        // RFC 3720 B.4: 32 bytes of zero.
        assert_eq!(crc32c::crc32c(&[0u8; 32]), 0x8a91_36aa);
    }

    #[test]
    fn adler32_known_vector() {
        // "Wikipedia" without a checksum field to skip.
        let mut a: u32 = 1;
        let mut b: u32 = 0;
        for &byte in b"Wikipedia" {
            a = (a + byte as u32) % ADLER_MOD;
            b = (b + a) % ADLER_MOD;
        }
        assert_eq!((b << 16) | a, 0x11e6_0398);
        assert_eq!(adler32(b"Wikipedia"), 0x11e6_0398);
    }

    #[test]
    fn crc32c_ignores_stored_checksum() {
        let mut pkt = packet_with_cookie_ack();
        let before = crc32c(&pkt);
        pkt[8..12].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(crc32c(&pkt), before);
    }

    #[test]
    fn verify_crc32c_little_endian() {
        let mut pkt = packet_with_cookie_ack();
        let crc = crc32c(&pkt);
        pkt[8..12].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            verify(ChecksumMode::Crc32c, &pkt, false),
            ChecksumStatus::Valid(ChecksumKind::Crc32c)
        );
        assert_eq!(
            verify(ChecksumMode::Automatic, &pkt, false),
            ChecksumStatus::Valid(ChecksumKind::Crc32c)
        );
        assert!(verify(ChecksumMode::Adler32, &pkt, false).is_invalid());
    }

    #[test]
    fn verify_adler32_big_endian() {
        let mut pkt = packet_with_cookie_ack();
        let sum = adler32(&pkt);
        pkt[8..12].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(
            verify(ChecksumMode::Adler32, &pkt, false),
            ChecksumStatus::Valid(ChecksumKind::Adler32)
        );
        assert_eq!(
            verify(ChecksumMode::Automatic, &pkt, false),
            ChecksumStatus::Valid(ChecksumKind::Adler32)
        );
    }

    #[test]
    fn truncated_or_disabled_is_unverified() {
        let pkt = packet_with_cookie_ack();
        assert_eq!(
            verify(ChecksumMode::Crc32c, &pkt, true),
            ChecksumStatus::Unverified
        );
        assert_eq!(
            verify(ChecksumMode::None, &pkt, false),
            ChecksumStatus::Unverified
        );
    }

    #[test]
    fn automatic_reports_crc_failure() {
        let mut pkt = packet_with_cookie_ack();
        pkt[8..12].copy_from_slice(&[1, 2, 3, 4]);
        match verify(ChecksumMode::Automatic, &pkt, false) {
            ChecksumStatus::Invalid { kind, stored, .. } => {
                assert_eq!(kind, ChecksumKind::Crc32c);
                assert_eq!(stored, u32::from_le_bytes([1, 2, 3, 4]));
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }
}
