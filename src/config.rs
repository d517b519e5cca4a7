use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Default UDP port for SCTP-over-UDP encapsulation (RFC 6951).
pub const DEFAULT_UDP_TUNNELING_PORT: u16 = 9899;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    /// Do not verify checksums.
    None,
    /// RFC 2960 Adler-32.
    Adler32,
    /// RFC 9260 CRC32c.
    #[default]
    Crc32c,
    /// Accept whichever algorithm matches.
    Automatic,
}

/// Knobs for one analysis session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub checksum: ChecksumMode,
    /// Track TSNs, retransmissions and SACK acknowledgements.
    pub tsn_analysis: bool,
    /// Reassemble fragmented user messages.
    pub reassembly: bool,
    /// Decode UDP on this port as encapsulated SCTP. 0 disables it.
    pub udp_tunneling_port: u16,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            checksum: ChecksumMode::default(),
            tsn_analysis: true,
            reassembly: true,
            udp_tunneling_port: DEFAULT_UDP_TUNNELING_PORT,
        }
    }
}
