use anyhow::{Context, Result};
use pcap::{Capture, Device};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::protocol::LinkType;

/// One captured frame.
pub struct PacketData<'a> {
    /// 1-based position in the capture.
    pub frame: u32,
    pub data: &'a [u8],
    pub timestamp: SystemTime,
    /// The capture kept fewer bytes than the frame had on the wire.
    pub truncated: bool,
}

pub enum PacketSource {
    Live(Capture<pcap::Active>, LinkType),
    File(Capture<pcap::Offline>, LinkType),
}

impl PacketSource {
    pub fn link_type(&self) -> LinkType {
        match self {
            PacketSource::Live(_, lt) | PacketSource::File(_, lt) => *lt,
        }
    }

    /// Live sources can only be read once; files can be reopened for replay.
    pub fn is_live(&self) -> bool {
        matches!(self, PacketSource::Live(..))
    }

    pub fn live(
        interface: Option<&str>,
        snaplen: i32,
        promisc: bool,
        bpf: Option<&str>,
    ) -> Result<Self> {
        let device = match interface {
            Some(name) => Device::list()?
                .into_iter()
                .find(|d| d.name == name)
                .context(format!("Interface '{}' not found", name))?,
            None => Device::lookup()?.context("No capture device found")?,
        };

        let mut cap = Capture::from_device(device)?
            .snaplen(snaplen)
            .promisc(promisc)
            .timeout(1000)
            .open()
            .context("Failed to open capture device")?;

        if let Some(filter) = bpf {
            cap.filter(filter, true)
                .context(format!("Invalid BPF filter: {}", filter))?;
        }

        let lt = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::Live(cap, lt))
    }

    pub fn from_file(path: &Path, bpf: Option<&str>) -> Result<Self> {
        let mut cap = Capture::from_file(path)
            .context(format!("Failed to open pcap file: {}", path.display()))?;

        if let Some(filter) = bpf {
            cap.filter(filter, true)
                .context(format!("Invalid BPF filter: {}", filter))?;
        }

        let lt = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::File(cap, lt))
    }

    /// Iterate over packets in capture order, calling `f` for each one.
    /// Return `false` from `f` to stop capture.
    pub fn for_each_packet<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(PacketData) -> bool,
    {
        let mut frame: u32 = 0;
        loop {
            let raw = match self {
                PacketSource::Live(cap, _) => cap.next_packet(),
                PacketSource::File(cap, _) => cap.next_packet(),
            };

            match raw {
                Ok(packet) => {
                    frame = frame.saturating_add(1);
                    let ts = {
                        let tv = packet.header.ts;
                        let secs = (tv.tv_sec as i64).max(0) as u64;
                        // Clamp to guard against malformed pcap/pcapng files.
                        let usec = (tv.tv_usec as i64).clamp(0, 999_999) as u32;
                        UNIX_EPOCH + Duration::new(secs, usec * 1000)
                    };

                    let pkt = PacketData {
                        frame,
                        data: packet.data,
                        timestamp: ts,
                        truncated: packet.header.caplen < packet.header.len,
                    };

                    if !f(pkt) {
                        break;
                    }
                }
                Err(pcap::Error::NoMorePackets) => break,
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

fn link_type_from_pcap(dl: pcap::Linktype) -> LinkType {
    match dl.0 {
        1 => LinkType::Ethernet,     // DLT_EN10MB
        12 | 101 => LinkType::RawIp, // DLT_RAW
        113 => LinkType::LinuxSll,   // DLT_LINUX_SLL
        _ => {
            warn!(
                link_type = dl.0,
                name = %dl.get_name().unwrap_or_default(),
                "unsupported link type, assuming Ethernet"
            );
            LinkType::Ethernet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_link_types() {
        assert_eq!(link_type_from_pcap(pcap::Linktype(1)), LinkType::Ethernet);
        assert_eq!(link_type_from_pcap(pcap::Linktype(12)), LinkType::RawIp);
        assert_eq!(link_type_from_pcap(pcap::Linktype(101)), LinkType::RawIp);
        assert_eq!(link_type_from_pcap(pcap::Linktype(113)), LinkType::LinuxSll);
    }

    #[test]
    fn unknown_link_type_falls_back_to_ethernet() {
        assert_eq!(link_type_from_pcap(pcap::Linktype(147)), LinkType::Ethernet);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = PacketSource::from_file(Path::new("/nonexistent/capture.pcap"), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to open pcap file"));
    }
}
