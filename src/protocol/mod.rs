use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;

/// IANA protocol number for SCTP.
pub const SCTP_IP_PROTOCOL: u8 = 132;

/// Link-layer type of the capture, determines how to parse raw packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    RawIp,
}

impl LinkType {
    /// Return the pcap link-layer header type value (DLT_*).
    pub fn pcap_link_type(self) -> u32 {
        match self {
            LinkType::Ethernet => 1,   // DLT_EN10MB
            LinkType::RawIp => 101,    // DLT_RAW
            LinkType::LinuxSll => 113, // DLT_LINUX_SLL
        }
    }
}

/// How the SCTP packet was carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encapsulation {
    /// Directly over IP (protocol 132).
    Ip,
    /// Over UDP (RFC 6951) on the configured tunneling port.
    Udp { src_port: u16, dst_port: u16 },
}

/// An SCTP packet located inside a captured frame.
#[derive(Debug)]
pub struct SctpFrame<'a> {
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub encapsulation: Encapsulation,
    /// Common header onward.
    pub sctp: &'a [u8],
}

/// Locate the SCTP packet in a captured frame.
///
/// Returns `None` for non-SCTP traffic and for IP fragments, which are not
/// reassembled. `udp_port` 0 disables SCTP-over-UDP.
pub fn extract_sctp(data: &[u8], link_type: LinkType, udp_port: u16) -> Option<SctpFrame<'_>> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkType::LinuxSll => {
            // Linux cooked capture v1: 16-byte header, then IP packet
            if data.len() < 16 {
                return None;
            }
            SlicedPacket::from_ip(&data[16..]).ok()?
        }
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            Some(IpAddr::V4(ipv4.header().source_addr())),
            Some(IpAddr::V4(ipv4.header().destination_addr())),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            Some(IpAddr::V6(ipv6.header().source_addr())),
            Some(IpAddr::V6(ipv6.header().destination_addr())),
        ),
        _ => (None, None),
    };
    let src_ip = src_ip.map(normalize_ip);
    let dst_ip = dst_ip.map(normalize_ip);

    let ip_payload = sliced.ip_payload()?;
    if ip_payload.fragmented {
        return None;
    }

    if ip_payload.ip_number.0 == SCTP_IP_PROTOCOL {
        return Some(SctpFrame {
            src_ip,
            dst_ip,
            encapsulation: Encapsulation::Ip,
            sctp: ip_payload.payload,
        });
    }

    match &sliced.transport {
        Some(TransportSlice::Udp(udp))
            if udp_port != 0
                && (udp.source_port() == udp_port || udp.destination_port() == udp_port) =>
        {
            Some(SctpFrame {
                src_ip,
                dst_ip,
                encapsulation: Encapsulation::Udp {
                    src_port: udp.source_port(),
                    dst_port: udp.destination_port(),
                },
                sctp: udp.payload(),
            })
        }
        _ => None,
    }
}

/// Convert IPv6-mapped-IPv4 addresses to their IPv4 equivalent so both
/// directions of a dual-stack association pair up.
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        other => other,
    }
}
