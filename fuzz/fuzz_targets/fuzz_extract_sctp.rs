#![no_main]
use libfuzzer_sys::fuzz_target;
use sctpscope::protocol::{extract_sctp, LinkType};

fuzz_target!(|data: &[u8]| {
    for link_type in [LinkType::Ethernet, LinkType::RawIp, LinkType::LinuxSll] {
        let _ = extract_sctp(data, link_type, 9899);
    }
});
