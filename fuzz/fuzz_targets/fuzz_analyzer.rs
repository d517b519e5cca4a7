#![no_main]
use libfuzzer_sys::fuzz_target;
use sctpscope::analyzer::{Analyzer, PacketContext};
use std::time::{Duration, SystemTime};

// Input is a sequence of records: frame number (1 byte), length (1 byte), packet bytes.
fuzz_target!(|data: &[u8]| {
    let mut analyzer = Analyzer::default();
    let mut rest = data;
    while rest.len() >= 2 {
        let frame = u32::from(rest[0]);
        let len = usize::from(rest[1]).min(rest.len() - 2);
        let packet = &rest[2..2 + len];
        rest = &rest[2 + len..];
        let ctx = PacketContext {
            frame,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(u64::from(frame)),
            src: None,
            dst: None,
            truncated: false,
        };
        let _ = analyzer.process(&ctx, packet);
    }
});
