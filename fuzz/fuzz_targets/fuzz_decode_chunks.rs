#![no_main]
use libfuzzer_sys::fuzz_target;
use sctpscope::sctp::{Chunk, SctpPacket};

fuzz_target!(|data: &[u8]| {
    let Ok(packet) = SctpPacket::parse(data) else {
        return;
    };
    for raw in packet.chunks().flatten() {
        if let Ok(Chunk::Init(init) | Chunk::InitAck(init)) = Chunk::decode(&raw) {
            for _ in init.params() {}
        }
    }
});
