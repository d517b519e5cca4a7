use colored::Colorize;
use regex::Regex;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::{Duration, UNIX_EPOCH};

use crate::analyzer::{
    ChunkDetail, ChunkReport, DeliveredMessage, Diagnostic, FragmentStatus, InitSummary,
    PacketReport, SackSummary, Severity,
};
use crate::association::Association;
use crate::sctp::checksum::ChecksumStatus;
use crate::sctp::MessageSeq;
use crate::tsn::{AckedTsn, TsnAnnotation};

pub struct Formatter {
    json: bool,
    hex: bool,
    quiet: bool,
}

impl Formatter {
    pub fn new(json: bool, hex: bool, quiet: bool) -> Self {
        Formatter { json, hex, quiet }
    }

    pub fn print_packet(&self, report: &PacketReport, pattern: Option<&Regex>) {
        if self.json {
            println!("{}", packet_json(report));
            return;
        }

        if !self.quiet {
            println!("{}", header_line(report));
            for chunk in &report.chunks {
                for line in chunk_lines(chunk) {
                    println!("{}", line);
                }
            }
            for diag in &report.diagnostics {
                println!("{}", diagnostic_line(diag));
            }
        }

        for message in report.messages() {
            if self.hex {
                print!("{}", hex_dump(&message.data));
            } else {
                let text = sanitize(&String::from_utf8_lossy(&message.data));
                println!("{}", highlight(&text, pattern));
            }
        }
    }

    pub fn print_summary(&self, associations: &[Association]) {
        for assoc in associations {
            if self.json {
                println!("{}", json!({ "type": "association", "association": assoc }));
            } else {
                println!("{}", summary_line(assoc));
            }
        }
    }
}

fn endpoint(ip: Option<IpAddr>, port: u16) -> String {
    match ip {
        Some(IpAddr::V6(v6)) => format!("[{}]:{}", v6, port),
        Some(ip) => format!("{}:{}", ip, port),
        None => format!("*:{}", port),
    }
}

fn millis(d: Duration) -> String {
    format!("{:.3}ms", d.as_secs_f64() * 1000.0)
}

fn header_line(report: &PacketReport) -> String {
    let h = &report.header;
    let mut line = format!(
        "{} {} {} {} vtag=0x{:08x}",
        format!("#{}", report.frame).blue().bold(),
        endpoint(report.src, h.src_port).green(),
        "->".dimmed(),
        endpoint(report.dst, h.dst_port).yellow(),
        h.verification_tag
    );
    if let Some((index, direction)) = report.association() {
        let _ = write!(line, " {}", format!("assoc={} {}", index, direction).cyan());
    }
    match report.checksum {
        ChecksumStatus::Unverified => {}
        ChecksumStatus::Valid(kind) => {
            let _ = write!(line, " {}", format!("[{} ok]", kind).dimmed());
        }
        ChecksumStatus::Invalid { kind, .. } => {
            let _ = write!(line, " {}", format!("[{} BAD]", kind).red().bold());
        }
    }
    if report.revisit {
        let _ = write!(line, " {}", "(revisit)".dimmed());
    }
    line
}

fn chunk_lines(chunk: &ChunkReport) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = format!("  {}", chunk.chunk_type.to_string().magenta().bold());
    let detail = detail_text(&chunk.detail);
    if !detail.is_empty() {
        let _ = write!(line, " {}", detail);
    }
    if let Some(tsn) = &chunk.tsn {
        let _ = write!(line, " {}", tsn_text(tsn));
    }
    if let Some(status) = &chunk.fragment {
        if let Some(text) = fragment_text(status) {
            let _ = write!(line, " {}", text.cyan());
        }
    }
    lines.push(line);
    if !chunk.acked.is_empty() {
        lines.push(format!("    acks {}", acked_text(&chunk.acked)));
    }
    lines.extend(chunk.diagnostics.iter().map(diagnostic_line));
    lines
}

fn detail_text(detail: &ChunkDetail) -> String {
    match detail {
        ChunkDetail::Data {
            flags,
            tsn,
            stream_id,
            seq,
            ppid,
            payload_len,
            ..
        } => {
            let mut marks = String::new();
            for (set, mark) in [
                (flags.unordered(), 'U'),
                (flags.begin(), 'B'),
                (flags.end(), 'E'),
                (flags.immediate(), 'I'),
            ] {
                if set {
                    marks.push(mark);
                }
            }
            let seq = match seq {
                MessageSeq::Ssn(ssn) => format!("ssn={}", ssn),
                MessageSeq::Mid { mid, fsn } => format!("mid={} fsn={}", mid, fsn),
            };
            format!(
                "tsn={} sid={} {} ppid={} len={} flags={}",
                tsn, stream_id, seq, ppid, payload_len, marks
            )
        }
        ChunkDetail::Init(init) | ChunkDetail::InitAck(init) => init_text(init),
        ChunkDetail::Sack(sack) => sack_text(sack, false),
        ChunkDetail::NrSack(sack) => sack_text(sack, true),
        ChunkDetail::Shutdown { cumulative_tsn_ack } => format!("cum_ack={}", cumulative_tsn_ack),
        ChunkDetail::ForwardTsn { new_cumulative_tsn } => {
            format!("new_cum_tsn={}", new_cumulative_tsn)
        }
        ChunkDetail::Abort { t_bit } | ChunkDetail::ShutdownComplete { t_bit } => {
            if *t_bit {
                "T".to_string()
            } else {
                String::new()
            }
        }
        ChunkDetail::Other => String::new(),
        ChunkDetail::Malformed => "malformed".red().to_string(),
    }
}

fn init_text(init: &InitSummary) -> String {
    let mut text = format!(
        "itag=0x{:08x} a_rwnd={} os={} mis={} itsn={}",
        init.initiate_tag,
        init.a_rwnd,
        init.outbound_streams,
        init.inbound_streams,
        init.initial_tsn
    );
    if !init.params.is_empty() {
        let _ = write!(text, " params=[{}]", init.params.join(","));
    }
    text
}

fn ranges(blocks: &[(u32, u32)]) -> String {
    blocks
        .iter()
        .map(|(s, e)| format!("{}-{}", s, e))
        .collect::<Vec<_>>()
        .join(",")
}

fn sack_text(sack: &SackSummary, nr: bool) -> String {
    let mut text = format!("cum_ack={} a_rwnd={}", sack.cumulative_tsn_ack, sack.a_rwnd);
    if !sack.gap_blocks.is_empty() {
        let _ = write!(text, " gaps=[{}]", ranges(&sack.gap_blocks));
    }
    if nr && !sack.nr_gap_blocks.is_empty() {
        let _ = write!(text, " nr_gaps=[{}]", ranges(&sack.nr_gap_blocks));
    }
    if !sack.duplicate_tsns.is_empty() {
        let dups: Vec<String> = sack.duplicate_tsns.iter().map(u32::to_string).collect();
        let _ = write!(text, " dups=[{}]", dups.join(","));
    }
    text
}

fn tsn_text(tsn: &TsnAnnotation) -> String {
    let mut text = format!("rel={}", tsn.relative_tsn);
    if let (Some(frame), Some(delay)) = (tsn.retransmission_of, tsn.retransmission_delay) {
        let _ = write!(text, " retransmits #{} after {}", frame, millis(delay));
    }
    if !tsn.retransmitted_in.is_empty() {
        let frames: Vec<String> = tsn.retransmitted_in.iter().map(|f| format!("#{}", f)).collect();
        let _ = write!(text, " retransmitted in {}", frames.join(","));
    }
    if let (Some(frame), Some(rtt)) = (tsn.acked_in_frame, tsn.rtt) {
        let _ = write!(text, " acked in #{} rtt {}", frame, millis(rtt));
    }
    text
}

fn acked_text(acked: &[AckedTsn]) -> String {
    acked
        .iter()
        .map(|a| format!("{}(#{} {})", a.tsn, a.sent_in_frame, millis(a.rtt)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn fragment_text(status: &FragmentStatus) -> Option<String> {
    match status {
        FragmentStatus::Unfragmented | FragmentStatus::NotReassembled => None,
        FragmentStatus::Reassembled { fragments, len, .. } => Some(format!(
            "[reassembled {} fragments, {} bytes]",
            fragments, len
        )),
        FragmentStatus::PartOf { reassembled_in } => {
            Some(format!("[reassembled in #{}]", reassembled_in))
        }
        FragmentStatus::Pending => Some("[fragment]".to_string()),
        FragmentStatus::Duplicate { original_frame } => {
            Some(format!("[duplicate of #{}]", original_frame))
        }
    }
}

fn diagnostic_line(diag: &Diagnostic) -> String {
    let label = match diag.severity() {
        Severity::Note => "note".blue(),
        Severity::Warning => "warning".yellow(),
        Severity::Error => "error".red().bold(),
    };
    format!("    {}: {}", label, diag)
}

fn summary_line(assoc: &Association) -> String {
    format!(
        "{} {} <-> {} tag1=0x{:08x} tag2=0x{:08x} frames={} chunks={}",
        format!("assoc {}", assoc.index).cyan().bold(),
        assoc.src_port,
        assoc.dst_port,
        assoc.tag1,
        assoc.tag2,
        assoc.frames,
        assoc.chunks
    )
}

/// Machine-readable rendition of one packet.
pub fn packet_json(report: &PacketReport) -> Value {
    let timestamp = report
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let checksum = match report.checksum {
        ChecksumStatus::Unverified => json!({ "status": "unverified" }),
        ChecksumStatus::Valid(kind) => json!({ "status": "valid", "kind": kind.to_string() }),
        ChecksumStatus::Invalid {
            kind,
            computed,
            stored,
        } => json!({
            "status": "invalid",
            "kind": kind.to_string(),
            "computed": computed,
            "stored": stored,
        }),
    };
    json!({
        "type": "packet",
        "frame": report.frame,
        "timestamp": timestamp,
        "src_ip": report.src.map(|i| i.to_string()),
        "dst_ip": report.dst.map(|i| i.to_string()),
        "src_port": report.header.src_port,
        "dst_port": report.header.dst_port,
        "verification_tag": report.header.verification_tag,
        "checksum": checksum,
        "revisit": report.revisit,
        "chunks": report.chunks.iter().map(chunk_json).collect::<Vec<_>>(),
        "diagnostics": diagnostics_json(&report.diagnostics),
    })
}

fn diagnostics_json(diags: &[Diagnostic]) -> Vec<Value> {
    diags
        .iter()
        .map(|d| json!({ "severity": d.severity().to_string(), "message": d.to_string() }))
        .collect()
}

fn chunk_json(chunk: &ChunkReport) -> Value {
    let mut value = json!({
        "type": chunk.chunk_type.name(),
        "offset": chunk.offset,
        "flags": chunk.flags,
        "length": chunk.length,
        "association": chunk.association,
        "direction": chunk.direction,
        "detail": detail_text(&chunk.detail),
        "diagnostics": diagnostics_json(&chunk.diagnostics),
    });
    if let Some(tsn) = &chunk.tsn {
        value["tsn"] = json!({
            "tsn": tsn.tsn,
            "relative": tsn.relative_tsn,
            "retransmission_of": tsn.retransmission_of,
            "retransmission_delay_ms": tsn.retransmission_delay.map(|d| d.as_secs_f64() * 1000.0),
            "retransmitted_in": tsn.retransmitted_in,
            "acked_in_frame": tsn.acked_in_frame,
            "rtt_ms": tsn.rtt.map(|d| d.as_secs_f64() * 1000.0),
        });
    }
    if !chunk.acked.is_empty() {
        value["acked"] = chunk
            .acked
            .iter()
            .map(|a| {
                json!({
                    "tsn": a.tsn,
                    "sent_in_frame": a.sent_in_frame,
                    "rtt_ms": a.rtt.as_secs_f64() * 1000.0,
                })
            })
            .collect();
    }
    if let Some(status) = &chunk.fragment {
        value["fragment"] = Value::from(fragment_text(status).unwrap_or_default());
    }
    if let Some(message) = &chunk.delivered {
        value["message"] = message_json(message);
    }
    value
}

fn message_json(message: &DeliveredMessage) -> Value {
    json!({
        "ppid": message.ppid,
        "stream_id": message.stream_id,
        "delivery": format!("{:?}", message.delivery).to_lowercase(),
        "len": message.data.len(),
        "payload": sanitize(&String::from_utf8_lossy(&message.data)),
    })
}

/// Replace control characters that could drive the terminal with U+FFFD.
/// Tab, newline and carriage return are kept.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\t' | '\n' | '\r' => c,
            '\x00'..='\x1F' | '\x7F' | '\u{0080}'..='\u{009F}' => '\u{FFFD}',
            _ => c,
        })
        .collect()
}

/// Payload with regex matches highlighted in red.
fn highlight(text: &str, pattern: Option<&Regex>) -> String {
    let Some(re) = pattern else {
        return text.to_string();
    };
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in re.find_iter(text) {
        out.push_str(&text[last..m.start()]);
        let _ = write!(out, "{}", m.as_str().red().bold());
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Hex + ASCII dump, 16 bytes per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", i * 16);
        for (j, byte) in chunk.iter().enumerate() {
            let _ = write!(out, "{:02x} ", byte);
            if j == 7 {
                out.push(' ');
            }
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        if chunk.len() <= 8 {
            out.push(' ');
        }
        out.push_str(" |");
        for &byte in chunk {
            if byte.is_ascii_graphic() || byte == b' ' {
                out.push(byte as char);
            } else {
                out.push('.');
            }
        }
        out.push_str("|\n");
    }
    out
}
