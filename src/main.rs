use anyhow::{Context, Result};
use clap::Parser;
use pcap::Device;
use regex::Regex;
use std::path::PathBuf;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use sctpscope::analyzer::{Analyzer, PacketContext, PacketReport};
use sctpscope::capture::PacketSource;
use sctpscope::config::{AnalyzerConfig, ChecksumMode, DEFAULT_UDP_TUNNELING_PORT};
use sctpscope::output::Formatter;
use sctpscope::protocol;

#[derive(Parser)]
#[command(
    name = "sctpscope",
    version,
    about = "SCTP association, TSN and message reassembly analysis for live and recorded captures"
)]
struct Cli {
    /// Regex matched against delivered user messages; only packets that
    /// deliver a matching message are shown
    pattern: Option<String>,

    /// Case-insensitive matching
    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// BPF filter expression (same syntax as tcpdump)
    #[arg(short = 'F', long)]
    bpf: Option<String>,

    /// Network interface to capture on
    #[arg(short = 'd', long)]
    interface: Option<String>,

    /// Read from pcap/pcapng file instead of live capture
    #[arg(short = 'I', long)]
    input: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Show hex dump of delivered messages
    #[arg(short = 'x', long, conflicts_with = "json")]
    hex: bool,

    /// Quiet mode (delivered messages only, no packet details)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Only show packets of this association index
    #[arg(short = 'a', long)]
    assoc: Option<usize>,

    /// Checksum verification
    #[arg(long, value_enum, default_value_t = ChecksumMode::Crc32c)]
    checksum: ChecksumMode,

    /// Disable TSN, retransmission and SACK analysis
    #[arg(long)]
    no_tsn_analysis: bool,

    /// Disable message reassembly (deliver first fragments only)
    #[arg(long)]
    no_reassembly: bool,

    /// UDP port carrying encapsulated SCTP (0 disables)
    #[arg(long, default_value_t = DEFAULT_UDP_TUNNELING_PORT)]
    udp_port: u16,

    /// Analyze a capture file this many times; output comes from the last pass
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=4))]
    passes: u8,

    /// Show N packets then exit
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Snap length (bytes to capture per packet)
    #[arg(short = 's', long, default_value_t = 65535)]
    snaplen: i32,

    /// Don't use promiscuous mode
    #[arg(short = 'p', long)]
    no_promisc: bool,

    /// List available interfaces and exit
    #[arg(short = 'L', long)]
    list_interfaces: bool,

    /// Print one line per association when done
    #[arg(long)]
    summary: bool,

    /// Increase log verbosity (-v, -vv, -vvv); RUST_LOG overrides
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            checksum: self.checksum,
            tsn_analysis: !self.no_tsn_analysis,
            reassembly: !self.no_reassembly,
            udp_tunneling_port: self.udp_port,
        }
    }

    fn open_source(&self) -> Result<PacketSource> {
        match &self.input {
            Some(path) => PacketSource::from_file(path, self.bpf.as_deref()),
            None => PacketSource::live(
                self.interface.as_deref(),
                self.snaplen,
                !self.no_promisc,
                self.bpf.as_deref(),
            ),
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.list_interfaces {
        list_interfaces()?;
        return Ok(());
    }

    let pattern = match &cli.pattern {
        Some(p) => {
            let pat = if cli.ignore_case {
                format!("(?i){}", p)
            } else {
                p.clone()
            };
            Some(Regex::new(&pat).context(format!("Invalid pattern: {}", p))?)
        }
        None => None,
    };

    let formatter = Formatter::new(cli.json, cli.hex, cli.quiet);
    let mut analyzer = Analyzer::new(cli.analyzer_config());
    let mut passes = cli.passes;
    let mut source = cli.open_source()?;
    if source.is_live() && passes > 1 {
        warn!(passes, "live captures are analyzed in a single pass");
        passes = 1;
    }

    for pass in 1..=passes {
        let final_pass = pass == passes;
        if pass > 1 {
            source = cli.open_source()?;
        }
        let link_type = source.link_type();
        let udp_port = analyzer.config().udp_tunneling_port;
        let mut shown: usize = 0;

        source.for_each_packet(|packet| {
            let Some(frame) = protocol::extract_sctp(packet.data, link_type, udp_port) else {
                return true;
            };
            let ctx = PacketContext {
                frame: packet.frame,
                timestamp: packet.timestamp,
                src: frame.src_ip,
                dst: frame.dst_ip,
                truncated: packet.truncated,
            };
            let report = match analyzer.process(&ctx, frame.sctp) {
                Ok(report) => report,
                Err(err) => {
                    debug!(frame = packet.frame, %err, "not an SCTP packet");
                    return true;
                }
            };
            if !final_pass || !selected(&report, cli.assoc, pattern.as_ref()) {
                return true;
            }

            formatter.print_packet(&report, pattern.as_ref());
            shown += 1;
            cli.count.map_or(true, |n| shown < n)
        })?;
        debug!(pass, associations = analyzer.associations().len(), "pass complete");
    }

    if cli.summary {
        formatter.print_summary(analyzer.associations());
    }
    Ok(())
}

fn selected(report: &PacketReport, assoc: Option<usize>, pattern: Option<&Regex>) -> bool {
    if let Some(index) = assoc {
        if !report.chunks.iter().any(|c| c.association == index) {
            return false;
        }
    }
    match pattern {
        Some(re) => report
            .messages()
            .any(|m| re.is_match(&String::from_utf8_lossy(&m.data))),
        None => true,
    }
}

fn list_interfaces() -> Result<()> {
    let devices = Device::list().context("Failed to list capture devices")?;
    for dev in devices {
        let desc = dev.desc.as_deref().unwrap_or("");
        let addrs: Vec<String> = dev
            .addresses
            .iter()
            .map(|a| a.addr.to_string())
            .collect();
        println!("{:<16} {}  [{}]", dev.name, desc, addrs.join(", "));
    }
    Ok(())
}
