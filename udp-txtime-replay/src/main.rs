use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use txtime_core::affinity::pin_current_thread;
use txtime_core::replay::{self, ReplayConfig};
use txtime_core::{ClockId, trace};

#[derive(Parser, Debug)]
#[command(name = "udp-txtime-replay")]
#[command(about = "Replay UDP payloads from a pcap with kernel-paced SO_TXTIME transmission")]
#[command(version)]
struct Args {
    /// Capture file to replay
    #[arg(long)]
    pcap: PathBuf,

    /// Local IPv4 address to send from
    #[arg(long)]
    bind_ip: Ipv4Addr,

    /// Local UDP port to send from
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    bind_port: u16,

    /// Destination IPv4 address
    #[arg(long)]
    dst_ip: Ipv4Addr,

    /// Destination UDP port
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    dst_port: u16,

    /// Lead time in microseconds between start and the first launch
    #[arg(long, default_value = "200", value_parser = clap::value_parser!(u64).range(10..))]
    lead_us: u64,

    /// Pacing clock: TAI, MONOTONIC or REALTIME
    #[arg(long, default_value = "TAI")]
    clock: ClockId,

    /// Pin the replay thread to this CPU core
    #[arg(long)]
    cpu: Option<usize>,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn lead_ns(lead_us: u64) -> Result<u64> {
    lead_us
        .checked_mul(1_000)
        .with_context(|| format!("--lead-us {} is too large", lead_us))
}

fn run(args: Args) -> Result<()> {
    if let Some(cpu) = args.cpu {
        pin_current_thread(cpu)?;
    }

    // An unusable capture is rejected before any socket exists.
    let trace = trace::load(&args.pcap)
        .with_context(|| format!("failed to load {}", args.pcap.display()))?;

    let config = ReplayConfig::new(
        SocketAddrV4::new(args.bind_ip, args.bind_port),
        SocketAddrV4::new(args.dst_ip, args.dst_port),
        lead_ns(args.lead_us)?,
        args.clock,
    )?;

    let summary = replay::run(trace, &config).context("replay failed")?;
    info!(
        "Replay complete: {} packets, {} bytes",
        summary.packets_sent, summary.bytes_sent
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::PcapWriter;
    use std::fs::File;

    const REQUIRED: [&str; 11] = [
        "udp-txtime-replay",
        "--pcap",
        "trace.pcap",
        "--bind-ip",
        "10.0.0.1",
        "--bind-port",
        "4000",
        "--dst-ip",
        "10.0.0.2",
        "--dst-port",
        "5000",
    ];

    fn with(extra: &[&'static str]) -> Vec<&'static str> {
        REQUIRED.iter().copied().chain(extra.iter().copied()).collect()
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        assert_eq!(args.pcap, PathBuf::from("trace.pcap"));
        assert_eq!(args.bind_port, 4000);
        assert_eq!(args.dst_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(args.lead_us, 200);
        assert_eq!(args.clock, ClockId::Tai);
        assert!(args.cpu.is_none());
    }

    #[test]
    fn test_clock_names() {
        for (name, expected) in [
            ("TAI", ClockId::Tai),
            ("CLOCK_MONOTONIC", ClockId::Monotonic),
            ("realtime", ClockId::Realtime),
        ] {
            let args = Args::try_parse_from(with(&["--clock", name])).unwrap();
            assert_eq!(args.clock, expected);
        }
    }

    #[test]
    fn test_minimum_lead_accepted() {
        let args = Args::try_parse_from(with(&["--lead-us", "10"])).unwrap();
        assert_eq!(args.lead_us, 10);
    }

    #[test]
    fn test_lead_conversion() {
        assert_eq!(lead_ns(200).unwrap(), 200_000);
        assert!(lead_ns(u64::MAX / 1_000 + 1).is_err());

        let args = Args::try_parse_from(with(&["--lead-us", "18446744073709551615"])).unwrap();
        assert!(lead_ns(args.lead_us).is_err());
    }

    #[test]
    fn test_empty_capture_fails_before_socket_setup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pcap");
        PcapWriter::new(File::create(&path).unwrap()).unwrap();

        // 192.0.2.1 is not a local address, so reaching bind() would fail differently
        let args = Args::try_parse_from([
            "udp-txtime-replay",
            "--pcap",
            path.to_str().unwrap(),
            "--bind-ip",
            "192.0.2.1",
            "--bind-port",
            "4000",
            "--dst-ip",
            "192.0.2.2",
            "--dst-port",
            "5000",
        ])
        .unwrap();

        let err = run(args).unwrap_err();
        match err.downcast_ref::<txtime_core::Error>() {
            Some(txtime_core::Error::EmptyTrace { path: p }) => assert_eq!(p, &path),
            other => panic!("expected empty trace error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        for extra in [
            &["--lead-us", "9"][..],
            &["--clock", "BOOTTIME"],
            &["--clock", "MONOTONIC_RAW"],
        ] {
            let err = Args::try_parse_from(with(extra)).unwrap_err();
            assert!(err.use_stderr(), "{:?} should fail", extra);
        }

        let missing: Vec<&str> = REQUIRED[..9].to_vec();
        assert!(Args::try_parse_from(missing).unwrap_err().use_stderr());
    }
}
