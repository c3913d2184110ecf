use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use txtime_core::affinity::pin_current_thread;
use txtime_core::rx::{self, RxConfig};
use txtime_core::TimestampSlot;

#[derive(Parser, Debug)]
#[command(name = "udp-rx-timestamp")]
#[command(about = "Receive UDP datagrams and print kernel receive timestamps as CSV")]
#[command(version)]
struct Args {
    /// Local IPv4 address to bind
    #[arg(long)]
    bind_ip: Ipv4Addr,

    /// UDP port to listen on
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Stop after this many datagrams (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Timestamp reported in the kernel column: software, legacy or hardware-raw
    #[arg(long, default_value = "hardware-raw")]
    timestamp_slot: TimestampSlot,

    /// Pin the receive thread to this CPU core
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

fn run(args: Args) -> Result<()> {
    if let Some(cpu) = args.cpu {
        pin_current_thread(cpu)?;
    }

    let bind = SocketAddrV4::new(args.bind_ip, args.port);
    let config = RxConfig::new(bind, args.count).with_slot(args.timestamp_slot);
    info!(
        "Capturing {} datagrams on {}",
        if args.count == 0 { "unbounded".to_string() } else { args.count.to_string() },
        bind
    );

    let written = rx::capture(&config, io::stdout().lock())
        .with_context(|| format!("capture on {} failed", bind))?;
    info!("Captured {} samples", written);
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
