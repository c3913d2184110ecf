use std::io;
use std::net::SocketAddrV4;
use std::path::PathBuf;

use pcap_file::PcapError;
use thiserror::Error;

use crate::clock::ClockId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("clock_gettime({clock}) failed: {source}")]
    ClockRead {
        clock: ClockId,
        #[source]
        source: io::Error,
    },

    #[error("clock_nanosleep({clock}) failed: {source}")]
    ClockSleep {
        clock: ClockId,
        #[source]
        source: io::Error,
    },

    #[error("failed to open capture file {}: {source}", path.display())]
    TraceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read capture header of {}: {source}", path.display())]
    TraceHeader {
        path: PathBuf,
        #[source]
        source: PcapError,
    },

    #[error("failed to read frame #{frame} of {}: {source}", path.display())]
    TraceRead {
        path: PathBuf,
        frame: u64,
        #[source]
        source: PcapError,
    },

    #[error("no UDP payloads found in {}", path.display())]
    EmptyTrace { path: PathBuf },

    #[error("socket creation failed: {0}")]
    Socket(#[source] io::Error),

    #[error("setsockopt({option}) failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("recvmsg failed: {0}")]
    Receive(#[source] io::Error),

    #[error("sendmsg failed for packet #{index} (txtime {txtime_ns} ns): {source}")]
    Send {
        index: usize,
        txtime_ns: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to write sample: {0}")]
    Output(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot pin thread to CPU {0}")]
    Affinity(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
