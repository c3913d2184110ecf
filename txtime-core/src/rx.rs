//! Receive engine: one socket with kernel timestamping, one
//! [`TimestampSample`] per datagram.

use std::io::{self, Write};
use std::mem::size_of;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace};

use crate::clock::{Clock, ClockId, SystemClock};
use crate::error::{Error, Result};
use crate::sample::{SampleWriter, TimestampSample};
use crate::timestamping::{KernelTimestamps, TimestampSlot, enable_rx_timestamping};

/// Large enough for any UDP datagram.
const RECV_BUFFER_LEN: usize = 65536;
const CONTROL_BUFFER_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct RxConfig {
    pub bind: SocketAddrV4,
    /// 0 means receive forever.
    pub max_samples: u64,
    pub slot: TimestampSlot,
}

impl RxConfig {
    pub fn new(bind: SocketAddrV4, max_samples: u64) -> Self {
        Self {
            bind,
            max_samples,
            slot: TimestampSlot::default(),
        }
    }

    pub fn with_slot(mut self, slot: TimestampSlot) -> Self {
        self.slot = slot;
        self
    }
}

/// Something that blocks until a datagram arrives and reports the kernel
/// timestamps delivered with it.
pub trait DatagramSource {
    fn recv_timestamped(&mut self, buf: &mut [u8]) -> io::Result<(usize, KernelTimestamps)>;
}

/// UDP socket with `SO_TIMESTAMPING` enabled.
pub struct RxSocket {
    socket: Socket,
    local: SocketAddrV4,
    control: Vec<u64>,
}

impl RxSocket {
    /// Creates the socket, enables receive timestamping and address reuse,
    /// then binds. Nothing is received before all of that succeeded.
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Socket)?;
        enable_rx_timestamping(&socket)?;
        socket
            .set_reuse_address(true)
            .map_err(|source| Error::SocketOption {
                option: "SO_REUSEADDR",
                source,
            })?;
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|source| Error::Bind { addr, source })?;

        let local = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket_ipv4())
            .unwrap_or(addr);
        info!("Listening on UDP {} with kernel timestamping", local);

        Ok(Self {
            socket,
            local,
            control: vec![0u64; CONTROL_BUFFER_LEN / size_of::<u64>()],
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }
}

impl DatagramSource for RxSocket {
    fn recv_timestamped(&mut self, buf: &mut [u8]) -> io::Result<(usize, KernelTimestamps)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: msghdr is plain data; all pointers are filled in below.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = self.control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = (self.control.len() * size_of::<u64>()) as _;

        // SAFETY: `iov` and the control buffer outlive the call and their
        // lengths are described in `msg`.
        let n = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: recvmsg succeeded, so msg_controllen covers what the
        // kernel wrote into our control buffer.
        let stamps = unsafe { KernelTimestamps::decode(&msg) };
        Ok((n as usize, stamps))
    }
}

/// Owns the receive source and the sequence counter for one run.
pub struct RxEngine<S, C = SystemClock> {
    source: S,
    clock: C,
    slot: TimestampSlot,
    max_samples: u64,
    seq: u64,
    buf: Vec<u8>,
}

impl RxEngine<RxSocket, SystemClock> {
    pub fn bind(config: &RxConfig) -> Result<Self> {
        let socket = RxSocket::bind(config.bind)?;
        Ok(Self::new(
            socket,
            SystemClock::new(ClockId::MonotonicRaw),
            config,
        ))
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.source.local_addr()
    }
}

impl<S: DatagramSource, C: Clock> RxEngine<S, C> {
    pub fn new(source: S, clock: C, config: &RxConfig) -> Self {
        Self {
            source,
            clock,
            slot: config.slot,
            max_samples: config.max_samples,
            seq: 0,
            buf: vec![0u8; RECV_BUFFER_LEN],
        }
    }

    /// Samples emitted so far.
    pub fn emitted(&self) -> u64 {
        self.seq
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_samples > 0 && self.seq >= self.max_samples
    }

    /// Blocks for the next datagram. Interrupted receives are retried
    /// without consuming a sequence number; any other failure is returned.
    pub fn next_sample(&mut self) -> Result<TimestampSample> {
        let (len, stamps) = loop {
            match self.source.recv_timestamped(&mut self.buf) {
                Ok(received) => break received,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    trace!("recvmsg interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(Error::Receive(e)),
            }
        };
        let mono_raw_ns = self.clock.now_ns()?;

        let sample = TimestampSample::new(self.seq, len as u64, stamps.get(self.slot), mono_raw_ns);
        if stamps.is_empty() {
            trace!(seq = self.seq, "datagram arrived without kernel timestamps");
        }
        self.seq += 1;
        Ok(sample)
    }

    /// Lazy sequence of samples. Ends after `max_samples` (never, if 0) or
    /// after the first error, which is yielded.
    pub fn samples(&mut self) -> Samples<'_, S, C> {
        Samples {
            engine: self,
            failed: false,
        }
    }
}

pub struct Samples<'a, S, C> {
    engine: &'a mut RxEngine<S, C>,
    failed: bool,
}

impl<S: DatagramSource, C: Clock> Iterator for Samples<'_, S, C> {
    type Item = Result<TimestampSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.engine.is_exhausted() {
            return None;
        }
        let sample = self.engine.next_sample();
        self.failed = sample.is_err();
        Some(sample)
    }
}

/// Binds per `config` and writes every sample to `out` as CSV until the
/// sample budget is spent. Returns the number of samples written.
pub fn capture<W: Write>(config: &RxConfig, out: W) -> Result<u64> {
    let mut engine = RxEngine::bind(config)?;
    debug!(slot = ?config.slot, max_samples = config.max_samples, "starting receive loop");
    write_samples(&mut engine, out)
}

pub fn write_samples<S: DatagramSource, C: Clock, W: Write>(
    engine: &mut RxEngine<S, C>,
    out: W,
) -> Result<u64> {
    let mut writer = SampleWriter::new(out)?;
    for sample in engine.samples() {
        let sample = sample?;
        trace!(
            seq = sample.seq,
            payload_len = sample.payload_len,
            kernel_ns = sample.kernel_timestamp_ns,
            mono_raw_ns = sample.mono_raw_ns,
            "sample"
        );
        writer.write(&sample)?;
    }
    info!("Receive loop finished after {} samples", engine.emitted());
    Ok(engine.emitted())
}
