//! Scheduled transmission with `SO_TXTIME`.
//!
//! The socket option binds the socket to a clock and enables error
//! reporting:
//!
//! ```text
//! struct sock_txtime {
//!     clockid_t clockid;
//!     __u32     flags;     // SOF_TXTIME_REPORT_ERRORS
//! };
//! ```
//!
//! Each `sendmsg` then carries an `SCM_TXTIME` control message holding the
//! absolute launch time as a `u64` nanosecond count on that clock. Packets
//! the qdisc rejects or cannot launch in time are reported on the socket
//! error queue with origin `SO_EE_ORIGIN_TXTIME`.

use std::io;
use std::mem::size_of;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::ptr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info};

use crate::clock::ClockId;
use crate::error::{Error, Result};

mod linux_consts {
    pub const SO_TXTIME: libc::c_int = 61;
    pub const SCM_TXTIME: libc::c_int = SO_TXTIME;
    pub const SOF_TXTIME_REPORT_ERRORS: u32 = 1 << 1;

    pub const SO_EE_ORIGIN_TXTIME: u8 = 6;
    pub const SO_EE_CODE_TXTIME_INVALID_PARAM: u8 = 1;
    pub const SO_EE_CODE_TXTIME_MISSED: u8 = 2;
}

#[repr(C)]
struct SockTxtime {
    clockid: libc::clockid_t,
    flags: u32,
}

/// `struct sock_extended_err`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// Sends one datagram that the kernel must not launch before `txtime_ns`.
pub trait TxTimeSender {
    fn send_at(&mut self, payload: &[u8], txtime_ns: u64) -> io::Result<usize>;
}

/// Kernel pacing failures read back from the error queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxTimeErrors {
    pub invalid_param: u64,
    pub missed_deadline: u64,
    pub other: u64,
}

impl TxTimeErrors {
    pub fn total(&self) -> u64 {
        self.invalid_param + self.missed_deadline + self.other
    }

    fn record(&mut self, err: &SockExtendedErr) {
        match (err.ee_origin, err.ee_code) {
            (linux_consts::SO_EE_ORIGIN_TXTIME, linux_consts::SO_EE_CODE_TXTIME_INVALID_PARAM) => {
                self.invalid_param += 1
            }
            (linux_consts::SO_EE_ORIGIN_TXTIME, linux_consts::SO_EE_CODE_TXTIME_MISSED) => {
                self.missed_deadline += 1
            }
            _ => self.other += 1,
        }
    }
}

/// UDP socket bound locally and configured for `SO_TXTIME` pacing.
pub struct TxTimeSocket {
    socket: Socket,
    remote: SocketAddrV4,
    clock: ClockId,
}

impl TxTimeSocket {
    pub fn open(local: SocketAddrV4, remote: SocketAddrV4, clock: ClockId) -> Result<Self> {
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Socket)?;
        socket
            .bind(&SockAddr::from(local))
            .map_err(|source| Error::Bind { addr: local, source })?;
        debug!("Bound replay socket to {}", local);

        enable_txtime(&socket, clock)?;
        info!("Kernel pacing enabled on {} (SO_TXTIME, {})", local, clock);

        Ok(Self {
            socket,
            remote,
            clock,
        })
    }

    pub fn clock(&self) -> ClockId {
        self.clock
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.socket.local_addr().ok().and_then(|a| a.as_socket_ipv4())
    }

    /// Reads every pending error-queue entry without blocking.
    pub fn drain_txtime_errors(&self) -> TxTimeErrors {
        let mut errors = TxTimeErrors::default();
        let mut data = [0u8; 256];
        let mut control = [0u64; 64];

        loop {
            let mut iov = libc::iovec {
                iov_base: data.as_mut_ptr() as *mut libc::c_void,
                iov_len: data.len(),
            };
            // SAFETY: msghdr is plain data; all pointers are filled in below.
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = size_of::<[u64; 64]>() as _;

            // SAFETY: buffers outlive the call; MSG_DONTWAIT keeps it
            // from blocking once the queue is empty.
            let ret = unsafe {
                libc::recvmsg(
                    self.socket.as_raw_fd(),
                    &mut msg,
                    libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
                )
            };
            if ret < 0 {
                break;
            }

            // SAFETY: recvmsg succeeded and described the control data in
            // msg; every header is checked before its payload is read.
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    let hdr = &*cmsg;
                    let wanted = libc::CMSG_LEN(size_of::<SockExtendedErr>() as u32) as usize;
                    if hdr.cmsg_level == libc::SOL_IP
                        && hdr.cmsg_type == libc::IP_RECVERR
                        && hdr.cmsg_len as usize >= wanted
                    {
                        let err = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const SockExtendedErr);
                        debug!(
                            errno = err.ee_errno,
                            origin = err.ee_origin,
                            code = err.ee_code,
                            txtime_hi = err.ee_info,
                            txtime_lo = err.ee_data,
                            "error queue entry"
                        );
                        errors.record(&err);
                    }
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
        }

        errors
    }
}

impl TxTimeSender for TxTimeSocket {
    fn send_at(&mut self, payload: &[u8], txtime_ns: u64) -> io::Result<usize> {
        send_with_txtime(&self.socket, self.remote, payload, txtime_ns)
    }
}

fn enable_txtime(socket: &Socket, clock: ClockId) -> Result<()> {
    let config = SockTxtime {
        clockid: clock.raw(),
        flags: linux_consts::SOF_TXTIME_REPORT_ERRORS,
    };
    // SAFETY: the fd is open; SockTxtime matches the kernel's sock_txtime
    // layout and its size is passed alongside.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            linux_consts::SO_TXTIME,
            &config as *const _ as *const libc::c_void,
            size_of::<SockTxtime>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::SocketOption {
            option: "SO_TXTIME",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain data; zero is a valid bit pattern.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sa
}

fn send_with_txtime(
    socket: &Socket,
    remote: SocketAddrV4,
    payload: &[u8],
    txtime_ns: u64,
) -> io::Result<usize> {
    let dest = sockaddr_in(remote);
    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    // CMSG_SPACE(8) is 24 bytes on LP64, 16 on ILP32.
    let mut control = [0u64; 4];
    let control_len = unsafe { libc::CMSG_SPACE(size_of::<u64>() as u32) } as usize;

    // SAFETY: msghdr is plain data; all pointers are filled in below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &dest as *const _ as *mut libc::c_void;
    msg.msg_namelen = size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &iov as *const _ as *mut libc::iovec;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control_len as _;

    // SAFETY: the control buffer is u64-aligned and CMSG_SPACE(8) bytes
    // long, so the first header and its 8 byte payload fit.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = linux_consts::SCM_TXTIME;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<u64>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut u64, txtime_ns);
    }

    // SAFETY: every buffer referenced by msg lives until the call returns.
    let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::Duration;

    #[test]
    fn test_sock_txtime_layout() {
        assert_eq!(size_of::<SockTxtime>(), 8);
        assert_eq!(size_of::<SockExtendedErr>(), 16);
    }

    #[test]
    fn test_error_classification() {
        let mut errors = TxTimeErrors::default();
        let base = SockExtendedErr {
            ee_errno: libc::ECANCELED as u32,
            ee_origin: linux_consts::SO_EE_ORIGIN_TXTIME,
            ee_type: 0,
            ee_code: linux_consts::SO_EE_CODE_TXTIME_MISSED,
            ee_pad: 0,
            ee_info: 0,
            ee_data: 0,
        };
        errors.record(&base);
        errors.record(&SockExtendedErr {
            ee_code: linux_consts::SO_EE_CODE_TXTIME_INVALID_PARAM,
            ..base
        });
        errors.record(&SockExtendedErr { ee_origin: 2, ..base });

        assert_eq!(errors.missed_deadline, 1);
        assert_eq!(errors.invalid_param, 1);
        assert_eq!(errors.other, 1);
        assert_eq!(errors.total(), 3);
    }

    #[test]
    fn test_loopback_send_with_txtime() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let remote = match receiver.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {}", other),
        };

        // CLOCK_MONOTONIC is the only pacing clock allowed without CAP_NET_ADMIN.
        let local = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let mut socket = match TxTimeSocket::open(local, remote, ClockId::Monotonic) {
            Ok(socket) => socket,
            Err(Error::SocketOption { option, source }) => {
                eprintln!("skipping: {} unavailable here: {}", option, source);
                return;
            }
            Err(e) => panic!("unexpected error: {}", e),
        };
        assert_eq!(socket.clock(), ClockId::Monotonic);
        assert!(socket.local_addr().is_some());

        let txtime = clock::now(ClockId::Monotonic).unwrap() + 100_000;
        let sent = socket.send_at(b"paced", txtime).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"paced");
        assert_eq!(socket.drain_txtime_errors().total(), 0);
    }
}
