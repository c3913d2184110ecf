//! Receive-side kernel timestamping (`SO_TIMESTAMPING`).
//!
//! With timestamping enabled the kernel attaches a `SCM_TIMESTAMPING`
//! control message to every datagram. Its payload is `struct
//! scm_timestamping`, three `timespec`s laid out back to back:
//!
//! ```text
//! ts[0]  software receive stamp (CLOCK_REALTIME)
//! ts[1]  legacy slot, formerly hardware stamp converted to system time
//! ts[2]  raw hardware stamp, in the NIC's PHC time base
//! ```
//!
//! Slots the kernel could not fill are zero.

use std::io;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::ptr;
use std::str::FromStr;

use tracing::debug;

use crate::clock::absolute_time_to_ns;
use crate::error::{Error, Result};

pub const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
pub const SOF_TIMESTAMPING_SYS_HARDWARE: u32 = 1 << 5;
pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;

/// Software and hardware generation/reporting, so whichever the device
/// supports gets delivered.
pub const RX_TIMESTAMPING_FLAGS: u32 = SOF_TIMESTAMPING_RX_SOFTWARE
    | SOF_TIMESTAMPING_SOFTWARE
    | SOF_TIMESTAMPING_SYS_HARDWARE
    | SOF_TIMESTAMPING_RAW_HARDWARE;

/// Size of `struct scm_timestamping`.
pub const SCM_TIMESTAMPING_LEN: usize = 3 * size_of::<libc::timespec>();

pub fn enable_rx_timestamping<S: AsRawFd>(socket: &S) -> Result<()> {
    let flags = RX_TIMESTAMPING_FLAGS as libc::c_int;
    // SAFETY: the fd is open for the lifetime of `socket`; `flags` is a
    // valid c_int and its size is passed alongside.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            &flags as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::SocketOption {
            option: "SO_TIMESTAMPING",
            source: io::Error::last_os_error(),
        });
    }
    debug!(flags, "receive timestamping enabled");
    Ok(())
}

/// The three slots of one `SCM_TIMESTAMPING` record, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelTimestamps {
    pub software_ns: u64,
    pub legacy_ns: u64,
    pub hardware_raw_ns: u64,
}

impl KernelTimestamps {
    fn from_timespecs(stamps: &[libc::timespec; 3]) -> Self {
        let ns = |ts: &libc::timespec| absolute_time_to_ns(ts.tv_sec as u64, ts.tv_nsec as u32);
        Self {
            software_ns: ns(&stamps[0]),
            legacy_ns: ns(&stamps[1]),
            hardware_raw_ns: ns(&stamps[2]),
        }
    }

    pub fn get(&self, slot: TimestampSlot) -> u64 {
        match slot {
            TimestampSlot::Software => self.software_ns,
            TimestampSlot::Legacy => self.legacy_ns,
            TimestampSlot::HardwareRaw => self.hardware_raw_ns,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Scans the control data of a completed `recvmsg` for the timestamping
    /// record. Returns all zeros when it is missing or too short.
    ///
    /// # Safety
    ///
    /// `msg.msg_control`/`msg.msg_controllen` must describe a readable
    /// buffer holding control messages as written by the kernel.
    pub unsafe fn decode(msg: &libc::msghdr) -> Self {
        let wanted = unsafe { libc::CMSG_LEN(SCM_TIMESTAMPING_LEN as u32) } as usize;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
        while !cmsg.is_null() {
            // SAFETY: non-null headers from CMSG_FIRSTHDR/CMSG_NXTHDR lie
            // inside the control buffer.
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level == libc::SOL_SOCKET
                && hdr.cmsg_type == libc::SO_TIMESTAMPING
                && hdr.cmsg_len as usize >= wanted
            {
                // SAFETY: cmsg_len covers the full record; the data may be
                // unaligned for timespec.
                let stamps = unsafe {
                    ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const [libc::timespec; 3])
                };
                return Self::from_timespecs(&stamps);
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
        }
        Self::default()
    }
}

/// Which `scm_timestamping` slot is reported as the kernel timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampSlot {
    Software,
    Legacy,
    /// `ts[2]`. NIC hardware clock when hardware stamping is active, zero
    /// otherwise. This is not wall-clock time.
    #[default]
    HardwareRaw,
}

impl FromStr for TimestampSlot {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "software" | "sw" | "0" => Ok(TimestampSlot::Software),
            "legacy" | "1" => Ok(TimestampSlot::Legacy),
            "hardware-raw" | "hw" | "2" => Ok(TimestampSlot::HardwareRaw),
            _ => Err(format!(
                "unknown timestamp slot: {} (expected software, legacy or hardware-raw)",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Control buffer assembled the way the kernel lays out cmsgs.
    struct ControlBuffer {
        words: Vec<u64>,
        len: usize,
    }

    impl ControlBuffer {
        fn new(entries: &[(libc::c_int, libc::c_int, Vec<u8>)]) -> Self {
            let total: usize = entries
                .iter()
                .map(|(_, _, data)| unsafe { libc::CMSG_SPACE(data.len() as u32) } as usize)
                .sum();
            let mut words = vec![0u64; total.div_ceil(8).max(1)];
            let base = words.as_mut_ptr() as *mut u8;

            let mut offset = 0;
            for (level, kind, data) in entries {
                let header_len = unsafe { libc::CMSG_LEN(0) } as usize;
                let mut hdr: libc::cmsghdr = unsafe { std::mem::zeroed() };
                hdr.cmsg_len = unsafe { libc::CMSG_LEN(data.len() as u32) } as _;
                hdr.cmsg_level = *level;
                hdr.cmsg_type = *kind;
                unsafe {
                    ptr::write_unaligned(base.add(offset) as *mut libc::cmsghdr, hdr);
                    ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset + header_len), data.len());
                }
                offset += unsafe { libc::CMSG_SPACE(data.len() as u32) } as usize;
            }

            Self { words, len: total }
        }

        fn msghdr(&mut self) -> libc::msghdr {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = self.words.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = self.len as _;
            msg
        }
    }

    fn timestamping_payload(stamps: [(i64, i64); 3]) -> Vec<u8> {
        let mut data = Vec::with_capacity(SCM_TIMESTAMPING_LEN);
        for (sec, nsec) in stamps {
            let ts = libc::timespec {
                tv_sec: sec as libc::time_t,
                tv_nsec: nsec as libc::c_long,
            };
            let bytes: [u8; size_of::<libc::timespec>()] = unsafe { std::mem::transmute(ts) };
            data.extend_from_slice(&bytes);
        }
        data
    }

    #[test]
    fn test_decode_timestamping_record() {
        let payload = timestamping_payload([(10, 1), (0, 0), (20, 999_999_999)]);
        let mut control =
            ControlBuffer::new(&[(libc::SOL_SOCKET, libc::SO_TIMESTAMPING, payload)]);
        let msg = control.msghdr();

        let stamps = unsafe { KernelTimestamps::decode(&msg) };
        assert_eq!(stamps.software_ns, 10_000_000_001);
        assert_eq!(stamps.legacy_ns, 0);
        assert_eq!(stamps.hardware_raw_ns, 20_999_999_999);
        assert_eq!(stamps.get(TimestampSlot::HardwareRaw), 20_999_999_999);
        assert_eq!(stamps.get(TimestampSlot::Software), 10_000_000_001);
    }

    #[test]
    fn test_decode_skips_unrelated_messages() {
        let payload = timestamping_payload([(1, 0), (2, 0), (3, 0)]);
        let mut control = ControlBuffer::new(&[
            (libc::SOL_IP, libc::IP_TTL, vec![64, 0, 0, 0]),
            (libc::SOL_SOCKET, libc::SO_TIMESTAMPING, payload),
        ]);
        let msg = control.msghdr();

        let stamps = unsafe { KernelTimestamps::decode(&msg) };
        assert_eq!(stamps.hardware_raw_ns, 3_000_000_000);
    }

    #[test]
    fn test_missing_record_leaves_zeros() {
        let mut control = ControlBuffer::new(&[(libc::SOL_IP, libc::IP_TTL, vec![64, 0, 0, 0])]);
        let msg = control.msghdr();

        let stamps = unsafe { KernelTimestamps::decode(&msg) };
        assert!(stamps.is_empty());

        let empty: libc::msghdr = unsafe { std::mem::zeroed() };
        assert!(unsafe { KernelTimestamps::decode(&empty) }.is_empty());
    }

    #[test]
    fn test_short_record_ignored() {
        let truncated = vec![0xAB; size_of::<libc::timespec>()];
        let mut control =
            ControlBuffer::new(&[(libc::SOL_SOCKET, libc::SO_TIMESTAMPING, truncated)]);
        let msg = control.msghdr();

        assert!(unsafe { KernelTimestamps::decode(&msg) }.is_empty());
    }

    #[test]
    fn test_slot_parsing() {
        assert_eq!("software".parse::<TimestampSlot>().unwrap(), TimestampSlot::Software);
        assert_eq!("hardware-raw".parse::<TimestampSlot>().unwrap(), TimestampSlot::HardwareRaw);
        assert_eq!("Legacy".parse::<TimestampSlot>().unwrap(), TimestampSlot::Legacy);
        assert!("ptp".parse::<TimestampSlot>().is_err());
        assert_eq!(TimestampSlot::default(), TimestampSlot::HardwareRaw);
    }

    #[test]
    fn test_rx_flags_request_superset() {
        assert_eq!(RX_TIMESTAMPING_FLAGS, 0x78);
    }
}
