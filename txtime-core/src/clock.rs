//! Clock sources shared by the capture and replay engines.
//!
//! All times are absolute nanosecond counts on one of the kernel clocks.
//! `CLOCK_MONOTONIC_RAW` cross-stamps received datagrams; the pacing clocks
//! (`CLOCK_TAI`, `CLOCK_MONOTONIC`, `CLOCK_REALTIME`) drive scheduled
//! transmission and must match the clock configured via `SO_TXTIME`.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Kernel clock identifiers understood by both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockId {
    /// Hardware-based monotonic time, not slewed by NTP.
    MonotonicRaw,
    Monotonic,
    /// International atomic time, no leap seconds.
    Tai,
    /// Adjustable wall clock.
    Realtime,
}

impl ClockId {
    pub fn raw(self) -> libc::clockid_t {
        match self {
            ClockId::MonotonicRaw => libc::CLOCK_MONOTONIC_RAW,
            ClockId::Monotonic => libc::CLOCK_MONOTONIC,
            ClockId::Tai => libc::CLOCK_TAI,
            ClockId::Realtime => libc::CLOCK_REALTIME,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ClockId::MonotonicRaw => "CLOCK_MONOTONIC_RAW",
            ClockId::Monotonic => "CLOCK_MONOTONIC",
            ClockId::Tai => "CLOCK_TAI",
            ClockId::Realtime => "CLOCK_REALTIME",
        }
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses pacing clock names: `TAI`, `MONOTONIC`, `REALTIME`, with or
/// without the `CLOCK_` prefix. `CLOCK_MONOTONIC_RAW` cannot pace
/// transmissions and is rejected.
impl FromStr for ClockId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("CLOCK_").unwrap_or(&upper);
        match name {
            "TAI" => Ok(ClockId::Tai),
            "MONOTONIC" => Ok(ClockId::Monotonic),
            "REALTIME" => Ok(ClockId::Realtime),
            _ => Err(format!(
                "unsupported clock: {} (expected TAI, MONOTONIC or REALTIME)",
                s
            )),
        }
    }
}

/// Reads `clock` and returns nanoseconds since its epoch.
pub fn now(clock: ClockId) -> Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let ret = unsafe { libc::clock_gettime(clock.raw(), &mut ts) };
    if ret != 0 {
        return Err(Error::ClockRead {
            clock,
            source: io::Error::last_os_error(),
        });
    }
    Ok(absolute_time_to_ns(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// Splits an absolute nanosecond count into whole seconds and the
/// nanosecond remainder.
pub fn ns_to_absolute_time(ns: u64) -> (u64, u32) {
    (ns / NANOS_PER_SEC, (ns % NANOS_PER_SEC) as u32)
}

pub fn absolute_time_to_ns(secs: u64, nanos: u32) -> u64 {
    secs.saturating_mul(NANOS_PER_SEC).saturating_add(u64::from(nanos))
}

pub(crate) fn ns_to_timespec(ns: u64) -> libc::timespec {
    let (secs, nanos) = ns_to_absolute_time(ns);
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as libc::c_long,
    }
}

/// A readable, sleepable clock. The engines are generic over this so the
/// scheduling logic can run against a simulated clock.
pub trait Clock {
    fn id(&self) -> ClockId;

    fn now_ns(&self) -> Result<u64>;

    /// Sleeps for roughly `duration_ns`. Waking early is allowed.
    fn sleep_ns(&self, duration_ns: u64) -> Result<()>;
}

/// The host's kernel clocks.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    id: ClockId,
}

impl SystemClock {
    pub fn new(id: ClockId) -> Self {
        Self { id }
    }
}

impl Clock for SystemClock {
    fn id(&self) -> ClockId {
        self.id
    }

    fn now_ns(&self) -> Result<u64> {
        now(self.id)
    }

    fn sleep_ns(&self, duration_ns: u64) -> Result<()> {
        if self.id == ClockId::MonotonicRaw {
            // clock_nanosleep does not accept CLOCK_MONOTONIC_RAW.
            std::thread::sleep(Duration::from_nanos(duration_ns));
            return Ok(());
        }

        let req = ns_to_timespec(duration_ns);
        // SAFETY: `req` is a valid timespec; the remainder pointer may be null.
        let ret = unsafe { libc::clock_nanosleep(self.id.raw(), 0, &req, std::ptr::null_mut()) };
        match ret {
            0 | libc::EINTR => Ok(()),
            errno => Err(Error::ClockSleep {
                clock: self.id,
                source: io::Error::from_raw_os_error(errno),
            }),
        }
    }
}

/// Sleeps until `clock` is within `guard_ns` of `target_ns`.
///
/// Each pass reads the clock and either returns (inside the guard band) or
/// sleeps for `target_ns - guard_ns - now`. The final `guard_ns` is left to
/// the kernel's transmit scheduler rather than spun away in user space.
/// Returns the last clock reading; a value beyond `target_ns` means the
/// target was already missed on entry or the wake-up overshot.
pub fn sleep_until<C: Clock + ?Sized>(clock: &C, target_ns: u64, guard_ns: u64) -> Result<u64> {
    loop {
        let now_ns = clock.now_ns()?;
        if now_ns.saturating_add(guard_ns) >= target_ns {
            return Ok(now_ns);
        }
        let remaining = target_ns - guard_ns - now_ns;
        trace!(clock = %clock.id(), remaining, "sleeping until guard band");
        clock.sleep_ns(remaining)?;
    }
}
