//! Kernel-timestamped UDP capture and `SO_TXTIME` paced replay.
//!
//! Two engines share the [`clock`] module:
//!
//! - [`rx`] receives datagrams on a socket with `SO_TIMESTAMPING` enabled
//!   and emits one [`TimestampSample`] per datagram, cross-stamped with
//!   `CLOCK_MONOTONIC_RAW` at dequeue.
//! - [`replay`] loads a pcap with [`trace::load`] and re-sends each UDP
//!   payload at `now + lead + offset`, leaving the last stretch of the
//!   wait to the kernel's transmit scheduler.
//!
//! Linux only.

pub mod affinity;
pub mod clock;
pub mod error;
pub mod replay;
pub mod rx;
pub mod sample;
pub mod timestamping;
pub mod trace;
pub mod txtime;

pub use clock::{Clock, ClockId, SystemClock};
pub use error::{Error, Result};
pub use replay::{ReplayConfig, ReplaySummary};
pub use rx::{RxConfig, RxEngine};
pub use sample::{SampleWriter, TimestampSample};
pub use timestamping::{KernelTimestamps, TimestampSlot};
pub use trace::{ReplayPacket, ReplayTrace};
