//! Scheduled replay: re-send a trace's payloads at `base + offset`, where
//! `base` is the pacing clock at start plus the lead time.
//!
//! User space sleeps until `guard_ns = lead_ns / 2` before each target and
//! hands the packet to the kernel with the exact target attached; the
//! qdisc launches it at that instant.

use std::net::SocketAddrV4;

use tracing::{debug, info, warn};

use crate::clock::{Clock, ClockId, SystemClock, sleep_until};
use crate::error::{Error, Result};
use crate::trace::ReplayTrace;
use crate::txtime::{TxTimeErrors, TxTimeSender, TxTimeSocket};

/// Least slack the kernel needs to honour a scheduled send.
pub const MIN_LEAD_NS: u64 = 10_000;
pub const DEFAULT_LEAD_NS: u64 = 200_000;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub lead_ns: u64,
    pub clock: ClockId,
}

impl ReplayConfig {
    pub fn new(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        lead_ns: u64,
        clock: ClockId,
    ) -> Result<Self> {
        validate_lead(lead_ns)?;
        if clock == ClockId::MonotonicRaw {
            return Err(Error::Config(format!("{} cannot pace transmissions", clock)));
        }
        Ok(Self {
            local,
            remote,
            lead_ns,
            clock,
        })
    }

    pub fn guard_ns(&self) -> u64 {
        self.lead_ns / 2
    }
}

fn validate_lead(lead_ns: u64) -> Result<()> {
    if lead_ns < MIN_LEAD_NS {
        return Err(Error::Config(format!(
            "lead time {} ns is below the {} ns minimum",
            lead_ns, MIN_LEAD_NS
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub base_ns: u64,
    /// Sends issued after their target had already passed.
    pub late_sends: u64,
    pub max_late_ns: u64,
    pub txtime_errors: TxTimeErrors,
}

/// Replays `trace` in its stored order through `sender`.
///
/// Target times are not forced to be non-decreasing: a packet whose offset
/// is earlier than its predecessor's finds its target already passed and
/// is handed over immediately, counted in `late_sends`.
pub fn replay<C, S>(
    trace: ReplayTrace,
    clock: &C,
    sender: &mut S,
    lead_ns: u64,
) -> Result<ReplaySummary>
where
    C: Clock + ?Sized,
    S: TxTimeSender + ?Sized,
{
    validate_lead(lead_ns)?;
    let guard_ns = lead_ns / 2;
    let start_ns = clock.now_ns()?;
    let base_ns = start_ns.checked_add(lead_ns).ok_or_else(|| {
        Error::Config(format!(
            "lead time {} ns overflows {} (now {} ns)",
            lead_ns,
            clock.id(),
            start_ns
        ))
    })?;
    info!(
        "Replaying {} packets using {} lead={} us (base {} ns)",
        trace.len(),
        clock.id(),
        lead_ns / 1_000,
        base_ns
    );

    let mut summary = ReplaySummary {
        base_ns,
        ..ReplaySummary::default()
    };

    for (index, packet) in trace.into_iter().enumerate() {
        let target_ns = base_ns
            .checked_add(packet.relative_offset_ns)
            .ok_or_else(|| {
                Error::Config(format!(
                    "packet #{} at offset {} ns overflows {}",
                    index,
                    packet.relative_offset_ns,
                    clock.id()
                ))
            })?;
        let woke_ns = sleep_until(clock, target_ns, guard_ns)?;
        if woke_ns > target_ns {
            let late = woke_ns - target_ns;
            summary.late_sends += 1;
            summary.max_late_ns = summary.max_late_ns.max(late);
            debug!(index, target_ns, late_ns = late, "target already passed");
        }

        let sent = sender
            .send_at(&packet.payload, target_ns)
            .map_err(|source| Error::Send {
                index,
                txtime_ns: target_ns,
                source,
            })?;
        summary.packets_sent += 1;
        summary.bytes_sent += sent as u64;

        if summary.packets_sent % 100_000 == 0 {
            debug!("Sent {} packets", summary.packets_sent);
        }
    }

    Ok(summary)
}

/// Opens the pacing socket and replays `trace` on the system clock.
pub fn run(trace: ReplayTrace, config: &ReplayConfig) -> Result<ReplaySummary> {
    validate_lead(config.lead_ns)?;
    let mut socket = TxTimeSocket::open(config.local, config.remote, config.clock)?;
    info!("Destination: {}", config.remote);

    let clock = SystemClock::new(config.clock);
    let mut summary = replay(trace, &clock, &mut socket, config.lead_ns)?;

    summary.txtime_errors = socket.drain_txtime_errors();
    let errors = summary.txtime_errors;
    if errors.total() > 0 {
        warn!(
            "Kernel reported {} pacing errors: {} missed deadlines, {} invalid txtime, {} other",
            errors.total(),
            errors.missed_deadline,
            errors.invalid_param,
            errors.other
        );
    }
    if summary.late_sends > 0 {
        warn!(
            "{} packets were handed to the kernel after their target (worst {} ns late)",
            summary.late_sends, summary.max_late_ns
        );
    }

    info!("======= REPLAY SUMMARY =======");
    info!("Packets sent: {}", summary.packets_sent);
    info!("Bytes sent: {}", summary.bytes_sent);
    info!("Late sends: {}", summary.late_sends);
    info!("==============================");

    Ok(summary)
}
