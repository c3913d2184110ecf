use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pcap_file::DataLink;
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// One UDP payload to re-send, with its arrival time relative to the first
/// accepted frame of the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPacket {
    pub relative_offset_ns: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub frames_read: u64,
    pub accepted: u64,
    pub skipped: u64,
}

/// UDP payloads in capture order. Never re-sorted, so offsets may go
/// backwards when the capture itself does.
#[derive(Debug, Clone, Default)]
pub struct ReplayTrace {
    packets: Vec<ReplayPacket>,
    stats: TraceStats,
}

impl ReplayTrace {
    pub fn packets(&self) -> &[ReplayPacket] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    /// Largest relative offset in the trace.
    pub fn span_ns(&self) -> u64 {
        self.packets
            .iter()
            .map(|p| p.relative_offset_ns)
            .max()
            .unwrap_or(0)
    }

    pub fn payload_bytes(&self) -> u64 {
        self.packets.iter().map(|p| p.payload.len() as u64).sum()
    }

    /// Number of packets whose offset is earlier than their predecessor's.
    pub fn out_of_order(&self) -> usize {
        self.packets
            .windows(2)
            .filter(|w| w[1].relative_offset_ns < w[0].relative_offset_ns)
            .count()
    }
}

impl IntoIterator for ReplayTrace {
    type Item = ReplayPacket;
    type IntoIter = std::vec::IntoIter<ReplayPacket>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}

/// Accumulates accepted frames and computes offsets against the first one.
#[derive(Debug, Default)]
pub struct TraceBuilder {
    epoch: Option<Duration>,
    trace: ReplayTrace,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers one captured frame. Returns whether it was accepted.
    pub fn push_frame(&mut self, timestamp: Duration, frame: &[u8]) -> bool {
        self.trace.stats.frames_read += 1;
        let Some(payload) = extract_udp_payload(frame) else {
            self.trace.stats.skipped += 1;
            return false;
        };

        let epoch = *self.epoch.get_or_insert(timestamp);
        let relative_offset_ns = timestamp
            .checked_sub(epoch)
            .map_or(0, |delta| delta.as_nanos() as u64);

        trace!(
            index = self.trace.packets.len(),
            relative_offset_ns,
            len = payload.len(),
            "accepted UDP payload"
        );
        self.trace.packets.push(ReplayPacket {
            relative_offset_ns,
            payload: payload.to_vec(),
        });
        self.trace.stats.accepted += 1;
        true
    }

    pub fn finish(self) -> ReplayTrace {
        self.trace
    }
}

/// Returns the UDP payload of an Ethernet/IPv4/UDP frame, or `None` for any
/// other shape. Every declared length is checked against the captured bytes,
/// and zero-length payloads are refused.
pub fn extract_udp_payload(frame: &[u8]) -> Option<&[u8]> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ip_bytes = &frame[ETHERNET_HEADER_LEN..];
    let ipv4 = Ipv4Packet::new(ip_bytes)?;
    let ip_header_len = usize::from(ipv4.get_header_length()) * 4;
    if ipv4.get_version() != 4 || ip_header_len < IPV4_MIN_HEADER_LEN {
        return None;
    }
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }
    if ip_bytes.len() < ip_header_len + UDP_HEADER_LEN {
        return None;
    }

    let udp_bytes = &ip_bytes[ip_header_len..];
    let udp = UdpPacket::new(udp_bytes)?;
    let payload_len = usize::from(udp.get_length()).checked_sub(UDP_HEADER_LEN)?;
    if udp_bytes.len() < UDP_HEADER_LEN + payload_len || payload_len == 0 {
        return None;
    }

    Some(&udp_bytes[UDP_HEADER_LEN..UDP_HEADER_LEN + payload_len])
}

/// First four bytes of a pcapng Section Header Block.
const PCAPNG_MAGIC: [u8; 4] = [0x0A, 0x0D, 0x0D, 0x0A];

/// Reads a capture file start to end and keeps every UDP payload. Both
/// classic pcap and pcapng are accepted; the format is picked from the
/// file's magic number.
///
/// Frames that are not Ethernet/IPv4/UDP, or whose headers do not fit in
/// the captured bytes, are skipped without complaint. Fails when the file
/// cannot be opened, a frame cannot be read, or nothing usable was found.
pub fn load<P: AsRef<Path>>(path: P) -> Result<ReplayTrace> {
    let path = path.as_ref();
    debug!("Opening capture file: {}", path.display());

    let file = File::open(path).map_err(|source| Error::TraceOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let magic = reader.fill_buf().map_err(|source| Error::TraceOpen {
        path: path.to_path_buf(),
        source,
    })?;

    let mut builder = TraceBuilder::new();
    if magic.starts_with(&PCAPNG_MAGIC) {
        read_pcapng(path, reader, &mut builder)?;
    } else {
        read_pcap(path, reader, &mut builder)?;
    }

    let trace = builder.finish();
    let stats = trace.stats();
    if trace.is_empty() {
        return Err(Error::EmptyTrace {
            path: PathBuf::from(path),
        });
    }

    info!("Capture summary for {}:", path.display());
    info!("  Frames read: {}", stats.frames_read);
    info!("  UDP payloads: {} ({} bytes)", stats.accepted, trace.payload_bytes());
    info!("  Skipped frames: {}", stats.skipped);
    info!("  Span: {:.6} seconds", trace.span_ns() as f64 / 1e9);
    let backwards = trace.out_of_order();
    if backwards > 0 {
        warn!(
            "{} packets are earlier than their predecessor; they keep capture order and will be sent late",
            backwards
        );
    }

    Ok(trace)
}

fn read_pcap(path: &Path, reader: BufReader<File>, builder: &mut TraceBuilder) -> Result<()> {
    let mut reader = PcapReader::new(reader).map_err(|source| Error::TraceHeader {
        path: path.to_path_buf(),
        source,
    })?;

    let header = reader.header();
    if header.datalink != DataLink::ETHERNET {
        warn!(
            "Capture link type is {:?}, frames will still be parsed as Ethernet",
            header.datalink
        );
    }

    while let Some(packet) = reader.next_packet() {
        let packet = packet.map_err(|source| Error::TraceRead {
            path: path.to_path_buf(),
            frame: builder.trace.stats.frames_read + 1,
            source,
        })?;
        builder.push_frame(packet.timestamp, &packet.data);
    }
    Ok(())
}

/// Packets come from Enhanced and Simple Packet Blocks. Simple blocks carry
/// no timestamp and are read as time zero, which clamps to offset zero.
fn read_pcapng(path: &Path, reader: BufReader<File>, builder: &mut TraceBuilder) -> Result<()> {
    debug!("Reading {} as pcapng", path.display());
    let mut reader = PcapNgReader::new(reader).map_err(|source| Error::TraceHeader {
        path: path.to_path_buf(),
        source,
    })?;

    while let Some(block) = reader.next_block() {
        let block = block.map_err(|source| Error::TraceRead {
            path: path.to_path_buf(),
            frame: builder.trace.stats.frames_read + 1,
            source,
        })?;
        match block {
            Block::InterfaceDescription(interface) => {
                if interface.linktype != DataLink::ETHERNET {
                    warn!(
                        "Interface link type is {:?}, frames will still be parsed as Ethernet",
                        interface.linktype
                    );
                }
            }
            Block::EnhancedPacket(packet) => {
                builder.push_frame(packet.timestamp, &packet.data);
            }
            Block::SimplePacket(packet) => {
                builder.push_frame(Duration::ZERO, &packet.data);
            }
            _ => {}
        }
    }
    Ok(())
}
