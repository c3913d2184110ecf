use std::io::Write;

use serde::Serialize;

use crate::error::Result;

/// Ethernet (14) + IPv4 (20) + UDP (8) header bytes. Added to the payload
/// length as an estimate of the on-wire size; nothing is measured.
pub const WIRE_OVERHEAD_BYTES: u64 = 42;

pub const CSV_HEADER: [&str; 5] = [
    "seq",
    "wire_len",
    "payload_len",
    "kernel_realtime_ns",
    "mono_raw_ns",
];

/// One received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimestampSample {
    pub seq: u64,
    pub wire_len: u64,
    pub payload_len: u64,
    /// Column name kept for compatibility with existing analysis scripts;
    /// the value is whichever timestamping slot the engine was told to use.
    #[serde(rename = "kernel_realtime_ns")]
    pub kernel_timestamp_ns: u64,
    pub mono_raw_ns: u64,
}

impl TimestampSample {
    pub fn new(seq: u64, payload_len: u64, kernel_timestamp_ns: u64, mono_raw_ns: u64) -> Self {
        Self {
            seq,
            wire_len: payload_len + WIRE_OVERHEAD_BYTES,
            payload_len,
            kernel_timestamp_ns,
            mono_raw_ns,
        }
    }
}

/// Line-oriented CSV output, flushed after the header and after every row
/// so a downstream reader sees each sample as soon as it is received.
pub struct SampleWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> SampleWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);
        writer.write_record(CSV_HEADER)?;
        writer.flush().map_err(csv::Error::from)?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, sample: &TimestampSample) -> Result<()> {
        self.writer.serialize(sample)?;
        self.writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()).into())
    }
}
