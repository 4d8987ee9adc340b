//! The three nested frame layers of the 7k protocol.
//!
//! Every message on the wire is a network frame wrapping one data record frame:
//!
//! ```text
//! ┌────────────────────┬────────────────────────┬──────────────┬──────────┐
//! │ Network frame (36) │ Data record frame (64) │ Record data  │ Size - 4 │
//! └────────────────────┴────────────────────────┴──────────────┴──────────┘
//! ```
//!
//! All multi-byte fields are little-endian.

use chrono::{Datelike, Timelike, Utc};

use crate::command::Command;
use crate::error::{Error, Result};

pub const NETWORK_FRAME_SIZE: usize = 36;
pub const DATA_RECORD_FRAME_SIZE: usize = 64;
pub const CHECKSUM_SIZE: usize = 4;
/// Smallest chunk that can carry a complete record
pub const MIN_RECORD_CHUNK: usize = NETWORK_FRAME_SIZE + DATA_RECORD_FRAME_SIZE + CHECKSUM_SIZE;
pub const PROTOCOL_VERSION: u16 = 5;
pub const SYNC_PATTERN: u32 = 0xFFFF;
/// Offset of the record data counted from the sync pattern, i.e. the header size minus
/// the version and offset fields
pub const DATA_SECTION_OFFSET: u16 = (DATA_RECORD_FRAME_SIZE - 4) as u16;

// Byte positions inside a received chunk (network frame included)
const PACKET_SIZE_AT: usize = 12;
const RECORD_SIZE_AT: usize = NETWORK_FRAME_SIZE + 8;
const RECORD_TYPE_AT: usize = NETWORK_FRAME_SIZE + 32;
const TIME_AT: usize = 20;

/// Little-endian cursor over a byte slice. Callers check the length up front.
pub(crate) struct LeReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub(crate) fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    pub(crate) fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    pub(crate) fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    pub(crate) fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }
}

/// Read a little-endian u32 at `at`, if the slice is long enough
pub(crate) fn u32_at(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian f32 at `at`, if the slice is long enough
pub(crate) fn f32_at(buf: &[u8], at: usize) -> Option<f32> {
    u32_at(buf, at).map(f32::from_bits)
}

/// Outer envelope of every message exchanged with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkFrame {
    pub protocol_version: u16,
    pub header_offset: u16,
    pub total_packets: u32,
    pub total_records: u16,
    pub transaction_id: u16,
    /// Header plus payload
    pub packet_size: u32,
    /// Payload only
    pub total_size: u32,
    pub sequence_number: u32,
    pub destination_device: u32,
    pub destination_enumerator: u16,
    pub source_enumerator: u16,
    pub source_id: u32,
}

impl NetworkFrame {
    /// Single packet, single record frame addressed to `device`
    pub fn for_payload(device: u32, enumerator: u16, payload_len: usize) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            header_offset: NETWORK_FRAME_SIZE as u16,
            total_packets: 1,
            total_records: 1,
            transaction_id: 1,
            packet_size: (NETWORK_FRAME_SIZE + payload_len) as u32,
            total_size: payload_len as u32,
            sequence_number: 0,
            destination_device: device,
            destination_enumerator: enumerator,
            source_enumerator: 0,
            source_id: 0,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.protocol_version.to_le_bytes());
        buf.extend_from_slice(&self.header_offset.to_le_bytes());
        buf.extend_from_slice(&self.total_packets.to_le_bytes());
        buf.extend_from_slice(&self.total_records.to_le_bytes());
        buf.extend_from_slice(&self.transaction_id.to_le_bytes());
        buf.extend_from_slice(&self.packet_size.to_le_bytes());
        buf.extend_from_slice(&self.total_size.to_le_bytes());
        buf.extend_from_slice(&self.sequence_number.to_le_bytes());
        buf.extend_from_slice(&self.destination_device.to_le_bytes());
        buf.extend_from_slice(&self.destination_enumerator.to_le_bytes());
        buf.extend_from_slice(&self.source_enumerator.to_le_bytes());
        buf.extend_from_slice(&self.source_id.to_le_bytes());
    }

    /// Returns `None` if the buffer is shorter than a network frame header
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < NETWORK_FRAME_SIZE {
            return None;
        }
        let mut r = LeReader::new(buf);
        Some(Self {
            protocol_version: r.u16(),
            header_offset: r.u16(),
            total_packets: r.u32(),
            total_records: r.u16(),
            transaction_id: r.u16(),
            packet_size: r.u32(),
            total_size: r.u32(),
            sequence_number: r.u32(),
            destination_device: r.u32(),
            destination_enumerator: r.u16(),
            source_enumerator: r.u16(),
            source_id: r.u32(),
        })
    }
}

/// UTC time stamp carried by every data record frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordTime {
    pub year: u16,
    pub day_of_year: u16,
    pub seconds: f32,
    pub hour: u8,
    pub minute: u8,
}

impl RecordTime {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            year: now.year() as u16,
            day_of_year: now.ordinal() as u16,
            seconds: now.second() as f32 + now.nanosecond() as f32 * 1e-9,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }

    /// The ten bytes as they appear on the wire
    pub fn to_bytes(&self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0..2].copy_from_slice(&self.year.to_le_bytes());
        out[2..4].copy_from_slice(&self.day_of_year.to_le_bytes());
        out[4..8].copy_from_slice(&self.seconds.to_le_bytes());
        out[8] = self.hour;
        out[9] = self.minute;
        out
    }
}

/// Header of one logical device record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRecordFrame {
    pub protocol_version: u16,
    pub offset: u16,
    pub sync_pattern: u32,
    /// Header, record data and trailing checksum
    pub size: u32,
    pub data_offset: u32,
    pub data_id: u32,
    pub time: RecordTime,
    pub reserved: u16,
    pub record_type: u32,
    pub device_id: u32,
    pub system_enumerator: u32,
    pub reserved2: u32,
    pub flag: u16,
    pub reserved3: u16,
    pub reserved4: u32,
    pub total_fragments: u32,
    pub fragment_number: u32,
}

impl DataRecordFrame {
    pub fn new(
        record_type: u32,
        device_id: u32,
        enumerator: u16,
        time: RecordTime,
        data_len: usize,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            offset: DATA_SECTION_OFFSET,
            sync_pattern: SYNC_PATTERN,
            size: (DATA_RECORD_FRAME_SIZE + data_len + CHECKSUM_SIZE) as u32,
            data_offset: 0,
            data_id: 0,
            time,
            reserved: 1,
            record_type,
            device_id,
            system_enumerator: enumerator as u32,
            reserved2: 1,
            flag: 0,
            reserved3: 0,
            reserved4: 0,
            total_fragments: 0,
            fragment_number: 0,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.protocol_version.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.sync_pattern.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.data_offset.to_le_bytes());
        buf.extend_from_slice(&self.data_id.to_le_bytes());
        buf.extend_from_slice(&self.time.to_bytes());
        buf.extend_from_slice(&self.reserved.to_le_bytes());
        buf.extend_from_slice(&self.record_type.to_le_bytes());
        buf.extend_from_slice(&self.device_id.to_le_bytes());
        buf.extend_from_slice(&self.system_enumerator.to_le_bytes());
        buf.extend_from_slice(&self.reserved2.to_le_bytes());
        buf.extend_from_slice(&self.flag.to_le_bytes());
        buf.extend_from_slice(&self.reserved3.to_le_bytes());
        buf.extend_from_slice(&self.reserved4.to_le_bytes());
        buf.extend_from_slice(&self.total_fragments.to_le_bytes());
        buf.extend_from_slice(&self.fragment_number.to_le_bytes());
    }

    /// Returns `None` if the buffer is shorter than a data record frame header
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < DATA_RECORD_FRAME_SIZE {
            return None;
        }
        let mut r = LeReader::new(buf);
        Some(Self {
            protocol_version: r.u16(),
            offset: r.u16(),
            sync_pattern: r.u32(),
            size: r.u32(),
            data_offset: r.u32(),
            data_id: r.u32(),
            time: RecordTime {
                year: r.u16(),
                day_of_year: r.u16(),
                seconds: r.f32(),
                hour: r.u8(),
                minute: r.u8(),
            },
            reserved: r.u16(),
            record_type: r.u32(),
            device_id: r.u32(),
            system_enumerator: r.u32(),
            reserved2: r.u32(),
            flag: r.u16(),
            reserved3: r.u16(),
            reserved4: r.u32(),
            total_fragments: r.u32(),
            fragment_number: r.u32(),
        })
    }

    /// Length of the record data between the header and the checksum
    pub fn data_len(&self) -> usize {
        (self.size as usize).saturating_sub(DATA_RECORD_FRAME_SIZE + CHECKSUM_SIZE)
    }
}

/// Wrap `data` in a data record frame followed by its size checksum
pub fn encode_record(
    record_type: u32,
    device_id: u32,
    enumerator: u16,
    time: RecordTime,
    data: &[u8],
) -> Vec<u8> {
    let drf = DataRecordFrame::new(record_type, device_id, enumerator, time, data.len());
    let mut buf = Vec::with_capacity(drf.size as usize);
    drf.encode_into(&mut buf);
    buf.extend_from_slice(data);
    buf.extend_from_slice(&(drf.size - CHECKSUM_SIZE as u32).to_le_bytes());
    buf
}

/// Wrap an encoded record in a network frame
pub fn encode_network(device: u32, enumerator: u16, record: &[u8]) -> Vec<u8> {
    let nf = NetworkFrame::for_payload(device, enumerator, record.len());
    let mut buf = Vec::with_capacity(nf.packet_size as usize);
    nf.encode_into(&mut buf);
    buf.extend_from_slice(record);
    buf
}

/// Split a complete message into its network frame header and payload
pub fn decode_network_frame(bytes: &[u8]) -> Result<(NetworkFrame, &[u8])> {
    let header = NetworkFrame::decode(bytes)
        .ok_or_else(|| Error::Malformed(format!("{} bytes is too short for a network frame", bytes.len())))?;
    if header.packet_size as usize != bytes.len()
        || header.total_size as usize + NETWORK_FRAME_SIZE != bytes.len()
    {
        return Err(Error::Malformed(format!(
            "network frame declares {} bytes ({} payload) but {} arrived",
            header.packet_size,
            header.total_size,
            bytes.len()
        )));
    }
    Ok((header, &bytes[NETWORK_FRAME_SIZE..]))
}

/// Split a data record into its header and record data, dropping the trailing checksum
pub fn decode_data_record_frame(bytes: &[u8]) -> Result<(DataRecordFrame, &[u8])> {
    let header = DataRecordFrame::decode(bytes).ok_or_else(|| {
        Error::Malformed(format!("{} bytes is too short for a data record frame", bytes.len()))
    })?;
    let size = header.size as usize;
    if size < DATA_RECORD_FRAME_SIZE + CHECKSUM_SIZE || size > bytes.len() {
        return Err(Error::Malformed(format!(
            "data record frame declares {} bytes but {} are available",
            size,
            bytes.len()
        )));
    }
    Ok((header, &bytes[DATA_RECORD_FRAME_SIZE..size - CHECKSUM_SIZE]))
}

/// Check the size fields of a received chunk against its length.
///
/// Accepts only when the record size plus the network header equals both the declared
/// packet size and the number of bytes received. Returns the record type on success.
pub fn validate_chunk(chunk: &[u8]) -> Option<u32> {
    if chunk.len() < MIN_RECORD_CHUNK {
        return None;
    }
    let packet_size = u32_at(chunk, PACKET_SIZE_AT)? as usize;
    let record_size = u32_at(chunk, RECORD_SIZE_AT)? as usize;
    if record_size + NETWORK_FRAME_SIZE != packet_size || packet_size != chunk.len() {
        return None;
    }
    u32_at(chunk, RECORD_TYPE_AT)
}

/// The raw time stamp bytes of a data record frame
pub(crate) fn time_bytes(record: &[u8]) -> Option<&[u8]> {
    record.get(TIME_AT..TIME_AT + 10)
}

/// Builds outgoing command messages for one device
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    pub device_id: u32,
    pub enumerator: u16,
}

impl FrameEncoder {
    pub fn new(device_id: u32, enumerator: u16) -> Self {
        Self {
            device_id,
            enumerator,
        }
    }

    /// Encode a command stamped with the current UTC time
    pub fn encode_command(&self, command: &Command) -> Vec<u8> {
        self.encode_command_at(command, RecordTime::now())
    }

    pub fn encode_command_at(&self, command: &Command, time: RecordTime) -> Vec<u8> {
        let record = encode_record(
            command.record_type(),
            self.device_id,
            self.enumerator,
            time,
            &command.encode_body(),
        );
        encode_network(self.device_id, self.enumerator, &record)
    }

    /// Look up `name` in the command table, then encode it
    pub fn encode_named(&self, name: &str, args: &[&str]) -> Result<Vec<u8>> {
        let command = Command::parse(name, args)?;
        Ok(self.encode_command(&command))
    }
}
