//! Record identifiers and the handful of record layouts this crate reads.

use std::fmt;

use crate::error::{Error, Result};
use crate::frame::{
    f32_at, time_bytes, u32_at, validate_chunk, DataRecordFrame, CHECKSUM_SIZE,
    DATA_RECORD_FRAME_SIZE, NETWORK_FRAME_SIZE,
};

/// Record types seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    /// Sonar settings, sent once per ping. Marks ping boundaries.
    Ping,
    /// Bathymetry: range, intensity and quality per beam
    Bathymetry,
    /// Backscatter imagery
    Backscatter,
    /// Water column, used for noise estimation
    WaterColumn,
    /// Raw detection data
    RawDetection,
    /// Snippets
    Snippets,
    /// Raw samples per receive element
    ElementSamples,
    RemoteControl,
    RemoteControlAck,
    RemoteControlNak,
    /// Full system settings, the answer to a single request for 7503
    SystemSettings,
    Absorption,
    Spreading,
    Other(u32),
}

/// How the demultiplexer treats a record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// Closes the current ping bundle and opens the next
    Boundary,
    /// Kept in a latest-value slot outside of ping bundles
    Diagnostic(DiagnosticKind),
    /// Answer to a command, routed to the reply channel
    Reply,
    /// Accumulated in the current ping bundle
    Bundled,
}

/// Out-of-band records that are requested rather than streamed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    WaterColumn,
    ElementSamples,
}

impl DiagnosticKind {
    pub fn record_type(&self) -> RecordType {
        match self {
            DiagnosticKind::WaterColumn => RecordType::WaterColumn,
            DiagnosticKind::ElementSamples => RecordType::ElementSamples,
        }
    }
}

impl RecordType {
    pub fn code(&self) -> u32 {
        match self {
            RecordType::Ping => 7000,
            RecordType::Bathymetry => 7006,
            RecordType::Backscatter => 7008,
            RecordType::WaterColumn => 7018,
            RecordType::RawDetection => 7027,
            RecordType::Snippets => 7028,
            RecordType::ElementSamples => 7038,
            RecordType::RemoteControl => 7500,
            RecordType::RemoteControlAck => 7501,
            RecordType::RemoteControlNak => 7502,
            RecordType::SystemSettings => 7503,
            RecordType::Absorption => 7611,
            RecordType::Spreading => 7612,
            RecordType::Other(code) => *code,
        }
    }

    pub fn class(&self) -> RecordClass {
        match self {
            RecordType::Ping => RecordClass::Boundary,
            RecordType::WaterColumn => RecordClass::Diagnostic(DiagnosticKind::WaterColumn),
            RecordType::ElementSamples => RecordClass::Diagnostic(DiagnosticKind::ElementSamples),
            RecordType::RemoteControlAck
            | RecordType::RemoteControlNak
            | RecordType::SystemSettings => RecordClass::Reply,
            RecordType::Bathymetry
            | RecordType::Backscatter
            | RecordType::RawDetection
            | RecordType::Snippets
            | RecordType::RemoteControl
            | RecordType::Absorption
            | RecordType::Spreading
            | RecordType::Other(_) => RecordClass::Bundled,
        }
    }
}

impl From<u32> for RecordType {
    fn from(code: u32) -> Self {
        match code {
            7000 => RecordType::Ping,
            7006 => RecordType::Bathymetry,
            7008 => RecordType::Backscatter,
            7018 => RecordType::WaterColumn,
            7027 => RecordType::RawDetection,
            7028 => RecordType::Snippets,
            7038 => RecordType::ElementSamples,
            7500 => RecordType::RemoteControl,
            7501 => RecordType::RemoteControlAck,
            7502 => RecordType::RemoteControlNak,
            7503 => RecordType::SystemSettings,
            7611 => RecordType::Absorption,
            7612 => RecordType::Spreading,
            other => RecordType::Other(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One received record: data record frame header, record data and checksum
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub record_type: RecordType,
    pub header: DataRecordFrame,
    bytes: Vec<u8>,
}

impl Record {
    /// Build a record from a received chunk, `None` if the chunk fails size validation
    pub fn from_chunk(chunk: &[u8]) -> Option<Self> {
        let code = validate_chunk(chunk)?;
        let bytes = chunk[NETWORK_FRAME_SIZE..].to_vec();
        let header = DataRecordFrame::decode(&bytes)?;
        Some(Self {
            record_type: RecordType::from(code),
            header,
            bytes,
        })
    }

    /// Header, record data and checksum as received
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Record data between the header and the checksum
    pub fn data(&self) -> &[u8] {
        let end = self.bytes.len().saturating_sub(CHECKSUM_SIZE);
        self.bytes.get(DATA_RECORD_FRAME_SIZE..end).unwrap_or_default()
    }

    /// Raw year..minute time stamp bytes
    pub fn time_bytes(&self) -> &[u8] {
        time_bytes(&self.bytes).unwrap_or_default()
    }
}

fn need(data: &[u8], len: usize, what: &str) -> Result<()> {
    if data.len() < len {
        return Err(Error::Malformed(format!(
            "{} needs {} bytes of record data, got {}",
            what,
            len,
            data.len()
        )));
    }
    Ok(())
}

/// The settings a 7000 record reports for its ping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSettings {
    pub frequency: f32,
    pub sample_rate: f32,
    pub ping_period: f32,
    pub range: f32,
    pub power: f32,
    pub gain: f32,
    pub absorption: f32,
    pub spreading: f32,
}

impl PingSettings {
    pub const FREQUENCY_AT: usize = 14;
    pub const SAMPLE_RATE_AT: usize = 18;
    pub const PING_PERIOD_AT: usize = 50;
    pub const RANGE_AT: usize = 54;
    pub const POWER_AT: usize = 58;
    pub const GAIN_AT: usize = 62;
    pub const ABSORPTION_AT: usize = 142;
    pub const SPREADING_AT: usize = 150;

    /// Decode from the data section of a 7000 record
    pub fn from_data(data: &[u8]) -> Result<Self> {
        need(data, Self::SPREADING_AT + 4, "7000 record")?;
        let f = |at| f32_at(data, at).unwrap_or_default();
        Ok(Self {
            frequency: f(Self::FREQUENCY_AT),
            sample_rate: f(Self::SAMPLE_RATE_AT),
            ping_period: f(Self::PING_PERIOD_AT),
            range: f(Self::RANGE_AT),
            power: f(Self::POWER_AT),
            gain: f(Self::GAIN_AT),
            absorption: f(Self::ABSORPTION_AT),
            spreading: f(Self::SPREADING_AT),
        })
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        if record.record_type != RecordType::Ping {
            return Err(Error::Malformed(format!(
                "expected a 7000 record, got {}",
                record.record_type
            )));
        }
        Self::from_data(record.data())
    }
}

/// The subset of the 7503 system settings the client uses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSettings {
    pub frequency: f32,
    pub ping_rate: f32,
    pub range: f32,
    pub power: f32,
    pub gain: f32,
    pub absorption: f32,
    pub spreading: f32,
}

impl SystemSettings {
    pub const FREQUENCY_AT: usize = 12;
    pub const PING_RATE_AT: usize = 44;
    pub const RANGE_AT: usize = 52;
    pub const POWER_AT: usize = 56;
    pub const GAIN_AT: usize = 60;
    pub const ABSORPTION_AT: usize = 136;
    pub const SPREADING_AT: usize = 144;

    pub fn from_data(data: &[u8]) -> Result<Self> {
        need(data, Self::SPREADING_AT + 4, "7503 record")?;
        let f = |at| f32_at(data, at).unwrap_or_default();
        Ok(Self {
            frequency: f(Self::FREQUENCY_AT),
            ping_rate: f(Self::PING_RATE_AT),
            range: f(Self::RANGE_AT),
            power: f(Self::POWER_AT),
            gain: f(Self::GAIN_AT),
            absorption: f(Self::ABSORPTION_AT),
            spreading: f(Self::SPREADING_AT),
        })
    }

    /// System enumerator addressing the head running at this frequency
    pub fn enumerator(&self) -> Option<u16> {
        enumerator_for_frequency(self.frequency)
    }
}

/// 100 and 200 kHz run on enumerator 0, 396 kHz on enumerator 1
pub fn enumerator_for_frequency(frequency: f32) -> Option<u16> {
    match frequency.round() as u32 {
        100_000 | 200_000 => Some(0),
        396_000 => Some(1),
        _ => None,
    }
}

/// The device's answer to a remote control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    Ack { ticket: u32 },
    Nak { ticket: u32, error_code: u32 },
}

impl CommandReply {
    pub fn from_record(record: &Record) -> Result<Self> {
        let data = record.data();
        match record.record_type {
            RecordType::RemoteControlAck => {
                need(data, 20, "7501 record")?;
                Ok(CommandReply::Ack {
                    ticket: u32_at(data, 0).unwrap_or_default(),
                })
            }
            RecordType::RemoteControlNak => {
                need(data, 24, "7502 record")?;
                Ok(CommandReply::Nak {
                    ticket: u32_at(data, 0).unwrap_or_default(),
                    error_code: u32_at(data, 20).unwrap_or_default(),
                })
            }
            other => Err(Error::Malformed(format!(
                "{} is not a command reply",
                other
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::{encode_network, encode_record, RecordTime};

    pub(crate) fn time(seconds: f32) -> RecordTime {
        RecordTime {
            year: 2014,
            day_of_year: 176,
            seconds,
            hour: 9,
            minute: 41,
        }
    }

    /// A complete message as the device would send it
    pub(crate) fn chunk(code: u32, data: &[u8]) -> Vec<u8> {
        chunk_at(code, data, time(1.0))
    }

    pub(crate) fn chunk_at(code: u32, data: &[u8], at: RecordTime) -> Vec<u8> {
        encode_network(7125, 0, &encode_record(code, 7125, 0, at, data))
    }

    /// 7000 record data with the given power and gain
    pub(crate) fn ping_data(power: f32, gain: f32) -> Vec<u8> {
        let mut data = vec![0u8; 156];
        data[PingSettings::FREQUENCY_AT..][..4].copy_from_slice(&200_000f32.to_le_bytes());
        data[PingSettings::POWER_AT..][..4].copy_from_slice(&power.to_le_bytes());
        data[PingSettings::GAIN_AT..][..4].copy_from_slice(&gain.to_le_bytes());
        data[PingSettings::ABSORPTION_AT..][..4].copy_from_slice(&40f32.to_le_bytes());
        data[PingSettings::SPREADING_AT..][..4].copy_from_slice(&30f32.to_le_bytes());
        data
    }

    #[test]
    fn codes_round_trip() {
        for code in [7000, 7006, 7008, 7018, 7027, 7028, 7038, 7500, 7501, 7502, 7503, 7611, 7612, 1234] {
            assert_eq!(RecordType::from(code).code(), code);
        }
        assert_eq!(RecordType::from(9999), RecordType::Other(9999));
    }

    #[test]
    fn classification() {
        assert_eq!(RecordType::Ping.class(), RecordClass::Boundary);
        assert_eq!(
            RecordType::WaterColumn.class(),
            RecordClass::Diagnostic(DiagnosticKind::WaterColumn)
        );
        assert_eq!(
            RecordType::ElementSamples.class(),
            RecordClass::Diagnostic(DiagnosticKind::ElementSamples)
        );
        assert_eq!(RecordType::SystemSettings.class(), RecordClass::Reply);
        assert_eq!(RecordType::Bathymetry.class(), RecordClass::Bundled);
        assert_eq!(RecordType::Other(7200).class(), RecordClass::Bundled);
    }

    #[test]
    fn record_from_chunk() {
        let record = Record::from_chunk(&chunk(7006, &[9, 8, 7])).unwrap();
        assert_eq!(record.record_type, RecordType::Bathymetry);
        assert_eq!(record.data(), &[9, 8, 7]);
        assert_eq!(record.bytes().len(), 64 + 3 + 4);
        assert_eq!(record.time_bytes(), &time(1.0).to_bytes());
        assert!(Record::from_chunk(&chunk(7006, &[1])[..70]).is_none());
    }

    #[test]
    fn ping_settings() {
        let record = Record::from_chunk(&chunk(7000, &ping_data(205.0, 12.0))).unwrap();
        let settings = PingSettings::from_record(&record).unwrap();
        assert_eq!(settings.power, 205.0);
        assert_eq!(settings.gain, 12.0);
        assert_eq!(settings.frequency, 200_000.0);
        assert_eq!(settings.absorption, 40.0);
        assert_eq!(settings.spreading, 30.0);
        assert!(PingSettings::from_data(&[0u8; 100]).is_err());

        let other = Record::from_chunk(&chunk(7006, &ping_data(1.0, 1.0))).unwrap();
        assert!(PingSettings::from_record(&other).is_err());
    }

    #[test]
    fn system_settings_and_enumerator() {
        let mut data = vec![0u8; 300];
        data[12..16].copy_from_slice(&396_000f32.to_le_bytes());
        data[60..64].copy_from_slice(&21f32.to_le_bytes());
        data[136..140].copy_from_slice(&48f32.to_le_bytes());
        data[144..148].copy_from_slice(&20f32.to_le_bytes());
        let settings = SystemSettings::from_data(&data).unwrap();
        assert_eq!(settings.gain, 21.0);
        assert_eq!(settings.absorption, 48.0);
        assert_eq!(settings.spreading, 20.0);
        assert_eq!(settings.enumerator(), Some(1));

        assert_eq!(enumerator_for_frequency(100_000.0), Some(0));
        assert_eq!(enumerator_for_frequency(200_000.0), Some(0));
        assert_eq!(enumerator_for_frequency(400_000.0), None);
    }

    #[test]
    fn command_replies() {
        let mut data = vec![0u8; 24];
        data[0..4].copy_from_slice(&1008u32.to_le_bytes());
        data[20..24].copy_from_slice(&3u32.to_le_bytes());

        let nak = Record::from_chunk(&chunk(7502, &data)).unwrap();
        assert_eq!(
            CommandReply::from_record(&nak).unwrap(),
            CommandReply::Nak {
                ticket: 1008,
                error_code: 3
            }
        );
        let ack = Record::from_chunk(&chunk(7501, &data[..20])).unwrap();
        assert_eq!(
            CommandReply::from_record(&ack).unwrap(),
            CommandReply::Ack { ticket: 1008 }
        );
        let ping = Record::from_chunk(&chunk(7000, &data)).unwrap();
        assert!(CommandReply::from_record(&ping).is_err());
    }
}
