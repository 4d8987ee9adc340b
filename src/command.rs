//! The remote control command table.
//!
//! Nearly every command travels as a 7500 record whose data section starts with a 24 byte
//! sub-header (control id, ticket, 16 byte tracking number) followed by the command's
//! parameters. Absorption and spreading are the exceptions: they are sent as bare 7611 and
//! 7612 records holding a single float.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::record::RecordType;

/// Size of the remote control sub-header
pub const SUB_HEADER_SIZE: usize = 24;
/// Record type carrying remote control commands
pub const REMOTE_CONTROL_RECORD: u32 = 7500;
/// Length of the text field of the start command
pub const START_TEXT_SIZE: usize = 256;

/// Something that can deliver commands to the device
pub trait CommandLink {
    fn send_command(&self, command: &Command) -> Result<()>;
}

/// How a device-side subscription delivers its records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Udp = 0,
    Tcp = 1,
}

impl DeliveryKind {
    fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(DeliveryKind::Udp),
            1 => Some(DeliveryKind::Tcp),
            _ => None,
        }
    }
}

/// Every command name the device understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Range,
    PingRate,
    Power,
    Pulse,
    Gain,
    ModeType,
    GainType,
    TxWidth,
    SingleRequest,
    SelfRecordRequest,
    StopAllRequests,
    RecordRequest,
    StopRequest,
    StopSelfRecordRequest,
    SnippetWindow,
    SnippetType,
    SpecIq,
    Start,
    Stop,
    Absorption,
    Spreading,
}

impl CommandName {
    pub const ALL: [CommandName; 21] = [
        CommandName::Range,
        CommandName::PingRate,
        CommandName::Power,
        CommandName::Pulse,
        CommandName::Gain,
        CommandName::ModeType,
        CommandName::GainType,
        CommandName::TxWidth,
        CommandName::SingleRequest,
        CommandName::SelfRecordRequest,
        CommandName::StopAllRequests,
        CommandName::RecordRequest,
        CommandName::StopRequest,
        CommandName::StopSelfRecordRequest,
        CommandName::SnippetWindow,
        CommandName::SnippetType,
        CommandName::SpecIq,
        CommandName::Start,
        CommandName::Stop,
        CommandName::Absorption,
        CommandName::Spreading,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Range => "range",
            CommandName::PingRate => "pingrate",
            CommandName::Power => "power",
            CommandName::Pulse => "pulse",
            CommandName::Gain => "gain",
            CommandName::ModeType => "7kmodetype",
            CommandName::GainType => "gaintype",
            CommandName::TxWidth => "txwidth",
            CommandName::SingleRequest => "singlerequest",
            CommandName::SelfRecordRequest => "selfrecordrequest",
            CommandName::StopAllRequests => "stopallrequests",
            CommandName::RecordRequest => "recordrequest",
            CommandName::StopRequest => "stoprequest",
            CommandName::StopSelfRecordRequest => "stopselfrecordrequest",
            CommandName::SnippetWindow => "snippetwindow",
            CommandName::SnippetType => "snippettype",
            CommandName::SpecIq => "specIQ",
            CommandName::Start => "start",
            CommandName::Stop => "stop",
            CommandName::Absorption => "absorption",
            CommandName::Spreading => "spreading",
        }
    }

    /// Remote control id, `None` for the commands sent without a sub-header
    pub fn control_id(&self) -> Option<u32> {
        let id = match self {
            CommandName::Range => 1003,
            CommandName::PingRate => 1004,
            CommandName::Power => 1005,
            CommandName::Pulse => 1006,
            CommandName::Gain => 1008,
            CommandName::ModeType => 1014,
            CommandName::GainType => 1017,
            CommandName::TxWidth => 1022,
            CommandName::SingleRequest => 1050,
            CommandName::SelfRecordRequest => 1051,
            CommandName::StopAllRequests => 1052,
            CommandName::RecordRequest => 1053,
            CommandName::StopRequest => 1054,
            CommandName::StopSelfRecordRequest => 1056,
            CommandName::SnippetWindow => 1103,
            CommandName::SnippetType => 1105,
            CommandName::SpecIq => 1138,
            CommandName::Start => 1200,
            CommandName::Stop => 1201,
            CommandName::Absorption | CommandName::Spreading => return None,
        };
        Some(id)
    }
}

impl FromStr for CommandName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CommandName::ALL
            .iter()
            .find(|name| name.as_str() == s)
            .copied()
            .ok_or_else(|| Error::UnknownCommand(s.to_owned()))
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command with its typed parameters
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Range selection in meters
    Range(f32),
    /// Maximum ping rate in pings per second
    PingRate(f32),
    /// Transmit power in dB re 1 µPa
    Power(f32),
    /// Transmit pulse width in seconds
    Pulse(f32),
    /// Receiver gain in dB
    Gain(f32),
    /// 0 = beamformed, 1 = autopilot, 2 = raw I&Q
    ModeType { mode: u16, method: u16 },
    /// 0 = TVG, 1 = auto, 2 = fixed
    GainType(u32),
    TxWidth(f32, f32),
    /// Ask for a single copy of a record
    SingleRequest(RecordType),
    /// Ask the device to push records to the sending port
    SelfRecordRequest(Vec<RecordType>),
    StopAllRequests,
    /// Ask the device to push records to another host
    RecordRequest {
        ip: Ipv4Addr,
        port: u16,
        kind: DeliveryKind,
        records: Vec<RecordType>,
    },
    StopRequest {
        ip: Ipv4Addr,
        port: u16,
        kind: DeliveryKind,
    },
    StopSelfRecordRequest(Vec<RecordType>),
    SnippetWindow { control: u32, width: u32 },
    SnippetType(u32),
    /// Select which elements are sent in raw I&Q mode. No elements means all of them.
    SpecIq {
        sample_type: u16,
        first_sample: u32,
        last_sample: u32,
        elements: Vec<u16>,
    },
    /// Free text logged by the device. The field holds 255 bytes plus a terminator, so
    /// longer text is cut at the last whole character that fits. [`Command::parse`]
    /// rejects it instead.
    Start(String),
    Stop,
    /// Absorption in dB/km
    Absorption(f32),
    /// Spreading loss in dB
    Spreading(f32),
}

fn arg<T: FromStr>(command: CommandName, args: &[&str], index: usize) -> Result<T> {
    let raw = args.get(index).ok_or_else(|| Error::InvalidParameters {
        command: command.as_str(),
        reason: format!("missing argument {}", index + 1),
    })?;
    raw.parse().map_err(|_| Error::InvalidParameters {
        command: command.as_str(),
        reason: format!("could not parse {:?}", raw),
    })
}

fn records(command: CommandName, args: &[&str]) -> Result<Vec<RecordType>> {
    if args.is_empty() {
        return Err(Error::InvalidParameters {
            command: command.as_str(),
            reason: "at least one record type is required".to_owned(),
        });
    }
    (0..args.len())
        .map(|i| arg::<u32>(command, args, i).map(RecordType::from))
        .collect()
}

fn delivery(command: CommandName, args: &[&str], index: usize) -> Result<DeliveryKind> {
    let code = arg::<u16>(command, args, index)?;
    DeliveryKind::from_code(code).ok_or_else(|| Error::InvalidParameters {
        command: command.as_str(),
        reason: format!("delivery kind must be 0 (UDP) or 1 (TCP), got {}", code),
    })
}

fn push_records(buf: &mut Vec<u8>, records: &[RecordType]) {
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        buf.extend_from_slice(&record.code().to_le_bytes());
    }
}

impl Command {
    /// Build a command from its table name and textual arguments
    pub fn parse(name: &str, args: &[&str]) -> Result<Self> {
        let name: CommandName = name.parse()?;
        let cmd = match name {
            CommandName::Range => Command::Range(arg(name, args, 0)?),
            CommandName::PingRate => Command::PingRate(arg(name, args, 0)?),
            CommandName::Power => Command::Power(arg(name, args, 0)?),
            CommandName::Pulse => Command::Pulse(arg(name, args, 0)?),
            CommandName::Gain => Command::Gain(arg(name, args, 0)?),
            CommandName::ModeType => Command::ModeType {
                mode: arg(name, args, 0)?,
                method: arg(name, args, 1)?,
            },
            CommandName::GainType => Command::GainType(arg(name, args, 0)?),
            CommandName::TxWidth => Command::TxWidth(arg(name, args, 0)?, arg(name, args, 1)?),
            CommandName::SingleRequest => {
                Command::SingleRequest(RecordType::from(arg::<u32>(name, args, 0)?))
            }
            CommandName::SelfRecordRequest => Command::SelfRecordRequest(records(name, args)?),
            CommandName::StopAllRequests => Command::StopAllRequests,
            CommandName::RecordRequest => Command::RecordRequest {
                ip: arg(name, args, 0)?,
                port: arg(name, args, 1)?,
                kind: delivery(name, args, 2)?,
                records: records(name, args.get(3..).unwrap_or_default())?,
            },
            CommandName::StopRequest => Command::StopRequest {
                ip: arg(name, args, 0)?,
                port: arg(name, args, 1)?,
                kind: delivery(name, args, 2)?,
            },
            CommandName::StopSelfRecordRequest => {
                Command::StopSelfRecordRequest(records(name, args)?)
            }
            CommandName::SnippetWindow => Command::SnippetWindow {
                control: arg(name, args, 0)?,
                width: arg(name, args, 1)?,
            },
            CommandName::SnippetType => Command::SnippetType(arg(name, args, 0)?),
            CommandName::SpecIq => Command::SpecIq {
                sample_type: arg(name, args, 0)?,
                first_sample: arg(name, args, 1)?,
                last_sample: arg(name, args, 2)?,
                elements: (3..args.len())
                    .map(|i| arg(name, args, i))
                    .collect::<Result<_>>()?,
            },
            CommandName::Start => {
                let text = args.join(" ");
                if text.len() >= START_TEXT_SIZE {
                    return Err(Error::InvalidParameters {
                        command: name.as_str(),
                        reason: format!("text must be shorter than {} bytes", START_TEXT_SIZE),
                    });
                }
                Command::Start(text)
            }
            CommandName::Stop => Command::Stop,
            CommandName::Absorption => Command::Absorption(arg(name, args, 0)?),
            CommandName::Spreading => Command::Spreading(arg(name, args, 0)?),
        };
        Ok(cmd)
    }

    pub fn name(&self) -> CommandName {
        match self {
            Command::Range(_) => CommandName::Range,
            Command::PingRate(_) => CommandName::PingRate,
            Command::Power(_) => CommandName::Power,
            Command::Pulse(_) => CommandName::Pulse,
            Command::Gain(_) => CommandName::Gain,
            Command::ModeType { .. } => CommandName::ModeType,
            Command::GainType(_) => CommandName::GainType,
            Command::TxWidth(..) => CommandName::TxWidth,
            Command::SingleRequest(_) => CommandName::SingleRequest,
            Command::SelfRecordRequest(_) => CommandName::SelfRecordRequest,
            Command::StopAllRequests => CommandName::StopAllRequests,
            Command::RecordRequest { .. } => CommandName::RecordRequest,
            Command::StopRequest { .. } => CommandName::StopRequest,
            Command::StopSelfRecordRequest(_) => CommandName::StopSelfRecordRequest,
            Command::SnippetWindow { .. } => CommandName::SnippetWindow,
            Command::SnippetType(_) => CommandName::SnippetType,
            Command::SpecIq { .. } => CommandName::SpecIq,
            Command::Start(_) => CommandName::Start,
            Command::Stop => CommandName::Stop,
            Command::Absorption(_) => CommandName::Absorption,
            Command::Spreading(_) => CommandName::Spreading,
        }
    }

    /// Record type of the data record frame this command is sent in
    pub fn record_type(&self) -> u32 {
        match self {
            Command::Absorption(_) => 7611,
            Command::Spreading(_) => 7612,
            _ => REMOTE_CONTROL_RECORD,
        }
    }

    /// Record data: sub-header (when present) followed by the parameters
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUB_HEADER_SIZE + 16);
        if let Some(id) = self.name().control_id() {
            // The ticket repeats the control id, the tracking number is unused
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&[0u8; 16]);
        }
        match self {
            Command::Range(v)
            | Command::PingRate(v)
            | Command::Power(v)
            | Command::Pulse(v)
            | Command::Gain(v)
            | Command::Absorption(v)
            | Command::Spreading(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Command::ModeType { mode, method } => {
                buf.extend_from_slice(&mode.to_le_bytes());
                buf.extend_from_slice(&method.to_le_bytes());
            }
            Command::GainType(kind) => {
                buf.extend_from_slice(&kind.to_le_bytes());
                buf.extend_from_slice(&[0u8; 16]);
            }
            Command::TxWidth(a, b) => {
                buf.extend_from_slice(&a.to_le_bytes());
                buf.extend_from_slice(&b.to_le_bytes());
            }
            Command::SingleRequest(record) => buf.extend_from_slice(&record.code().to_le_bytes()),
            Command::SelfRecordRequest(records) | Command::StopSelfRecordRequest(records) => {
                push_records(&mut buf, records)
            }
            Command::StopAllRequests | Command::Stop => {}
            Command::RecordRequest {
                ip,
                port,
                kind,
                records,
            } => {
                buf.extend_from_slice(&u32::from(*ip).to_le_bytes());
                buf.extend_from_slice(&port.to_le_bytes());
                buf.extend_from_slice(&(*kind as u16).to_le_bytes());
                push_records(&mut buf, records);
            }
            Command::StopRequest { ip, port, kind } => {
                buf.extend_from_slice(&u32::from(*ip).to_le_bytes());
                buf.extend_from_slice(&port.to_le_bytes());
                buf.extend_from_slice(&(*kind as u16).to_le_bytes());
            }
            Command::SnippetWindow { control, width } => {
                buf.extend_from_slice(&control.to_le_bytes());
                buf.extend_from_slice(&width.to_le_bytes());
            }
            Command::SnippetType(kind) => buf.extend_from_slice(&kind.to_le_bytes()),
            Command::SpecIq {
                sample_type,
                first_sample,
                last_sample,
                elements,
            } => {
                buf.extend_from_slice(&sample_type.to_le_bytes());
                buf.extend_from_slice(&first_sample.to_le_bytes());
                buf.extend_from_slice(&last_sample.to_le_bytes());
                buf.extend_from_slice(&(elements.len() as u16).to_le_bytes());
                for element in elements {
                    buf.extend_from_slice(&element.to_le_bytes());
                }
            }
            Command::Start(text) => {
                buf.extend_from_slice(&0u32.to_le_bytes());
                let mut field = [0u8; START_TEXT_SIZE];
                let mut len = text.len().min(START_TEXT_SIZE - 1);
                while !text.is_char_boundary(len) {
                    len -= 1;
                }
                field[..len].copy_from_slice(&text.as_bytes()[..len]);
                buf.extend_from_slice(&field);
            }
        }
        buf
    }
}
