//! SmartPad Protocol
//!
//! This module contains the wire definitions for talking to the tablet:
//! GATT channel UUIDs, opcodes, the command envelope, status codes and the
//! device clock format.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Command write characteristic
pub const COMMAND_WRITE_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Command notify characteristic - replies arrive here
pub const COMMAND_NOTIFY_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Bulk transfer notify characteristic - file bytes arrive here
pub const BULK_TRANSFER_CHAR_UUID: &str = "ffee0003-bbaa-9988-7766-554433221100";

/// System events characteristic (ignored)
pub const EVENTS_CHAR_UUID: &str = "3a340721-c572-11e5-86c5-0002a5d5c51b";

/// Command and reply opcodes
pub mod opcode {
    pub const AUTH_SUCCESS: u8 = 0x50;
    pub const AUTH_FAILURE: u8 = 0x51;
    pub const BUTTON_INTUOS_PRO: u8 = 0x53;

    pub const ACK: u8 = 0xB3;
    pub const SET_MODE: u8 = 0xB1;
    pub const TIME: u8 = 0xB6;
    pub const GET_FIRMWARE: u8 = 0xB7;
    pub const FIRMWARE: u8 = 0xB8;
    pub const GET_BATTERY: u8 = 0xB9;
    pub const BATTERY: u8 = 0xBA;
    pub const GET_NAME: u8 = 0xBB;
    pub const NAME: u8 = 0xBC;
    pub const CURRENT_TIME: u8 = 0xBD;

    pub const GET_FILE_COUNT: u8 = 0xC1;
    pub const FILE_COUNT: u8 = 0xC2;
    pub const DOWNLOAD_OLDEST: u8 = 0xC3;
    pub const GET_OLDEST_INFO: u8 = 0xC5;
    pub const STROKE_COUNT: u8 = 0xC7;
    pub const TRANSFER: u8 = 0xC8;
    pub const DELETE_OLDEST: u8 = 0xCA;
    pub const FILE_TIMESTAMP: u8 = 0xCD;

    pub const PRESS_BUTTON: u8 = 0xE3;
    pub const BUTTON_SLATE: u8 = 0xE4;
    pub const REGISTER_COMPLETE: u8 = 0xE5;
    pub const CONNECT: u8 = 0xE6;
    pub const PRESS_BUTTON_WITH_UUID: u8 = 0xE7;
    pub const SELECT_TRANSFER_CHANNEL: u8 = 0xEC;
}

/// Payload byte of a `0xC8` reply that opens a file transfer
pub const TRANSFER_START: u8 = 0xBE;
/// Payload byte of a `0xC8` reply that closes a file transfer
pub const TRANSFER_END: u8 = 0xED;

/// Payload for selecting the bulk transfer characteristic
pub const TRANSFER_CHANNEL_CONFIG: [u8; 6] = [0x06, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Errors raised by the protocol engine
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] crate::infrastructure::bluetooth::connection::TransportError),
    #[error("no reply to {opcodes:02x?} in time, press the device button and retry")]
    Timeout { opcodes: Vec<u8> },
    #[error("device reported {status} for opcode {opcode:#04x}")]
    DeviceStatus { opcode: u8, status: StatusCode },
    #[error("protocol desync: {0}")]
    Desync(String),
    #[error("already waiting for opcode {0:#04x}")]
    Busy(u8),
    #[error("device has no pending data or is in the wrong mode")]
    NoPendingData,
    #[error("device does not accept this UUID, register it again")]
    AuthorizationMismatch,
    #[error("device is not ready")]
    DeviceNotReady,
    #[error("device rejected the registration")]
    RegistrationRejected,
}

impl ProtocolError {
    /// Only timeouts are worth retrying without user intervention beyond a
    /// button press
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn timeout(opcodes: &[u8]) -> Self {
        Self::Timeout {
            opcodes: opcodes.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Status byte of a `0xB3` acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    GeneralError,
    InvalidState,
    ReadOnlyParam,
    CommandNotSupported,
    Unknown(u8),
}

impl From<u8> for StatusCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::GeneralError,
            0x02 => Self::InvalidState,
            0x05 => Self::ReadOnlyParam,
            0x07 => Self::CommandNotSupported,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::GeneralError => write!(f, "general error"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::ReadOnlyParam => write!(f, "read-only parameter"),
            Self::CommandNotSupported => write!(f, "command not supported"),
            Self::Unknown(code) => write!(f, "unknown status {:#04x}", code),
        }
    }
}

/// Command or reply frame: opcode, length, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(opcode: u8, payload: &[u8]) -> Self {
        Self {
            opcode,
            payload: payload.to_vec(),
        }
    }

    /// Serialize for the command write channel
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = u8::try_from(self.payload.len()).map_err(|_| {
            ProtocolError::Desync(format!("payload of {} bytes", self.payload.len()))
        })?;
        let mut bytes = Vec::with_capacity(self.payload.len() + 2);
        bytes.push(self.opcode);
        bytes.push(length);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parse a notification from the command notify channel.
    ///
    /// Bytes beyond the declared length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&opcode, rest) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::Desync("empty reply".to_string()))?;
        let (&length, rest) = rest
            .split_first()
            .ok_or_else(|| ProtocolError::Desync(format!("reply {:#04x} has no length", opcode)))?;
        let payload = rest.get(..length as usize).ok_or_else(|| {
            ProtocolError::Desync(format!(
                "reply {:#04x} declares {} bytes, has {}",
                opcode,
                length,
                rest.len()
            ))
        })?;
        Ok(Self::new(opcode, payload))
    }

    /// Payload that must hold at least `len` bytes
    pub fn payload_at_least(&self, len: usize) -> Result<&[u8]> {
        if self.payload.len() < len {
            return Err(ProtocolError::Desync(format!(
                "reply {:#04x} payload too short: {} < {}",
                self.opcode,
                self.payload.len(),
                len
            )));
        }
        Ok(&self.payload)
    }

    /// Status byte of an acknowledgement
    pub fn status(&self) -> Result<StatusCode> {
        Ok(StatusCode::from(self.payload_at_least(1)?[0]))
    }
}

/// Device operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Live,
    Paper,
    Idle,
}

impl DeviceMode {
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Live => 0x00,
            Self::Paper => 0x01,
            Self::Idle => 0x02,
        }
    }
}

/// Commands the host sends
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    Connect(&'a [u8; 6]),
    PressButton,
    PressButtonWithUuid(&'a [u8; 6]),
    RegisterComplete,
    SetMode(DeviceMode),
    SelectTransferChannel,
    SetTime(&'a [u8; 6]),
    ReadTime,
    GetFirmware(u8),
    GetBattery,
    GetName,
    GetFileCount,
    GetOldestFileInfo,
    DownloadOldestFile,
    DeleteOldestFile,
}

impl Command<'_> {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Self::Connect(uuid) => Envelope::new(opcode::CONNECT, &uuid[..]),
            Self::PressButton => Envelope::new(opcode::PRESS_BUTTON, &[0x01]),
            Self::PressButtonWithUuid(uuid) => {
                Envelope::new(opcode::PRESS_BUTTON_WITH_UUID, &uuid[..])
            }
            Self::RegisterComplete => Envelope::new(opcode::REGISTER_COMPLETE, &[0x00]),
            Self::SetMode(mode) => Envelope::new(opcode::SET_MODE, &[mode.as_byte()]),
            Self::SelectTransferChannel => {
                Envelope::new(opcode::SELECT_TRANSFER_CHANNEL, &TRANSFER_CHANNEL_CONFIG)
            }
            Self::SetTime(bcd) => Envelope::new(opcode::TIME, &bcd[..]),
            Self::ReadTime => Envelope::new(opcode::TIME, &[]),
            Self::GetFirmware(part) => Envelope::new(opcode::GET_FIRMWARE, &[*part]),
            Self::GetBattery => Envelope::new(opcode::GET_BATTERY, &[0x01]),
            Self::GetName => Envelope::new(opcode::GET_NAME, &[0x00]),
            Self::GetFileCount => Envelope::new(opcode::GET_FILE_COUNT, &[0x00]),
            Self::GetOldestFileInfo => Envelope::new(opcode::GET_OLDEST_INFO, &[0x00]),
            Self::DownloadOldestFile => Envelope::new(opcode::DOWNLOAD_OLDEST, &[0x00]),
            Self::DeleteOldestFile => Envelope::new(opcode::DELETE_OLDEST, &[0x00]),
        }
    }
}

/// Delay the device needs between back-to-back commands
pub const COMMAND_DELAY: Duration = Duration::from_millis(50);

fn to_bcd(value: u32) -> u8 {
    ((((value / 10) % 10) << 4) | (value % 10)) as u8
}

fn from_bcd(byte: u8) -> Option<u32> {
    let (hi, lo) = (byte >> 4, byte & 0x0F);
    if hi > 9 || lo > 9 {
        return None;
    }
    Some(hi as u32 * 10 + lo as u32)
}

/// Encode a time as `YYMMDDHHMMSS`, one BCD byte per field
pub fn encode_device_time(time: DateTime<Utc>) -> [u8; 6] {
    [
        to_bcd(time.year() as u32 % 100),
        to_bcd(time.month()),
        to_bcd(time.day()),
        to_bcd(time.hour()),
        to_bcd(time.minute()),
        to_bcd(time.second()),
    ]
}

/// Decode a `YYMMDDHHMMSS` BCD time into Unix seconds
pub fn decode_device_time(bytes: &[u8]) -> Option<i64> {
    let fields = bytes
        .get(..6)?
        .iter()
        .map(|&b| from_bcd(b))
        .collect::<Option<Vec<u32>>>()?;
    let date = NaiveDate::from_ymd_opt(2000 + fields[0] as i32, fields[1], fields[2])?;
    let time = date.and_hms_opt(fields[3], fields[4], fields[5])?;
    Some(time.and_utc().timestamp())
}
