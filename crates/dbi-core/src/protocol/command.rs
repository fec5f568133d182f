//! Typed commands (device -> host) and responses (host -> device).

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

use super::constants::*;
use super::header::{FrameError, FrameHeader, FrameKind};

/// Request opcodes understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake,
    ListEntries,
    GetEntryInfo,
    ReadRange,
    Exit,
    Unknown(u32),
}

impl Opcode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            CMD_HANDSHAKE => Self::Handshake,
            CMD_LIST => Self::ListEntries,
            CMD_GET_ENTRY_INFO => Self::GetEntryInfo,
            CMD_FILE_RANGE => Self::ReadRange,
            CMD_EXIT => Self::Exit,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Handshake => CMD_HANDSHAKE,
            Self::ListEntries => CMD_LIST,
            Self::GetEntryInfo => CMD_GET_ENTRY_INFO,
            Self::ReadRange => CMD_FILE_RANGE,
            Self::Exit => CMD_EXIT,
            Self::Unknown(v) => v,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Handshake => write!(f, "HANDSHAKE"),
            Opcode::ListEntries => write!(f, "LIST"),
            Opcode::GetEntryInfo => write!(f, "ENTRY_INFO"),
            Opcode::ReadRange => write!(f, "FILE_RANGE"),
            Opcode::Exit => write!(f, "EXIT"),
            Opcode::Unknown(v) => write!(f, "UNKNOWN({v:#x})"),
        }
    }
}

/// How a range request names its catalog entry.
///
/// DBI addresses files by the name it received in the listing; extended
/// clients may use the dense identifier instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    Id(u32),
    Path(String),
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryRef::Id(id) => write!(f, "#{id}"),
            EntryRef::Path(path) => write!(f, "{path}"),
        }
    }
}

/// A decoded device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Handshake {
        version: u32,
    },
    ListEntries,
    GetEntryInfo {
        id: u32,
    },
    ReadRange {
        entry: EntryRef,
        offset: u64,
        length: u32,
    },
    Exit,
    Unsupported {
        opcode: u32,
    },
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Handshake { .. } => Opcode::Handshake,
            Command::ListEntries => Opcode::ListEntries,
            Command::GetEntryInfo { .. } => Opcode::GetEntryInfo,
            Command::ReadRange { .. } => Opcode::ReadRange,
            Command::Exit => Opcode::Exit,
            Command::Unsupported { opcode } => Opcode::Unknown(*opcode),
        }
    }

    /// Parse a request payload for the opcode carried in `header`.
    pub fn parse(header: &FrameHeader, payload: &[u8]) -> Result<Self, FrameError> {
        let opcode = header.code;
        let malformed = |reason: &str| FrameError::Malformed {
            opcode,
            reason: reason.to_string(),
        };

        match Opcode::from_u32(opcode) {
            Opcode::Handshake => {
                if payload.len() < 4 {
                    return Err(malformed("missing protocol version"));
                }
                let version = Cursor::new(payload).read_u32::<LittleEndian>()?;
                Ok(Command::Handshake { version })
            }
            Opcode::ListEntries => Ok(Command::ListEntries),
            Opcode::GetEntryInfo => {
                if payload.len() < 4 {
                    return Err(malformed("missing entry identifier"));
                }
                let id = Cursor::new(payload).read_u32::<LittleEndian>()?;
                Ok(Command::GetEntryInfo { id })
            }
            Opcode::ReadRange => {
                if payload.len() < 16 {
                    return Err(malformed("range header shorter than 16 bytes"));
                }
                let mut cursor = Cursor::new(payload);
                let length = cursor.read_u32::<LittleEndian>()?;
                let offset = cursor.read_u64::<LittleEndian>()?;
                let name_len = cursor.read_u32::<LittleEndian>()? as usize;

                let entry = if name_len == 0 {
                    if payload.len() < 20 {
                        return Err(malformed("missing entry identifier"));
                    }
                    EntryRef::Id(cursor.read_u32::<LittleEndian>()?)
                } else {
                    if payload.len() - 16 < name_len {
                        return Err(malformed("name shorter than declared"));
                    }
                    let mut name = vec![0u8; name_len];
                    cursor.read_exact(&mut name)?;
                    let name =
                        String::from_utf8(name).map_err(|_| malformed("name is not UTF-8"))?;
                    EntryRef::Path(name)
                };

                Ok(Command::ReadRange {
                    entry,
                    offset,
                    length,
                })
            }
            Opcode::Exit => Ok(Command::Exit),
            Opcode::Unknown(opcode) => Ok(Command::Unsupported { opcode }),
        }
    }

    /// Encode this command's request payload (the counter-party's side).
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Command::Handshake { version } => {
                buf.extend_from_slice(&version.to_le_bytes());
            }
            Command::GetEntryInfo { id } => {
                buf.extend_from_slice(&id.to_le_bytes());
            }
            Command::ReadRange {
                entry,
                offset,
                length,
            } => {
                buf.extend_from_slice(&length.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                match entry {
                    EntryRef::Id(id) => {
                        buf.extend_from_slice(&0u32.to_le_bytes());
                        buf.extend_from_slice(&id.to_le_bytes());
                    }
                    EntryRef::Path(path) => {
                        buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
                        buf.extend_from_slice(path.as_bytes());
                    }
                }
            }
            Command::ListEntries | Command::Exit | Command::Unsupported { .. } => {}
        }
        buf
    }
}

/// Typed status carried by failure frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    UnsupportedCommand,
    UnknownIdentifier,
    RangeOutOfBounds,
    SourceReadError,
    HandshakeFailed,
    Malformed,
    Other(u32),
}

impl Status {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::UnsupportedCommand,
            2 => Self::UnknownIdentifier,
            3 => Self::RangeOutOfBounds,
            4 => Self::SourceReadError,
            5 => Self::HandshakeFailed,
            6 => Self::Malformed,
            other => Self::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::UnsupportedCommand => 1,
            Self::UnknownIdentifier => 2,
            Self::RangeOutOfBounds => 3,
            Self::SourceReadError => 4,
            Self::HandshakeFailed => 5,
            Self::Malformed => 6,
            Self::Other(v) => v,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::UnsupportedCommand => write!(f, "UNSUPPORTED_COMMAND"),
            Status::UnknownIdentifier => write!(f, "UNKNOWN_IDENTIFIER"),
            Status::RangeOutOfBounds => write!(f, "RANGE_OUT_OF_BOUNDS"),
            Status::SourceReadError => write!(f, "SOURCE_READ_ERROR"),
            Status::HandshakeFailed => write!(f, "HANDSHAKE_FAILED"),
            Status::Malformed => write!(f, "MALFORMED"),
            Status::Other(v) => write!(f, "STATUS({v})"),
        }
    }
}

/// Entry metadata as carried by an `ENTRY_INFO` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: u32,
    pub size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub modified: u64,
    pub path: String,
}

impl EntryInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.path.len());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.modified.to_le_bytes());
        buf.extend_from_slice(&(self.path.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        let malformed = |reason: &str| FrameError::Malformed {
            opcode: CMD_GET_ENTRY_INFO,
            reason: reason.to_string(),
        };
        if data.len() < 24 {
            return Err(malformed("entry info shorter than 24 bytes"));
        }
        let mut cursor = Cursor::new(data);
        let id = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let modified = cursor.read_u64::<LittleEndian>()?;
        let path_len = cursor.read_u32::<LittleEndian>()? as usize;
        let path = data
            .get(24..24 + path_len)
            .ok_or_else(|| malformed("path shorter than declared"))?;
        let path = String::from_utf8(path.to_vec()).map_err(|_| malformed("path is not UTF-8"))?;
        Ok(Self {
            id,
            size,
            modified,
            path,
        })
    }
}

/// An outbound frame built by the dispatcher or session.
///
/// For announce frames (`RESPONSE` of a bulk reply) the header length is the
/// size of the body that follows after the device's ack, and the payload is
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Response {
    fn with_payload(kind: FrameKind, code: u32, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader::new(kind, code, payload.len() as u32),
            payload,
        }
    }

    pub fn handshake(version: u32) -> Self {
        Self::with_payload(
            FrameKind::Response,
            CMD_HANDSHAKE,
            version.to_le_bytes().to_vec(),
        )
    }

    /// Announce a body of `len` bytes that follows once the device acks.
    pub fn announce(opcode: Opcode, len: u32) -> Self {
        Self {
            header: FrameHeader::new(FrameKind::Response, opcode.as_u32(), len),
            payload: Vec::new(),
        }
    }

    /// Solicit a request payload of `len` bytes from the device.
    pub fn ack(opcode: u32, len: u32) -> Self {
        Self {
            header: FrameHeader::new(FrameKind::Ack, opcode, len),
            payload: Vec::new(),
        }
    }

    pub fn entry_info(info: &EntryInfo) -> Self {
        Self::with_payload(FrameKind::Response, CMD_GET_ENTRY_INFO, info.to_bytes())
    }

    pub fn exit() -> Self {
        Self::with_payload(FrameKind::Response, CMD_EXIT, Vec::new())
    }

    pub fn failure(opcode: u32, status: Status) -> Self {
        Self::with_payload(
            FrameKind::Failure,
            opcode,
            status.as_u32().to_le_bytes().to_vec(),
        )
    }

    /// Failure carrying one extra detail word (e.g. the host's protocol version).
    pub fn failure_with_detail(opcode: u32, status: Status, detail: u32) -> Self {
        let mut payload = status.as_u32().to_le_bytes().to_vec();
        payload.extend_from_slice(&detail.to_le_bytes());
        Self::with_payload(FrameKind::Failure, opcode, payload)
    }

    pub fn data(seq: u32, bytes: Vec<u8>) -> Self {
        Self::with_payload(FrameKind::Data, seq, bytes)
    }

    pub fn status(&self) -> Status {
        if self.header.kind != FrameKind::Failure {
            return Status::Ok;
        }
        match self.payload.get(..4) {
            Some(b) => Status::from_u32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            None => Status::Other(u32::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(opcode: u32, payload: &[u8]) -> FrameHeader {
        FrameHeader::new(FrameKind::Request, opcode, payload.len() as u32)
    }

    #[test]
    fn test_parse_dbi_file_range() {
        // Layout sent by the receiver: size, offset, name_len, name.
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x1000u32.to_le_bytes());
        payload.extend_from_slice(&0x2_0000_0000u64.to_le_bytes());
        payload.extend_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(b"game.nsp");

        let cmd = Command::parse(&request(CMD_FILE_RANGE, &payload), &payload).unwrap();
        assert_eq!(
            cmd,
            Command::ReadRange {
                entry: EntryRef::Path("game.nsp".into()),
                offset: 0x2_0000_0000,
                length: 0x1000,
            }
        );
        assert_eq!(cmd.payload(), payload);
    }

    #[test]
    fn test_read_range_by_id() {
        let cmd = Command::ReadRange {
            entry: EntryRef::Id(7),
            offset: 12,
            length: 34,
        };
        let payload = cmd.payload();
        assert_eq!(payload.len(), 20);
        let parsed = Command::parse(&request(CMD_FILE_RANGE, &payload), &payload).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_short_range_payload_is_malformed() {
        let payload = [0u8; 10];
        let err = Command::parse(&request(CMD_FILE_RANGE, &payload), &payload).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { opcode: 2, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_declared_name_longer_than_payload() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(&50u32.to_le_bytes());
        payload.extend_from_slice(b"short");
        let err = Command::parse(&request(CMD_FILE_RANGE, &payload), &payload).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn test_deprecated_list_is_unsupported() {
        let cmd = Command::parse(&request(CMD_LIST_DEPRECATED, &[]), &[]).unwrap();
        assert_eq!(cmd, Command::Unsupported { opcode: 1 });
        assert_eq!(cmd.opcode(), Opcode::Unknown(1));
    }

    #[test]
    fn test_failure_status() {
        let resp = Response::failure(CMD_FILE_RANGE, Status::RangeOutOfBounds);
        assert_eq!(resp.header.kind, FrameKind::Failure);
        assert_eq!(resp.header.len, 4);
        assert_eq!(resp.status(), Status::RangeOutOfBounds);
        assert_eq!(Response::exit().status(), Status::Ok);
    }

    #[test]
    fn test_entry_info_layout() {
        let info = EntryInfo {
            id: 3,
            size: 10,
            modified: 1_700_000_000,
            path: "dir/a.nsp".into(),
        };
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), 24 + 9);
        assert_eq!(&bytes[..4], &[3, 0, 0, 0]);
        assert_eq!(&bytes[4..12], &10u64.to_le_bytes());
        assert_eq!(&bytes[20..24], &[9, 0, 0, 0]);
        assert_eq!(&bytes[24..], b"dir/a.nsp");
        assert_eq!(EntryInfo::from_bytes(&bytes).unwrap(), info);
    }
}
