//! Frame header encoding and validation.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid magic: expected {expected:?}, got {actual:02X?}")]
    BadMagic { expected: [u8; 4], actual: [u8; 4] },
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Payload too large: {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge { declared: usize, limit: usize },
    #[error("Malformed payload for opcode {opcode:#x}: {reason}")]
    Malformed { opcode: u32, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the session can keep serving after this error.
    ///
    /// Only a payload that framed correctly but did not parse is recoverable;
    /// everything else means the byte stream is out of sync.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::Malformed { .. })
    }
}

/// Frame kind field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Ack,
    Data,
    Failure,
    Other(u32),
}

impl FrameKind {
    pub fn from_u32(v: u32) -> Self {
        match v {
            KIND_REQUEST => Self::Request,
            KIND_RESPONSE => Self::Response,
            KIND_ACK => Self::Ack,
            KIND_DATA => Self::Data,
            KIND_FAILURE => Self::Failure,
            other => Self::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Request => KIND_REQUEST,
            Self::Response => KIND_RESPONSE,
            Self::Ack => KIND_ACK,
            Self::Data => KIND_DATA,
            Self::Failure => KIND_FAILURE,
            Self::Other(v) => v,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Request => write!(f, "REQUEST"),
            FrameKind::Response => write!(f, "RESPONSE"),
            FrameKind::Ack => write!(f, "ACK"),
            FrameKind::Data => write!(f, "DATA"),
            FrameKind::Failure => write!(f, "FAILURE"),
            FrameKind::Other(v) => write!(f, "KIND({v})"),
        }
    }
}

/// Fixed 16-byte frame header (little endian).
///
/// `code` is the opcode for every kind except [`FrameKind::Data`], where it
/// is the frame's sequence index within one reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub code: u32,
    pub len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn new(kind: FrameKind, code: u32, len: u32) -> Self {
        Self { kind, code, len }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&FRAME_MAGIC);
        buf[4..8].copy_from_slice(&self.kind.as_u32().to_le_bytes());
        buf[8..12].copy_from_slice(&self.code.to_le_bytes());
        buf[12..16].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bytes());
    }

    /// Parse a header without any payload-size policy.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[..4]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic {
                expected: FRAME_MAGIC,
                actual: magic,
            });
        }
        let mut cursor = Cursor::new(&data[4..HEADER_SIZE]);
        Ok(Self {
            kind: FrameKind::from_u32(cursor.read_u32::<LittleEndian>()?),
            code: cursor.read_u32::<LittleEndian>()?,
            len: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(FrameKind::Response, CMD_LIST, 0x1234);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], b"DBI0");
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[3, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[0x34, 0x12, 0, 0]);

        let mut written = Vec::new();
        header.write_to(&mut written);
        assert_eq!(written, bytes);

        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = FrameHeader::new(FrameKind::Request, CMD_EXIT, 0).to_bytes();
        bytes[0] = b'X';
        let err = FrameHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_short_header() {
        let err = FrameHeader::from_bytes(b"DBI0\0\0").unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                expected: 16,
                actual: 6
            }
        ));
    }

    #[test]
    fn test_unknown_kind_preserved() {
        let header = FrameHeader::new(FrameKind::Other(9), 0, 0);
        let parsed = FrameHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.kind, FrameKind::Other(9));
    }
}
