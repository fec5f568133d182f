//! Frame codec: header validation, size policy and response encoding.

use super::command::{Command, Response};
use super::constants::{DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::header::{FrameError, FrameHeader};

/// Encodes and decodes frames under a fixed maximum frame size.
///
/// A frame never exceeds `max_frame_size` bytes, so any frame fits one bulk
/// transfer. Bodies larger than one frame are split by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.max(HEADER_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Largest payload that fits one frame.
    pub fn max_payload(&self) -> usize {
        self.max_frame_size - HEADER_SIZE
    }

    /// Decode and validate a header, enforcing the payload limit.
    ///
    /// The declared length is checked before anything is allocated for it.
    pub fn decode_header(&self, data: &[u8]) -> Result<FrameHeader, FrameError> {
        let header = FrameHeader::from_bytes(data)?;
        self.check_len(header.len as usize)?;
        Ok(header)
    }

    /// Decode a complete request frame (header followed by its payload).
    pub fn decode(&self, data: &[u8]) -> Result<Command, FrameError> {
        let header = self.decode_header(data)?;
        let end = HEADER_SIZE + header.len as usize;
        if data.len() < end {
            return Err(FrameError::Truncated {
                expected: end,
                actual: data.len(),
            });
        }
        Command::parse(&header, &data[HEADER_SIZE..end])
    }

    /// Encode a response into one frame.
    pub fn encode(&self, response: &Response) -> Result<Vec<u8>, FrameError> {
        self.check_len(response.payload.len())?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + response.payload.len());
        response.header.write_to(&mut buf);
        buf.extend_from_slice(&response.payload);
        Ok(buf)
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_payload() {
            return Err(FrameError::PayloadTooLarge {
                declared: len,
                limit: self.max_payload(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{EntryRef, Opcode, Status};
    use crate::protocol::constants::*;
    use crate::protocol::header::FrameKind;

    fn request_frame(cmd: &Command) -> Vec<u8> {
        let payload = cmd.payload();
        let mut buf = Vec::new();
        FrameHeader::new(FrameKind::Request, cmd.opcode().as_u32(), payload.len() as u32)
            .write_to(&mut buf);
        buf.extend_from_slice(&payload);
        buf
    }

    #[test]
    fn test_decode_full_frame() {
        let codec = FrameCodec::default();
        let cmd = Command::ReadRange {
            entry: EntryRef::Path("a.nsp".into()),
            offset: 4,
            length: 6,
        };
        assert_eq!(codec.decode(&request_frame(&cmd)).unwrap(), cmd);
        assert_eq!(
            codec.decode(&request_frame(&Command::Exit)).unwrap(),
            Command::Exit
        );
    }

    #[test]
    fn test_payload_too_large_rejected_from_header() {
        let codec = FrameCodec::new(64);
        // Claims 4 GiB of payload but carries nothing.
        let header = FrameHeader::new(FrameKind::Request, CMD_FILE_RANGE, u32::MAX).to_bytes();
        let err = codec.decode(&header).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge {
                declared,
                limit: 48
            } if declared == u32::MAX as usize
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_truncated_payload() {
        let codec = FrameCodec::default();
        let mut frame = request_frame(&Command::GetEntryInfo { id: 1 });
        frame.truncate(frame.len() - 2);
        assert!(matches!(
            codec.decode(&frame).unwrap_err(),
            FrameError::Truncated {
                expected: 20,
                actual: 18
            }
        ));
    }

    #[test]
    fn test_encode_respects_limit() {
        let codec = FrameCodec::new(HEADER_SIZE + 8);
        let ok = codec.encode(&Response::data(0, vec![1; 8])).unwrap();
        assert_eq!(ok.len(), HEADER_SIZE + 8);
        assert!(matches!(
            codec.encode(&Response::data(1, vec![1; 9])),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_announce_has_no_payload() {
        let codec = FrameCodec::new(HEADER_SIZE);
        let bytes = codec
            .encode(&Response::announce(Opcode::ReadRange, 0xFFFF_FFFF))
            .unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let header = FrameHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.len, 0xFFFF_FFFF);
        assert_eq!(
            Response::failure(9, Status::UnsupportedCommand).status(),
            Status::UnsupportedCommand
        );
    }
}
