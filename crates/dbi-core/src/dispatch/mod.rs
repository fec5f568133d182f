//! Command dispatch - maps decoded commands to catalog and transfer calls.
//!
//! This module is split into submodules by functionality:
//! - `control`: handshake, exit, entry info and unsupported commands
//! - `listing`: catalog listing and its pagination cursor
//! - `range`: byte-range transfers

mod control;
mod listing;
mod range;

pub use listing::ListingCursor;
pub(crate) use range::transfer_status;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::protocol::constants::PROTOCOL_V0;
use crate::protocol::{Command, FrameCodec, FrameError, Opcode, Response};
use crate::transfer::{RangeChunks, TransferEngine, TransferError};

/// What the session must do to answer one command.
#[derive(Debug)]
pub enum Reply {
    /// Send one frame and keep serving.
    Frame(Response),
    /// Handshake accepted at `version`.
    Negotiated { response: Response, version: u32 },
    /// Handshake refused; send the frame and end the session.
    HandshakeRejected {
        response: Response,
        device_version: u32,
    },
    /// Announce a body, wait for the device's ack, then send the body.
    Stream { announce: Response, body: Body },
    /// Send the frame and end the session normally.
    Exit(Response),
}

/// Body of a bulk reply, produced chunk by chunk.
#[derive(Debug)]
pub enum Body {
    Listing(ListingCursor),
    Range { label: String, chunks: RangeChunks },
}

impl Body {
    pub fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransferError>> {
        match self {
            Body::Listing(cursor) => cursor.next().map(Ok),
            Body::Range { chunks, .. } => chunks.next(),
        }
    }

    pub fn total_len(&self) -> u64 {
        match self {
            Body::Listing(cursor) => cursor.total_len() as u64,
            Body::Range { chunks, .. } => chunks.context().length,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Body::Listing(_) => "listing",
            Body::Range { label, .. } => label,
        }
    }
}

/// Per-session dispatcher. Owns the session's catalog snapshot.
#[derive(Debug)]
pub struct Dispatcher {
    catalog: Catalog,
    engine: TransferEngine,
    codec: FrameCodec,
    cancel: CancelToken,
    version: u32,
}

impl Dispatcher {
    /// The transfer window is clamped so one chunk always fits one frame.
    pub fn new(
        catalog: Catalog,
        chunk_size: usize,
        codec: FrameCodec,
        cancel: CancelToken,
    ) -> Self {
        Self {
            catalog,
            engine: TransferEngine::new(chunk_size.min(codec.max_payload())),
            codec,
            cancel,
            version: PROTOCOL_V0,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Settle the protocol version without a handshake (legacy receivers).
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn dispatch(&mut self, command: Command) -> Reply {
        debug!(opcode = %command.opcode(), "Dispatching command");
        match command {
            Command::Handshake { version } => control::handshake(self, version),
            Command::ListEntries => listing::list_entries(self),
            Command::GetEntryInfo { id } => control::entry_info(self, id),
            Command::ReadRange {
                entry,
                offset,
                length,
            } => range::read_range(self, &entry, offset, length),
            Command::Exit => control::exit(),
            Command::Unsupported { opcode } => control::unsupported(opcode),
        }
    }

    /// Wrap one body chunk for the wire.
    ///
    /// Version 0 receivers read the announced byte count raw; later versions
    /// get a `Data` frame carrying the chunk's sequence index.
    pub fn body_frame(&self, seq: u32, chunk: Vec<u8>) -> Result<Vec<u8>, FrameError> {
        if self.version == PROTOCOL_V0 {
            if chunk.len() > self.codec.max_frame_size() {
                return Err(FrameError::PayloadTooLarge {
                    declared: chunk.len(),
                    limit: self.codec.max_frame_size(),
                });
            }
            return Ok(chunk);
        }
        self.codec.encode(&Response::data(seq, chunk))
    }

    /// Whether a failure in the middle of a body can be reported in-band.
    pub fn can_report_mid_stream(&self) -> bool {
        self.version != PROTOCOL_V0
    }

    fn page_size(&self) -> usize {
        self.codec.max_payload()
    }
}

/// Opcode a body belongs to, for failure frames.
pub(crate) fn body_opcode(body: &Body) -> Opcode {
    match body {
        Body::Listing(_) => Opcode::ListEntries,
        Body::Range { .. } => Opcode::ReadRange,
    }
}
