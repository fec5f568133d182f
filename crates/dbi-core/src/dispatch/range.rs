//! FILE_RANGE - stream a byte range of one catalog entry.

use tracing::{info, warn};

use super::{Body, Dispatcher, Reply};
use crate::protocol::{EntryRef, Opcode, Response, Status};
use crate::transfer::TransferError;

pub fn read_range(d: &Dispatcher, entry: &EntryRef, offset: u64, length: u32) -> Reply {
    let opcode = Opcode::ReadRange.as_u32();

    let entry = match d.catalog.resolve(entry) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(error = %e, "Range request for unknown entry");
            return Reply::Frame(Response::failure(opcode, Status::UnknownIdentifier));
        }
    };

    match d.engine.read_range(entry, offset, length as u64, &d.cancel) {
        Ok(chunks) => {
            info!(
                id = entry.id,
                path = %entry.display_path,
                offset,
                length,
                chunks = chunks.chunk_count(),
                "FILE_RANGE"
            );
            Reply::Stream {
                announce: Response::announce(Opcode::ReadRange, length),
                body: Body::Range {
                    label: entry.display_path.clone(),
                    chunks,
                },
            }
        }
        Err(e) => {
            warn!(error = %e, "Range request refused");
            Reply::Frame(Response::failure(opcode, transfer_status(&e)))
        }
    }
}

/// Wire status for a transfer failure.
pub fn transfer_status(err: &TransferError) -> Status {
    match err {
        TransferError::RangeOutOfBounds { .. } => Status::RangeOutOfBounds,
        TransferError::SourceReadError { .. } | TransferError::Cancelled { .. } => {
            Status::SourceReadError
        }
    }
}
