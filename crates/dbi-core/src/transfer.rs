//! Transfer engine: bounded-chunk reads of a catalog entry's byte range.
//!
//! A range read is lazy and single-use. Resuming after a failure is a fresh
//! call with the offset the receiver last acknowledged.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::catalog::CatalogEntry;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Range {offset}+{length} exceeds entry size {size}")]
    RangeOutOfBounds { offset: u64, length: u64, size: u64 },
    #[error("Read failed at offset {offset}: {source}")]
    SourceReadError {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("Transfer cancelled after {sent} bytes")]
    Cancelled { sent: u64 },
}

/// Bookkeeping for one in-flight range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferContext {
    pub entry_id: u32,
    pub offset: u64,
    pub length: u64,
    pub sent: u64,
}

impl TransferContext {
    pub fn remaining(&self) -> u64 {
        self.length - self.sent
    }

    /// Absolute file offset of the next byte to send.
    pub fn position(&self) -> u64 {
        self.offset + self.sent
    }
}

/// Produces range reads with a fixed transfer window.
#[derive(Debug, Clone, Copy)]
pub struct TransferEngine {
    chunk_size: usize,
}

impl TransferEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Start reading `length` bytes of `entry` at `offset`.
    ///
    /// Out-of-range requests fail before the file is touched.
    pub fn read_range(
        &self,
        entry: &CatalogEntry,
        offset: u64,
        length: u64,
        cancel: &CancelToken,
    ) -> Result<RangeChunks, TransferError> {
        let in_bounds = offset
            .checked_add(length)
            .is_some_and(|end| end <= entry.size);
        if !in_bounds {
            return Err(TransferError::RangeOutOfBounds {
                offset,
                length,
                size: entry.size,
            });
        }

        let context = TransferContext {
            entry_id: entry.id,
            offset,
            length,
            sent: 0,
        };

        let file = if length == 0 {
            None
        } else {
            let mut file = File::open(&entry.source)
                .map_err(|source| TransferError::SourceReadError { offset, source })?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|source| TransferError::SourceReadError { offset, source })?;
            Some(file)
        };

        debug!(
            entry_id = entry.id,
            offset,
            length,
            chunk_size = self.chunk_size,
            "Range read started"
        );

        Ok(RangeChunks {
            file,
            context,
            chunk_size: self.chunk_size,
            cancel: cancel.clone(),
            done: length == 0,
        })
    }
}

/// Lazy sequence of chunks for one range read.
///
/// Yields at most `chunk_size` bytes per item and exactly `length` bytes in
/// total. The first error ends the sequence.
#[derive(Debug)]
pub struct RangeChunks {
    file: Option<File>,
    context: TransferContext,
    chunk_size: usize,
    cancel: CancelToken,
    done: bool,
}

impl RangeChunks {
    pub fn context(&self) -> &TransferContext {
        &self.context
    }

    /// Number of chunks a complete read produces.
    pub fn chunk_count(&self) -> u64 {
        self.context.length.div_ceil(self.chunk_size as u64)
    }

    fn fail(&mut self, err: TransferError) -> Option<Result<Vec<u8>, TransferError>> {
        self.done = true;
        self.file = None;
        Some(Err(err))
    }
}

impl Iterator for RangeChunks {
    type Item = Result<Vec<u8>, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.context.remaining() == 0 {
            self.done = true;
            self.file = None;
            return None;
        }
        if self.cancel.is_cancelled() {
            let sent = self.context.sent;
            return self.fail(TransferError::Cancelled { sent });
        }

        let want = self.context.remaining().min(self.chunk_size as u64) as usize;
        let position = self.context.position();
        let file = self.file.as_mut()?;

        let mut buf = vec![0u8; want];
        if let Err(source) = file.read_exact(&mut buf) {
            warn!(
                entry_id = self.context.entry_id,
                offset = position,
                error = %source,
                "Source read failed"
            );
            return self.fail(TransferError::SourceReadError {
                offset: position,
                source,
            });
        }

        self.context.sent += want as u64;
        Some(Ok(buf))
    }
}
