//! LIST - catalog listing with pagination.

use tracing::{info, warn};

use super::{Body, Dispatcher, Reply};
use crate::catalog::Catalog;
use crate::protocol::{Opcode, Response, Status};

/// Pagination cursor over a serialized listing.
///
/// The listing is rendered once per command; each page fits one frame.
#[derive(Debug, Clone)]
pub struct ListingCursor {
    bytes: Vec<u8>,
    position: usize,
    page_size: usize,
}

impl ListingCursor {
    pub fn new(catalog: &Catalog, page_size: usize) -> Self {
        let mut bytes = Vec::new();
        for entry in catalog.list() {
            bytes.extend_from_slice(entry.display_path.as_bytes());
            bytes.push(b'\n');
        }
        Self {
            bytes,
            position: 0,
            page_size: page_size.max(1),
        }
    }

    pub fn total_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn page_count(&self) -> usize {
        self.bytes.len().div_ceil(self.page_size)
    }
}

impl Iterator for ListingCursor {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.bytes.len() {
            return None;
        }
        let end = (self.position + self.page_size).min(self.bytes.len());
        let page = self.bytes[self.position..end].to_vec();
        self.position = end;
        Some(page)
    }
}

pub fn list_entries(d: &Dispatcher) -> Reply {
    let cursor = ListingCursor::new(d.catalog(), d.page_size());
    let Ok(total) = u32::try_from(cursor.total_len()) else {
        warn!(bytes = cursor.total_len(), "Listing exceeds the frame length field");
        return Reply::Frame(Response::failure(
            Opcode::ListEntries.as_u32(),
            Status::Malformed,
        ));
    };

    info!(
        entries = d.catalog().len(),
        bytes = total,
        pages = cursor.page_count(),
        "LIST: sending catalog"
    );
    Reply::Stream {
        announce: Response::announce(Opcode::ListEntries, total),
        body: Body::Listing(cursor),
    }
}
