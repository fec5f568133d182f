//! Catalog of installable package files under a root directory.
//!
//! A catalog is a frozen snapshot: identifiers are dense (`0..len`) and
//! only meaningful for the snapshot that produced them. The listing order is
//! the scan order and is what the receiver indexes by.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::protocol::{EntryInfo, EntryRef};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Root directory not found: {0}")]
    RootNotFound(PathBuf),
    #[error("Root directory not readable: {path}: {source}")]
    RootNotReadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown catalog entry: {0}")]
    UnknownIdentifier(EntryRef),
}

/// One installable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: u32,
    /// Root-relative path with `/` separators, as shown to the receiver.
    pub display_path: String,
    /// Absolute path on the host.
    pub source: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl CatalogEntry {
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id,
            size: self.size,
            modified: self
                .modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            path: self.display_path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_path: HashMap<String, u32>,
    skipped: usize,
}

impl Catalog {
    /// Scan `root` recursively for files with one of `extensions`.
    ///
    /// Symlinks are not followed. Unreadable entries are skipped and counted.
    pub fn build<S: AsRef<str>>(root: &Path, extensions: &[S]) -> Result<Self, CatalogError> {
        let meta = match std::fs::metadata(root) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::RootNotFound(root.to_path_buf()));
            }
            Err(source) => {
                return Err(CatalogError::RootNotReadable {
                    path: root.to_path_buf(),
                    source,
                });
            }
        };
        if !meta.is_dir() {
            return Err(CatalogError::RootNotFound(root.to_path_buf()));
        }
        std::fs::read_dir(root).map_err(|source| CatalogError::RootNotReadable {
            path: root.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::new();
        let mut by_path = HashMap::new();
        let mut skipped = 0usize;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        for item in walker {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    skipped += 1;
                    continue;
                }
            };
            if !item.file_type().is_file() || !has_extension(item.path(), extensions) {
                continue;
            }

            let meta = match item.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %item.path().display(), error = %e, "Skipping file without metadata");
                    skipped += 1;
                    continue;
                }
            };
            if let Err(e) = File::open(item.path()) {
                warn!(path = %item.path().display(), error = %e, "Skipping unreadable file");
                skipped += 1;
                continue;
            }

            let Some(display_path) = display_path(root, item.path()) else {
                warn!(path = %item.path().display(), "Skipping file with a non-UTF-8 name");
                skipped += 1;
                continue;
            };
            let id = entries.len() as u32;
            debug!(id, path = %display_path, size = meta.len(), "Catalog entry");

            by_path.insert(display_path.clone(), id);
            entries.push(CatalogEntry {
                id,
                display_path,
                source: item.path().to_path_buf(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(UNIX_EPOCH),
            });
        }

        info!(
            root = %root.display(),
            entries = entries.len(),
            skipped,
            "Catalog built"
        );

        Ok(Self {
            entries,
            by_path,
            skipped,
        })
    }

    /// Entries in scan order.
    pub fn list(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries skipped because they could not be read.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn lookup(&self, id: u32) -> Result<&CatalogEntry, CatalogError> {
        self.entries
            .get(id as usize)
            .ok_or(CatalogError::UnknownIdentifier(EntryRef::Id(id)))
    }

    /// Find an entry by the display path the receiver was given.
    pub fn find(&self, display_path: &str) -> Result<&CatalogEntry, CatalogError> {
        self.by_path
            .get(display_path)
            .map(|&id| &self.entries[id as usize])
            .ok_or_else(|| CatalogError::UnknownIdentifier(EntryRef::Path(display_path.into())))
    }

    pub fn resolve(&self, entry: &EntryRef) -> Result<&CatalogEntry, CatalogError> {
        match entry {
            EntryRef::Id(id) => self.lookup(*id),
            EntryRef::Path(path) => self.find(path),
        }
    }
}

fn has_extension<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|wanted| wanted.as_ref().eq_ignore_ascii_case(ext))
        })
}

/// Root-relative `/`-joined path; `None` when a component is not UTF-8.
fn display_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("/"))
}
