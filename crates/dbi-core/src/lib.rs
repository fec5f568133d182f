//! DBI-Core: host-side backend for the DBI installer's USB protocol.
//!
//! This crate serves installable package files (NSP/NSZ/XCI/XCZ) from a host
//! directory to a receiver application running on an attached console.
//! The receiver issues commands; the host answers.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: USB device link abstraction (nusb, mock)
//! - **Protocol**: Constants, frame headers, commands and the frame codec
//! - **Catalog**: Indexed snapshot of the served directory
//! - **Transfer**: Chunked byte-range reads from catalog entries
//! - **Dispatch**: Command to catalog/transfer mapping, reply construction
//! - **State**: Session lifecycle state machine
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Per-device orchestrator
//! - **Server**: Device discovery and session fan-out
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dbi_core::{CancelToken, Server, ServerConfig, TracingObserver};
//!
//! let config = ServerConfig::with_root("/path/to/games");
//! let server = Server::new(config, Arc::new(TracingObserver), CancelToken::new())
//!     .expect("bad root");
//! server.run().expect("DBI session failed");
//! ```

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use catalog::{Catalog, CatalogEntry, CatalogError};
pub use config::ServerConfig;
pub use events::{
    LogLevel, NullObserver, RecordingObserver, SessionEvent, SessionObserver, TracingObserver,
};
pub use protocol::{Command, EntryInfo, EntryRef, FrameCodec, FrameError, Opcode, Status};
pub use server::{DeviceConnector, NusbConnector, ServeOutcome, Server};
pub use session::{Session, SessionError, SessionSummary};
pub use state::{CloseReason, SessionState};
pub use transfer::{TransferEngine, TransferError};
pub use transport::{MockDevice, MockTransport, NusbTransport, TransportError, UsbTransport};
