//! Protocol module - DBI frame definitions.

pub mod codec;
pub mod command;
pub mod constants;
pub mod header;

pub use codec::FrameCodec;
pub use command::{Command, EntryInfo, EntryRef, Opcode, Response, Status};
pub use constants::*;
pub use header::{FrameError, FrameHeader, FrameKind};
