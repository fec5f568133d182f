//! Protocol constants for the DBI USB backend protocol.
//!
//! The `DBI0` header layout and opcode numbers for `Exit`, `FileRange` and
//! `List` are fixed by the receiver application. `Handshake` and
//! `GetEntryInfo` are host extensions placed outside the receiver's range.

// ============================================================================
// Device Identification
// ============================================================================

/// Nintendo Co., Ltd Vendor ID
pub const NINTENDO_VENDOR_ID: u16 = 0x057E;

/// Product ID exposed while DBI is in "Run MTP/backend" USB mode.
pub const DBI_PRODUCT_ID: u16 = 0x3000;

/// Vendor interface carrying the bulk endpoint pair.
pub const DBI_INTERFACE: u8 = 0;

// ============================================================================
// Framing
// ============================================================================

/// Frame magic ('DBI0').
pub const FRAME_MAGIC: [u8; 4] = *b"DBI0";

/// Fixed header size: magic + kind + code + length.
pub const HEADER_SIZE: usize = 16;

/// Default transfer window (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 0x100000;

/// Default maximum frame size: one full chunk plus its header.
pub const DEFAULT_MAX_FRAME_SIZE: usize = DEFAULT_CHUNK_SIZE + HEADER_SIZE;

// ============================================================================
// Frame Kinds
// ============================================================================

pub const KIND_REQUEST: u32 = 0;
pub const KIND_RESPONSE: u32 = 1;
pub const KIND_ACK: u32 = 2;
pub const KIND_DATA: u32 = 3;
pub const KIND_FAILURE: u32 = 4;

// ============================================================================
// Opcodes
// ============================================================================

pub const CMD_EXIT: u32 = 0;
/// Pre-1.0 list command; never answered.
pub const CMD_LIST_DEPRECATED: u32 = 1;
pub const CMD_FILE_RANGE: u32 = 2;
pub const CMD_LIST: u32 = 3;
pub const CMD_HANDSHAKE: u32 = 0x10;
pub const CMD_GET_ENTRY_INFO: u32 = 0x11;

// ============================================================================
// Protocol Versions
// ============================================================================

/// Legacy receivers: no handshake, raw body bytes after the announce.
pub const PROTOCOL_V0: u32 = 0;

/// Sequenced `Data` frames and in-band mid-stream failures.
pub const PROTOCOL_V1: u32 = 1;

/// Highest version this host speaks.
pub const PROTOCOL_VERSION: u32 = PROTOCOL_V1;

/// Default installable package extensions.
pub const DEFAULT_EXTENSIONS: &[&str] = &["nsp", "nsz", "xci", "xcz"];
