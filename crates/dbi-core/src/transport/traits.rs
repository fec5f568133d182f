//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for USB communication,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Permission denied opening device: {0}")]
    PermissionDenied(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts are the only transport failure a session may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract USB transport interface.
///
/// One value is one claimed device handle. Dropping it releases the
/// interface; `close` additionally makes every later call fail and may be
/// called while another thread is blocked in `read` or `write`.
pub trait UsbTransport: Send + Sync {
    /// Write raw bytes to the OUT endpoint.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from the IN endpoint.
    ///
    /// May return fewer bytes than requested (short packet).
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Stop accepting new calls.
    ///
    /// Later `read`/`write` calls fail with [`TransportError::Disconnected`].
    /// A call already blocked on the endpoint is not interrupted; it returns
    /// once its own `timeout` elapses, so shutdown waits at most one I/O
    /// timeout.
    fn close(&self);

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
