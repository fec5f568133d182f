//! nusb-based USB transport implementation.

use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::traits::{TransportError, UsbTransport};

const ENDPOINT_BUFFER: usize = 0x4000;

/// Which device and interface to attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
}

/// nusb-based USB transport.
///
/// Owns the claimed interface; dropping the transport releases it.
pub struct NusbTransport {
    // Endpoints hold the interface open; keep the handle for lifetime clarity.
    _interface: Interface,
    reader: Mutex<EndpointRead<Bulk>>,
    writer: Mutex<EndpointWrite<Bulk>>,
    closed: AtomicBool,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first device matching `selector`.
    #[instrument(level = "info", fields(vid = format!("{:04X}", selector.vendor_id), pid = format!("{:04X}", selector.product_id)))]
    pub fn open(selector: DeviceSelector) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(open_error)?
            .find(|d| d.vendor_id() == selector.vendor_id && d.product_id() == selector.product_id)
            .ok_or(TransportError::DeviceNotFound {
                vid: selector.vendor_id,
                pid: selector.product_id,
            })?;

        Self::open_device_info(device_info, selector.interface)
    }

    /// Open every device matching `selector`.
    ///
    /// Devices that fail to open are logged and skipped; an empty result is
    /// reported as `DeviceNotFound`.
    pub fn open_all(selector: DeviceSelector) -> Result<Vec<Self>, TransportError> {
        let mut opened = Vec::new();
        let mut last_err = None;

        for device_info in list_devices().wait().map_err(open_error)? {
            if device_info.vendor_id() != selector.vendor_id
                || device_info.product_id() != selector.product_id
            {
                continue;
            }
            match Self::open_device_info(device_info, selector.interface) {
                Ok(t) => opened.push(t),
                Err(e) => {
                    warn!(error = %e, "Skipping device that failed to open");
                    last_err = Some(e);
                }
            }
        }

        if opened.is_empty() {
            return Err(last_err.unwrap_or(TransportError::DeviceNotFound {
                vid: selector.vendor_id,
                pid: selector.product_id,
            }));
        }
        Ok(opened)
    }

    fn open_device_info(
        device_info: nusb::DeviceInfo,
        interface_number: u8,
    ) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info.open().wait().map_err(open_error)?;

        let interface = device
            .claim_interface(interface_number)
            .wait()
            .map_err(|e| match open_error(e) {
                TransportError::PermissionDenied(message)
                | TransportError::OpenFailed(message) => TransportError::ClaimInterfaceFailed {
                    interface: interface_number,
                    message,
                },
                other => other,
            })?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == interface_number {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        let reader = interface
            .endpoint::<Bulk, In>(in_endpoint)
            .map_err(open_error)?
            .reader(ENDPOINT_BUFFER);
        let writer = interface
            .endpoint::<Bulk, Out>(out_endpoint)
            .map_err(open_error)?
            .writer(ENDPOINT_BUFFER);

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            _interface: interface,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            vid,
            pid,
        })
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

fn open_error(e: nusb::Error) -> TransportError {
    let err = std::io::Error::from(e);
    match err.kind() {
        ErrorKind::PermissionDenied => TransportError::PermissionDenied(err.to_string()),
        _ => TransportError::OpenFailed(err.to_string()),
    }
}

fn io_error(err: std::io::Error, timeout: Duration) -> TransportError {
    match err.kind() {
        ErrorKind::TimedOut => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => TransportError::Disconnected,
        _ => TransportError::Io(err),
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.check_open()?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TransportError::Disconnected)?;
        writer.set_write_timeout(timeout);

        writer
            .write_all(data)
            .map_err(|e| io_error(e, timeout))?;
        writer.flush().map_err(|e| io_error(e, timeout))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.check_open()?;
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| TransportError::Disconnected)?;
        reader.set_read_timeout(timeout);

        let mut buf = vec![0u8; max_len];
        // A zero-length packet is not an error; the session counts it like a timeout.
        let n = reader.read(&mut buf).map_err(|e| io_error(e, timeout))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(
                vid = %format!("{:04X}", self.vid),
                pid = %format!("{:04X}", self.pid),
                "Device link closed"
            );
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
