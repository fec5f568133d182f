//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};

#[derive(Debug)]
enum Scripted {
    Data(Vec<u8>),
    Timeout,
}

#[derive(Debug)]
struct MockShared {
    /// Scripted device -> host traffic.
    reads: Mutex<VecDeque<Scripted>>,
    /// Captured host -> device writes.
    write_log: Mutex<Vec<Vec<u8>>>,
    /// Number of upcoming writes that time out.
    write_timeouts: AtomicUsize,
    claimed: AtomicBool,
    connected: AtomicBool,
    vid: u16,
    pid: u16,
}

/// A simulated device on the bus.
///
/// Handles returned by [`MockDevice::open`] share its script and write log.
/// Only one handle may hold the interface claim at a time.
#[derive(Debug, Clone)]
pub struct MockDevice {
    shared: Arc<MockShared>,
}

impl MockDevice {
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            shared: Arc::new(MockShared {
                reads: Mutex::new(VecDeque::new()),
                write_log: Mutex::new(Vec::new()),
                write_timeouts: AtomicUsize::new(0),
                claimed: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                vid,
                pid,
            }),
        }
    }

    /// Claim the device, like enumerating and opening a real one.
    pub fn open(&self) -> Result<MockTransport, TransportError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::DeviceNotFound {
                vid: self.shared.vid,
                pid: self.shared.pid,
            });
        }
        if self.shared.claimed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: "interface already claimed".into(),
            });
        }
        Ok(MockTransport {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_claimed(&self) -> bool {
        self.shared.claimed.load(Ordering::Acquire)
    }

    /// Queue bytes to be returned on a later read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.shared
            .reads
            .lock()
            .unwrap()
            .push_back(Scripted::Data(bytes.to_vec()));
    }

    /// Queue one read that times out.
    pub fn queue_timeout(&self) {
        self.shared
            .reads
            .lock()
            .unwrap()
            .push_back(Scripted::Timeout);
    }

    /// Make the next write time out without reaching the device.
    pub fn queue_write_timeout(&self) {
        self.shared.write_timeouts.fetch_add(1, Ordering::AcqRel);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.shared.write_log.lock().unwrap().clone()
    }

    /// Simulate device unplug.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new(
            crate::protocol::NINTENDO_VENDOR_ID,
            crate::protocol::DBI_PRODUCT_ID,
        )
    }
}

/// Mock transport for unit testing session logic.
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<MockShared>,
    closed: AtomicBool,
}

impl MockTransport {
    /// A transport on its own freshly claimed device.
    pub fn new() -> (Self, MockDevice) {
        let device = MockDevice::default();
        let transport = device
            .open()
            .expect("fresh mock device is never claimed");
        (transport, device)
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) || !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.shared.claimed.store(false, Ordering::Release);
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.check_link()?;
        let timed_out = self
            .shared
            .write_timeouts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if timed_out {
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        self.shared.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.check_link()?;
        let mut reads = self.shared.reads.lock().unwrap();
        match reads.pop_front() {
            Some(Scripted::Data(mut bytes)) => {
                if bytes.len() > max_len {
                    let rest = bytes.split_off(max_len);
                    reads.push_front(Scripted::Data(rest));
                }
                Ok(bytes)
            }
            Some(Scripted::Timeout) | None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.check_link().is_ok()
    }

    fn vendor_id(&self) -> u16 {
        self.shared.vid
    }

    fn product_id(&self) -> u16 {
        self.shared.pid
    }
}
