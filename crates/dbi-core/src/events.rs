//! Event system for UI decoupling.
//!
//! Allows front-ends to subscribe to session events without
//! tight coupling to the core logic.

use std::fmt;

use crate::protocol::{Opcode, Status};
use crate::state::SessionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Device attached and claimed.
    DeviceConnected { vid: u16, pid: u16 },
    /// Device stopped responding or was unplugged.
    DeviceDisconnected,
    /// State machine transition.
    StateChanged { from: SessionState, to: SessionState },
    /// A command was decoded.
    CommandReceived { opcode: Opcode },
    /// Body bytes delivered for the current reply.
    Progress {
        opcode: Opcode,
        label: String,
        current: u64,
        total: u64,
    },
    /// A command was answered with a failure status.
    CommandFailed {
        opcode: Opcode,
        status: Status,
        message: String,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// USB Packet sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Session reached `Closed`.
    Closed { reason: String },
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait SessionObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            SessionEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            SessionEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Session state changed");
            }
            SessionEvent::CommandReceived { opcode } => {
                tracing::info!(opcode = %opcode, "Command received");
            }
            SessionEvent::Progress {
                opcode,
                label,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::debug!(opcode = %opcode, label = %label, progress = %format!("{}%", pct), "Progress");
            }
            SessionEvent::CommandFailed {
                opcode,
                status,
                message,
            } => {
                tracing::warn!(opcode = %opcode, status = %status, "Command failed: {}", message);
            }
            SessionEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            SessionEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "USB Packet");
            }
            SessionEvent::Closed { reason } => {
                tracing::info!(reason = %reason, "Session closed");
            }
        }
    }
}

/// Observer that records every event, for tests and front-ends that poll.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_event(&self, event: &SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
