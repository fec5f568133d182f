//! DBI Session - drives one device from handshake to teardown.
//!
//! The session owns its transport (the device handle) and a catalog snapshot.
//! Commands are served strictly one at a time:
//! receive -> decode -> dispatch -> encode -> send.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::catalog::{Catalog, CatalogError};
use crate::config::ServerConfig;
use crate::dispatch::{Body, Dispatcher, Reply, body_opcode, transfer_status};
use crate::events::{
    LogLevel, PacketDirection, SessionEvent, SessionObserver, TracingObserver,
};
use crate::protocol::constants::{HEADER_SIZE, PROTOCOL_V0, PROTOCOL_VERSION};
use crate::protocol::{
    Command, FrameCodec, FrameError, FrameHeader, FrameKind, Opcode, Response, Status,
};
use crate::state::{CloseReason, SessionContext, SessionState};
use crate::transfer::TransferError;
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Device gone: {0}")]
    DeviceGone(String),

    #[error("Unexpected {got} frame while waiting for {expected}")]
    UnexpectedFrame { expected: FrameKind, got: FrameKind },

    #[error("{opcode} body aborted after {sent} of {total} bytes: {source}")]
    StreamAborted {
        opcode: Opcode,
        sent: u64,
        total: u64,
        #[source]
        source: TransferError,
    },

    #[error("Session cancelled")]
    Cancelled,
}

/// Result of a session that closed without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub reason: CloseReason,
    pub protocol_version: Option<u32>,
    pub commands_served: u64,
    pub body_bytes_sent: u64,
}

/// Settings a session reads from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
struct SessionLimits {
    io_timeout: Duration,
    max_timeout_retries: u32,
    max_truncated_rereads: u32,
    strict_handshake: bool,
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            io_timeout: config.io_timeout(),
            max_timeout_retries: config.max_timeout_retries,
            max_truncated_rereads: config.max_truncated_rereads,
            strict_handshake: config.strict_handshake,
        }
    }
}

enum Flow {
    Continue,
    Close(CloseReason),
}

/// One device conversation.
pub struct Session<T: UsbTransport, O: SessionObserver> {
    transport: ObservableTransport<T, O>,
    observer: Arc<O>,
    dispatcher: Dispatcher,
    codec: FrameCodec,
    limits: SessionLimits,
    ctx: SessionContext,
    cancel: CancelToken,
    body_bytes_sent: u64,
}

impl<T: UsbTransport> Session<T, TracingObserver> {
    /// Scan the configured root and create a session with the tracing observer.
    pub fn start(
        transport: T,
        config: &ServerConfig,
        cancel: CancelToken,
    ) -> Result<Self, SessionError> {
        Self::start_with_observer(transport, config, Arc::new(TracingObserver), cancel)
    }
}

impl<T: UsbTransport, O: SessionObserver> Session<T, O> {
    /// Scan the configured root and create a session.
    ///
    /// The catalog snapshot taken here is frozen for the session's lifetime.
    pub fn start_with_observer(
        transport: T,
        config: &ServerConfig,
        observer: Arc<O>,
        cancel: CancelToken,
    ) -> Result<Self, SessionError> {
        let catalog = Catalog::build(&config.root, &config.extensions)?;
        Ok(Self::new(transport, catalog, config, observer, cancel))
    }

    pub fn new(
        transport: T,
        catalog: Catalog,
        config: &ServerConfig,
        observer: Arc<O>,
        cancel: CancelToken,
    ) -> Self {
        let codec = FrameCodec::new(config.max_frame_size);
        Self {
            transport: ObservableTransport {
                inner: transport,
                observer: Arc::clone(&observer),
            },
            observer,
            dispatcher: Dispatcher::new(catalog, config.chunk_size, codec, cancel.clone()),
            codec,
            limits: SessionLimits::from(config),
            ctx: SessionContext::new(),
            cancel,
            body_bytes_sent: 0,
        }
    }

    /// Run the session to completion.
    ///
    /// The transport is closed and dropped on every path out of this call,
    /// which releases the device's interface.
    #[instrument(skip(self), fields(pid = self.transport.product_id()))]
    pub fn run(mut self) -> Result<SessionSummary, SessionError> {
        self.emit(SessionEvent::DeviceConnected {
            vid: self.transport.vendor_id(),
            pid: self.transport.product_id(),
        });
        let skipped = self.dispatcher.catalog().skipped();
        if skipped > 0 {
            self.emit(SessionEvent::Log {
                level: LogLevel::Warn,
                message: format!("{skipped} unreadable catalog entries not served"),
            });
        }
        self.transition(SessionState::Handshaking);

        let result = self.serve();

        let reason = match &result {
            Ok(reason) => reason.clone(),
            Err(SessionError::Cancelled) => CloseReason::Cancelled,
            Err(e) => CloseReason::Error(e.to_string()),
        };
        self.ctx.close(reason.clone());
        self.transition(SessionState::Closing);
        self.transport.close();
        self.transition(SessionState::Closed);
        self.emit(SessionEvent::Closed {
            reason: reason.to_string(),
        });

        match result {
            Ok(_) | Err(SessionError::Cancelled) => Ok(self.summary()),
            Err(e) => Err(e),
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            reason: self
                .ctx
                .close_reason
                .clone()
                .unwrap_or(CloseReason::Exit),
            protocol_version: self.ctx.protocol_version,
            commands_served: self.ctx.commands_served,
            body_bytes_sent: self.body_bytes_sent,
        }
    }

    fn serve(&mut self) -> Result<CloseReason, SessionError> {
        loop {
            if self.cancel.is_cancelled() {
                info!("Stop requested; closing session");
                return Ok(CloseReason::Cancelled);
            }

            let Some(header) = self.receive_header()? else {
                continue;
            };

            if header.kind != FrameKind::Request {
                warn!(kind = %header.kind, code = header.code, "Ignoring stray frame");
                continue;
            }

            let payload = self.solicit_payload(&header)?;
            let command = match Command::parse(&header, &payload) {
                Ok(command) => command,
                Err(e) if !e.is_fatal() => {
                    self.fail_command(Opcode::from_u32(header.code), Status::Malformed, &e)?;
                    if self.ctx.state == SessionState::Handshaking && self.limits.strict_handshake {
                        return Err(SessionError::HandshakeFailed(e.to_string()));
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.emit(SessionEvent::CommandReceived {
                opcode: command.opcode(),
            });

            if self.ctx.state == SessionState::Handshaking {
                self.settle_version(&command)?;
            }

            let reply = self.dispatcher.dispatch(command);
            self.ctx.commands_served += 1;

            if let Flow::Close(reason) = self.deliver(reply)? {
                return Ok(reason);
            }
        }
    }

    /// Leave `Handshaking` on the first request that is not a handshake.
    fn settle_version(&mut self, command: &Command) -> Result<(), SessionError> {
        if matches!(command, Command::Handshake { .. }) {
            return Ok(());
        }
        if self.limits.strict_handshake {
            let opcode = command.opcode();
            self.send(&Response::failure_with_detail(
                opcode.as_u32(),
                Status::HandshakeFailed,
                PROTOCOL_VERSION,
            ))?;
            return Err(SessionError::HandshakeFailed(format!(
                "expected HANDSHAKE, got {opcode}"
            )));
        }

        info!("No handshake from receiver; using legacy protocol");
        self.dispatcher.set_version(PROTOCOL_V0);
        self.ctx.protocol_version = Some(PROTOCOL_V0);
        self.transition(SessionState::Serving);
        Ok(())
    }

    fn deliver(&mut self, reply: Reply) -> Result<Flow, SessionError> {
        match reply {
            Reply::Frame(response) => {
                if response.status() != Status::Ok {
                    self.emit(SessionEvent::CommandFailed {
                        opcode: Opcode::from_u32(response.header.code),
                        status: response.status(),
                        message: "request refused".into(),
                    });
                }
                self.send(&response)?;
                Ok(Flow::Continue)
            }
            Reply::Negotiated { response, version } => {
                self.send(&response)?;
                self.ctx.protocol_version = Some(version);
                if self.ctx.state == SessionState::Handshaking {
                    self.transition(SessionState::Serving);
                }
                Ok(Flow::Continue)
            }
            Reply::HandshakeRejected {
                response,
                device_version,
            } => {
                self.send(&response)?;
                Err(SessionError::HandshakeFailed(format!(
                    "device speaks version {device_version}, host supports up to {PROTOCOL_VERSION}"
                )))
            }
            Reply::Stream { announce, body } => {
                self.send(&announce)?;
                self.await_ack(announce.header.code)?;
                self.send_body(body)?;
                Ok(Flow::Continue)
            }
            Reply::Exit(response) => {
                self.send(&response)?;
                Ok(Flow::Close(CloseReason::Exit))
            }
        }
    }

    fn send_body(&mut self, mut body: Body) -> Result<(), SessionError> {
        let opcode = body_opcode(&body);
        let total = body.total_len();
        let mut sent = 0u64;
        let mut seq = 0u32;

        while let Some(chunk) = body.next_chunk() {
            // Listing pages do not poll the token themselves.
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(TransferError::Cancelled { .. }) => return Err(SessionError::Cancelled),
                Err(e) => {
                    if self.dispatcher.can_report_mid_stream() {
                        self.fail_command(opcode, transfer_status(&e), &e)?;
                        return Ok(());
                    }
                    return Err(SessionError::StreamAborted {
                        opcode,
                        sent,
                        total,
                        source: e,
                    });
                }
            };

            let len = chunk.len() as u64;
            let frame = self.dispatcher.body_frame(seq, chunk)?;
            self.write(&frame)?;

            sent += len;
            seq = seq.wrapping_add(1);
            self.body_bytes_sent += len;
            self.emit(SessionEvent::Progress {
                opcode,
                label: body.label().to_string(),
                current: sent,
                total,
            });
        }

        debug!(opcode = %opcode, bytes = sent, frames = seq, "Body sent");
        Ok(())
    }

    fn fail_command(
        &mut self,
        opcode: Opcode,
        status: Status,
        err: &dyn std::error::Error,
    ) -> Result<(), SessionError> {
        self.emit(SessionEvent::CommandFailed {
            opcode,
            status,
            message: err.to_string(),
        });
        self.send(&Response::failure(opcode.as_u32(), status))
    }

    /// Wait for the next command header.
    ///
    /// Returns `None` when the wait timed out within the retry budget.
    fn receive_header(&mut self) -> Result<Option<FrameHeader>, SessionError> {
        let Some(bytes) = self.read_exact(HEADER_SIZE, true)? else {
            return Ok(None);
        };
        Ok(Some(self.codec.decode_header(&bytes)?))
    }

    /// DBI-style payload solicitation: ack the header, then read the payload.
    fn solicit_payload(&mut self, header: &FrameHeader) -> Result<Vec<u8>, SessionError> {
        if header.len == 0 {
            return Ok(Vec::new());
        }
        self.send(&Response::ack(header.code, header.len))?;
        let payload = self.read_exact(header.len as usize, false)?;
        Ok(payload.unwrap_or_default())
    }

    fn await_ack(&mut self, opcode: u32) -> Result<(), SessionError> {
        let bytes = self.read_exact(HEADER_SIZE, false)?.unwrap_or_default();
        let header = FrameHeader::from_bytes(&bytes)?;
        if header.kind != FrameKind::Ack {
            return Err(SessionError::UnexpectedFrame {
                expected: FrameKind::Ack,
                got: header.kind,
            });
        }
        if header.code != opcode {
            warn!(expected = opcode, got = header.code, "Ack for a different opcode");
        }
        Ok(())
    }

    /// Read exactly `len` bytes, tolerating short reads and timeouts.
    ///
    /// With `idle` set, a timeout before any byte arrived returns `None`;
    /// otherwise the read keeps waiting within the timeout budget. A frame
    /// that stays short after `max_truncated_rereads` extra reads is
    /// `Truncated`.
    fn read_exact(&mut self, len: usize, idle: bool) -> Result<Option<Vec<u8>>, SessionError> {
        let mut buf = Vec::with_capacity(len);
        let mut rereads = 0u32;

        while buf.len() < len {
            let result = self
                .transport
                .read(len - buf.len(), self.limits.io_timeout);

            let got_bytes = match result {
                Ok(bytes) if !bytes.is_empty() => {
                    self.ctx.consecutive_timeouts = 0;
                    buf.extend_from_slice(&bytes);
                    true
                }
                Ok(_) => false,
                Err(e) if e.is_transient() => false,
                Err(TransportError::Disconnected) => {
                    self.emit(SessionEvent::DeviceDisconnected);
                    return Err(SessionError::DeviceGone("device disconnected".into()));
                }
                Err(e) => return Err(e.into()),
            };

            if buf.len() >= len {
                break;
            }

            if !buf.is_empty() {
                if rereads >= self.limits.max_truncated_rereads {
                    return Err(FrameError::Truncated {
                        expected: len,
                        actual: buf.len(),
                    }
                    .into());
                }
                rereads += 1;
                debug!(have = buf.len(), want = len, rereads, "Short read, reading again");
                continue;
            }

            if got_bytes {
                continue;
            }
            self.note_timeout()?;
            if idle {
                return Ok(None);
            }
        }

        Ok(Some(buf))
    }

    fn note_timeout(&mut self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.ctx.consecutive_timeouts += 1;
        if self.ctx.consecutive_timeouts <= self.limits.max_timeout_retries {
            debug!(
                timeouts = self.ctx.consecutive_timeouts,
                "Read timed out; waiting again"
            );
            return Ok(());
        }

        let msg = format!(
            "no data after {} consecutive timeouts",
            self.ctx.consecutive_timeouts
        );
        if self.ctx.state == SessionState::Handshaking {
            return Err(SessionError::HandshakeFailed(msg));
        }
        self.emit(SessionEvent::DeviceDisconnected);
        Err(SessionError::DeviceGone(msg))
    }

    fn send(&mut self, response: &Response) -> Result<(), SessionError> {
        let bytes = self.codec.encode(response)?;
        self.write(&bytes)
    }

    /// Write timeouts are not retried: a partly written frame cannot be resent safely.
    fn write(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        match self.transport.write(bytes, self.limits.io_timeout) {
            Ok(_) => Ok(()),
            Err(TransportError::Disconnected) => {
                self.emit(SessionEvent::DeviceDisconnected);
                Err(SessionError::DeviceGone("device disconnected".into()))
            }
            Err(e @ TransportError::Timeout { .. }) => Err(SessionError::DeviceGone(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.ctx.state;
        if self.ctx.goto_state(to) {
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.observer.on_event(&event);
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<T: UsbTransport, O: SessionObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: UsbTransport, O: SessionObserver> UsbTransport for ObservableTransport<T, O> {
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let res = self.inner.write(data, timeout);
        if res.is_ok() {
            self.observer.on_event(&SessionEvent::Packet {
                direction: PacketDirection::Tx,
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read(max_len, timeout);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.observer.on_event(&SessionEvent::Packet {
                direction: PacketDirection::Rx,
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::protocol::EntryRef;
    use crate::protocol::constants::*;
    use crate::transport::{MockDevice, MockTransport};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ServerConfig) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.bin"), (0..10u8).collect::<Vec<_>>()).unwrap();
        fs::write(dir.path().join("b.bin"), b"").unwrap();

        let mut config = ServerConfig::with_root(dir.path());
        config.extensions = vec!["bin".into()];
        config.io_timeout_ms = 10;
        config.max_timeout_retries = 2;
        (dir, config)
    }

    fn request(device: &MockDevice, cmd: &Command) {
        let payload = cmd.payload();
        let header = FrameHeader::new(
            FrameKind::Request,
            cmd.opcode().as_u32(),
            payload.len() as u32,
        );
        device.queue_read(&header.to_bytes());
        if !payload.is_empty() {
            device.queue_read(&payload);
        }
    }

    fn ack(device: &MockDevice, opcode: u32) {
        device.queue_read(&FrameHeader::new(FrameKind::Ack, opcode, 0).to_bytes());
    }

    fn header(frame: &[u8]) -> FrameHeader {
        FrameHeader::from_bytes(frame).unwrap()
    }

    fn run(
        transport: MockTransport,
        config: &ServerConfig,
    ) -> Result<SessionSummary, SessionError> {
        Session::start(transport, config, CancelToken::new())
            .unwrap()
            .run()
    }

    #[test]
    fn test_legacy_listing_then_exit() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        request(&device, &Command::ListEntries);
        ack(&device, CMD_LIST);
        request(&device, &Command::Exit);

        let summary = run(transport, &config).unwrap();
        assert_eq!(summary.reason, CloseReason::Exit);
        assert_eq!(summary.protocol_version, Some(PROTOCOL_V0));
        assert_eq!(summary.commands_served, 2);
        assert_eq!(summary.body_bytes_sent, 12);

        let writes = device.get_writes();
        assert_eq!(writes.len(), 3);
        let announce = header(&writes[0]);
        assert_eq!(announce.kind, FrameKind::Response);
        assert_eq!(announce.code, CMD_LIST);
        assert_eq!(announce.len, 12);
        assert_eq!(writes[1], b"a.bin\nb.bin\n");
        assert_eq!(header(&writes[2]).code, CMD_EXIT);
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_handshake_then_chunked_range() {
        let (dir, mut config) = setup();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("big.bin"), &data).unwrap();
        config.chunk_size = 4096;
        config.max_frame_size = 4096 + HEADER_SIZE;

        let (transport, device) = MockTransport::new();
        request(
            &device,
            &Command::Handshake {
                version: PROTOCOL_V1,
            },
        );
        request(
            &device,
            &Command::ReadRange {
                entry: EntryRef::Path("big.bin".into()),
                offset: 0,
                length: 10_000,
            },
        );
        ack(&device, CMD_FILE_RANGE);
        request(&device, &Command::Exit);

        let summary = run(transport, &config).unwrap();
        assert_eq!(summary.protocol_version, Some(PROTOCOL_V1));
        assert_eq!(summary.body_bytes_sent, 10_000);

        let writes = device.get_writes();
        // ack, handshake, ack, announce, 3 data frames, exit
        assert_eq!(writes.len(), 8);
        assert_eq!(header(&writes[0]).kind, FrameKind::Ack);
        assert_eq!(&writes[1][HEADER_SIZE..], PROTOCOL_V1.to_le_bytes());
        assert_eq!(header(&writes[3]).len, 10_000);

        let mut body = Vec::new();
        for (seq, frame) in writes[4..7].iter().enumerate() {
            let h = header(frame);
            assert_eq!(h.kind, FrameKind::Data);
            assert_eq!(h.code, seq as u32);
            body.extend_from_slice(&frame[HEADER_SIZE..]);
        }
        let sizes: Vec<u32> = writes[4..7].iter().map(|f| header(f).len).collect();
        assert_eq!(sizes, [4096, 4096, 1808]);
        assert_eq!(body, data);
    }

    #[test]
    fn test_bad_magic_ends_session_and_releases_device() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        device.queue_read(b"XXXX\0\0\0\0\x03\0\0\0\0\0\0\0");

        let err = run(transport, &config).unwrap_err();
        assert!(matches!(err, SessionError::Frame(FrameError::BadMagic { .. })));
        assert!(!device.is_claimed());
        assert!(device.open().is_ok());
    }

    #[test]
    fn test_recoverable_failures_keep_serving() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        device.queue_read(&FrameHeader::new(FrameKind::Request, 0x42, 0).to_bytes());
        // Stray ack with no reply pending.
        ack(&device, CMD_LIST);
        // Range payload too short to parse.
        device.queue_read(&FrameHeader::new(FrameKind::Request, CMD_FILE_RANGE, 4).to_bytes());
        device.queue_read(&[0; 4]);
        request(&device, &Command::GetEntryInfo { id: 9 });
        request(&device, &Command::Exit);

        let summary = run(transport, &config).unwrap();
        assert_eq!(summary.reason, CloseReason::Exit);

        let failures: Vec<(u32, Status)> = device
            .get_writes()
            .iter()
            .map(|w| (header(w), w))
            .filter(|(h, _)| h.kind == FrameKind::Failure)
            .map(|(h, w)| {
                let resp = Response {
                    header: h,
                    payload: w[HEADER_SIZE..].to_vec(),
                };
                (h.code, resp.status())
            })
            .collect();
        assert_eq!(
            failures,
            [
                (0x42, Status::UnsupportedCommand),
                (CMD_FILE_RANGE, Status::Malformed),
                (CMD_GET_ENTRY_INFO, Status::UnknownIdentifier),
            ]
        );
    }

    #[test]
    fn test_split_header_is_reassembled() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        let exit = FrameHeader::new(FrameKind::Request, CMD_EXIT, 0).to_bytes();
        device.queue_read(&exit[..8]);
        device.queue_timeout();
        device.queue_read(&exit[8..]);

        assert_eq!(run(transport, &config).unwrap().reason, CloseReason::Exit);
    }

    #[test]
    fn test_truncated_header_after_rereads() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        device.queue_read(b"DBI0");

        let err = run(transport, &config).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Frame(FrameError::Truncated {
                expected: 16,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_silent_device_exhausts_timeouts() {
        let (_dir, config) = setup();
        let (transport, _device) = MockTransport::new();
        assert!(matches!(
            run(transport, &config),
            Err(SessionError::HandshakeFailed(_))
        ));

        let (transport, device) = MockTransport::new();
        request(&device, &Command::ListEntries);
        ack(&device, CMD_LIST);
        assert!(matches!(
            run(transport, &config),
            Err(SessionError::DeviceGone(_))
        ));
    }

    #[test]
    fn test_unplug_mid_session() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        let session = Session::start(transport, &config, CancelToken::new()).unwrap();
        device.disconnect();
        assert!(matches!(session.run(), Err(SessionError::DeviceGone(_))));
    }

    #[test]
    fn test_strict_handshake_rejects_legacy_receiver() {
        let (_dir, mut config) = setup();
        config.strict_handshake = true;
        let (transport, device) = MockTransport::new();
        request(&device, &Command::ListEntries);

        assert!(matches!(
            run(transport, &config),
            Err(SessionError::HandshakeFailed(_))
        ));
        let writes = device.get_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(header(&writes[0]).kind, FrameKind::Failure);
        assert_eq!(&writes[0][HEADER_SIZE + 4..], PROTOCOL_VERSION.to_le_bytes());
    }

    #[test]
    fn test_unknown_protocol_version() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        request(&device, &Command::Handshake { version: 99 });

        let err = run(transport, &config).unwrap_err();
        assert!(matches!(err, SessionError::HandshakeFailed(_)));
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_ack_must_follow_announce() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        request(&device, &Command::ListEntries);
        request(&device, &Command::Exit);

        assert!(matches!(
            run(transport, &config),
            Err(SessionError::UnexpectedFrame {
                expected: FrameKind::Ack,
                got: FrameKind::Request
            })
        ));
    }

    #[test]
    fn test_shrunk_source_legacy_aborts() {
        let (dir, config) = setup();
        let (transport, device) = MockTransport::new();
        let session = Session::start(transport, &config, CancelToken::new()).unwrap();
        fs::write(dir.path().join("a.bin"), b"abc").unwrap();

        request(
            &device,
            &Command::ReadRange {
                entry: EntryRef::Id(0),
                offset: 0,
                length: 10,
            },
        );
        ack(&device, CMD_FILE_RANGE);

        assert!(matches!(
            session.run(),
            Err(SessionError::StreamAborted {
                opcode: Opcode::ReadRange,
                sent: 0,
                total: 10,
                ..
            })
        ));
    }

    #[test]
    fn test_shrunk_source_reported_in_band() {
        let (dir, config) = setup();
        let (transport, device) = MockTransport::new();
        let session = Session::start(transport, &config, CancelToken::new()).unwrap();
        fs::write(dir.path().join("a.bin"), b"abc").unwrap();

        request(
            &device,
            &Command::Handshake {
                version: PROTOCOL_V1,
            },
        );
        request(
            &device,
            &Command::ReadRange {
                entry: EntryRef::Id(0),
                offset: 0,
                length: 10,
            },
        );
        ack(&device, CMD_FILE_RANGE);
        request(&device, &Command::Exit);

        assert_eq!(session.run().unwrap().reason, CloseReason::Exit);
        let writes = device.get_writes();
        let failure = writes
            .iter()
            .find(|w| header(w).kind == FrameKind::Failure)
            .unwrap();
        assert_eq!(header(failure).code, CMD_FILE_RANGE);
        assert_eq!(&failure[HEADER_SIZE..], Status::SourceReadError.as_u32().to_le_bytes());
    }

    #[test]
    fn test_cancelled_before_first_command() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = Session::start(transport, &config, cancel)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Cancelled);
        assert!(device.get_writes().is_empty());
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_oversized_request_is_fatal() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        device.queue_read(&FrameHeader::new(FrameKind::Request, CMD_LIST, u32::MAX).to_bytes());

        let err = run(transport, &config).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Frame(FrameError::PayloadTooLarge {
                declared: 0xFFFF_FFFF,
                ..
            })
        ));
        assert!(device.get_writes().is_empty());
        assert!(!device.is_claimed());
    }

    /// Requests a stop as soon as the first body chunk is out.
    struct StopOnProgress {
        cancel: CancelToken,
    }

    impl SessionObserver for StopOnProgress {
        fn on_event(&self, event: &SessionEvent) {
            if let SessionEvent::Progress { .. } = event {
                self.cancel.cancel();
            }
        }
    }

    #[test]
    fn test_cancel_between_body_chunks() {
        let (dir, mut config) = setup();
        fs::write(dir.path().join("c.bin"), [7u8; 100]).unwrap();
        config.chunk_size = 10;

        let (transport, device) = MockTransport::new();
        request(
            &device,
            &Command::ReadRange {
                entry: EntryRef::Path("c.bin".into()),
                offset: 0,
                length: 100,
            },
        );
        ack(&device, CMD_FILE_RANGE);

        let cancel = CancelToken::new();
        let observer = Arc::new(StopOnProgress {
            cancel: cancel.clone(),
        });
        let summary = Session::start_with_observer(transport, &config, observer, cancel)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Cancelled);
        assert_eq!(summary.body_bytes_sent, 10);

        // payload ack, announce, one raw chunk
        let sizes: Vec<usize> = device.get_writes().iter().map(Vec::len).collect();
        assert_eq!(sizes, [16, 16, 10]);
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_write_timeout_ends_session() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        request(&device, &Command::ListEntries);
        device.queue_write_timeout();

        assert!(matches!(
            run(transport, &config),
            Err(SessionError::DeviceGone(_))
        ));
        assert!(device.get_writes().is_empty());
        assert!(!device.is_claimed());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_skipped_entries_reported() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (dir, config) = setup();
        fs::write(dir.path().join(OsStr::from_bytes(b"\xff.bin")), b"x").unwrap();
        let (transport, device) = MockTransport::new();
        request(&device, &Command::Exit);
        let observer = Arc::new(RecordingObserver::new());

        Session::start_with_observer(transport, &config, Arc::clone(&observer), CancelToken::new())
            .unwrap()
            .run()
            .unwrap();

        assert!(observer.events().iter().any(|e| matches!(
            e,
            SessionEvent::Log {
                level: LogLevel::Warn,
                ..
            }
        )));
    }

    #[test]
    fn test_state_events() {
        let (_dir, config) = setup();
        let (transport, device) = MockTransport::new();
        request(&device, &Command::Exit);
        let observer = Arc::new(RecordingObserver::new());

        Session::start_with_observer(transport, &config, Arc::clone(&observer), CancelToken::new())
            .unwrap()
            .run()
            .unwrap();

        let states: Vec<SessionState> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                SessionState::Handshaking,
                SessionState::Serving,
                SessionState::Closing,
                SessionState::Closed
            ]
        );
    }
}
