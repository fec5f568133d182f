//! Server - waits for devices and runs isolated sessions on them.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::config::ServerConfig;
use crate::events::SessionObserver;
use crate::session::{Session, SessionError, SessionSummary};
use crate::transport::{DeviceSelector, NusbTransport, TransportError, UsbTransport};

/// Source of device handles.
pub trait DeviceConnector {
    type Transport: UsbTransport;

    /// Open the first matching device.
    fn connect(&self) -> Result<Self::Transport, TransportError>;

    /// Open every matching device.
    fn connect_all(&self) -> Result<Vec<Self::Transport>, TransportError>;
}

/// Connector for real devices on the USB bus.
#[derive(Debug, Clone, Copy)]
pub struct NusbConnector {
    selector: DeviceSelector,
}

impl NusbConnector {
    pub fn new(selector: DeviceSelector) -> Self {
        Self { selector }
    }
}

impl DeviceConnector for NusbConnector {
    type Transport = NusbTransport;

    fn connect(&self) -> Result<NusbTransport, TransportError> {
        NusbTransport::open(self.selector)
    }

    fn connect_all(&self) -> Result<Vec<NusbTransport>, TransportError> {
        NusbTransport::open_all(self.selector)
    }
}

/// Tally of a server run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeOutcome {
    pub sessions: usize,
    pub failed: usize,
    pub bytes_sent: u64,
    pub cancelled: bool,
}

impl ServeOutcome {
    fn record(&mut self, result: &Result<SessionSummary, SessionError>) {
        self.sessions += 1;
        match result {
            Ok(summary) => {
                self.bytes_sent += summary.body_bytes_sent;
                info!(
                    reason = %summary.reason,
                    commands = summary.commands_served,
                    bytes = summary.body_bytes_sent,
                    "Session finished"
                );
            }
            Err(e) => {
                self.failed += 1;
                error!(error = %e, "Session failed");
            }
        }
    }
}

pub struct Server<O: SessionObserver> {
    config: ServerConfig,
    observer: Arc<O>,
    cancel: CancelToken,
}

impl<O: SessionObserver> Server<O> {
    /// Validate the configuration and the root directory up front.
    pub fn new(config: ServerConfig, observer: Arc<O>, cancel: CancelToken) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let catalog = Catalog::build(&config.root, &config.extensions)
            .with_context(|| format!("cannot serve {}", config.root.display()))?;
        info!(
            root = %config.root.display(),
            entries = catalog.len(),
            skipped = catalog.skipped(),
            "Catalog ready"
        );
        Ok(Self {
            config,
            observer,
            cancel,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve real devices until done.
    pub fn run(&self) -> Result<ServeOutcome> {
        self.run_with(&NusbConnector::new(self.config.selector()))
    }

    /// Serve devices from `connector`.
    ///
    /// Without `keep_serving` the first round decides the result: any failed
    /// session is an error. With it, failures are logged and the server goes
    /// back to waiting until cancelled.
    pub fn run_with<C>(&self, connector: &C) -> Result<ServeOutcome>
    where
        C: DeviceConnector,
        C::Transport: Send,
    {
        let mut outcome = ServeOutcome::default();

        loop {
            let Some(transports) = self.wait_for_device(connector)? else {
                outcome.cancelled = true;
                break;
            };

            let round_failed = outcome.failed;
            let results = self.serve_round(transports);
            let mut first_error = None;
            for result in results {
                outcome.record(&result);
                if let Err(e) = result
                    && first_error.is_none()
                {
                    first_error = Some(e);
                }
            }

            if !self.config.keep_serving {
                if let Some(e) = first_error {
                    let failed = outcome.failed - round_failed;
                    return Err(anyhow::Error::new(e).context(format!(
                        "{failed} of {} session(s) failed",
                        outcome.sessions
                    )));
                }
                break;
            }
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            info!("Waiting for the next device");
        }

        Ok(outcome)
    }

    /// Run one session per transport, each on its own thread.
    fn serve_round<T>(&self, transports: Vec<T>) -> Vec<Result<SessionSummary, SessionError>>
    where
        T: UsbTransport + Send,
    {
        if transports.len() == 1 {
            return transports
                .into_iter()
                .map(|t| self.run_session(t))
                .collect();
        }

        thread::scope(|s| {
            let handles: Vec<_> = transports
                .into_iter()
                .map(|t| s.spawn(move || self.run_session(t)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(SessionError::DeviceGone("session thread panicked".into()))
                    })
                })
                .collect()
        })
    }

    fn run_session<T: UsbTransport>(&self, transport: T) -> Result<SessionSummary, SessionError> {
        Session::start_with_observer(
            transport,
            &self.config,
            Arc::clone(&self.observer),
            self.cancel.clone(),
        )?
        .run()
    }

    /// Poll for devices.
    ///
    /// Returns `None` when cancelled while waiting.
    pub fn wait_for_device<C: DeviceConnector>(
        &self,
        connector: &C,
    ) -> Result<Option<Vec<C::Transport>>> {
        info!(
            vid = %format!("{:04X}", self.config.vendor_id),
            pid = %format!("{:04X}", self.config.product_id),
            "Waiting for device..."
        );
        let start = Instant::now();
        let mut poll_count = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            poll_count += 1;

            let found = if self.config.all_devices {
                connector.connect_all()
            } else {
                connector.connect().map(|t| vec![t])
            };

            match found {
                Ok(transports) => {
                    info!(
                        devices = transports.len(),
                        "Device found after {} polls", poll_count
                    );
                    return Ok(Some(transports));
                }
                Err(TransportError::DeviceNotFound { .. }) => {}
                Err(e @ TransportError::ClaimInterfaceFailed { .. }) => {
                    warn!(error = %e, "Device busy, retrying");
                }
                Err(e) => return Err(e).context("opening device"),
            }

            if let Some(timeout) = self.config.wait_timeout()
                && start.elapsed() > timeout
            {
                bail!("Timeout waiting for device after {}s", timeout.as_secs());
            }
            thread::sleep(self.config.poll_interval());
        }
    }
}
