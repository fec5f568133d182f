//! Server configuration.
//!
//! Everything a session needs is passed in through [`ServerConfig`]; nothing
//! is read from process-wide state.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;
use crate::transport::DeviceSelector;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory served to the receiver.
    pub root: PathBuf,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    /// Installable file extensions, matched case-insensitively. Empty serves every file.
    pub extensions: Vec<String>,
    /// Transfer window in bytes.
    pub chunk_size: usize,
    /// Upper bound on any single frame, header included.
    pub max_frame_size: usize,
    /// Timeout for every blocking USB call.
    pub io_timeout_ms: u64,
    /// Consecutive timeouts tolerated before the device is considered gone.
    pub max_timeout_retries: u32,
    /// Extra reads allowed to complete a short header or payload.
    pub max_truncated_rereads: u32,
    /// Require an explicit handshake instead of accepting legacy receivers.
    pub strict_handshake: bool,
    /// Delay between device scans while waiting.
    pub poll_interval_ms: u64,
    /// Give up waiting for a device after this long; 0 waits forever.
    pub wait_timeout_secs: u64,
    /// Serve every matching device concurrently instead of the first one.
    pub all_devices: bool,
    /// Go back to waiting after a session ends.
    pub keep_serving: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            vendor_id: NINTENDO_VENDOR_ID,
            product_id: DBI_PRODUCT_ID,
            interface: DBI_INTERFACE,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            io_timeout_ms: 5000,
            max_timeout_retries: 120,
            max_truncated_rereads: 3,
            strict_handshake: false,
            poll_interval_ms: 1000,
            wait_timeout_secs: 0,
            all_devices: false,
            keep_serving: false,
        }
    }
}

impl ServerConfig {
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the protocol cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.max_frame_size < HEADER_SIZE + 24 {
            bail!(
                "max_frame_size {} is too small to carry any response",
                self.max_frame_size
            );
        }
        if self.chunk_size + HEADER_SIZE > self.max_frame_size {
            bail!(
                "chunk_size {} does not fit a {}-byte frame",
                self.chunk_size,
                self.max_frame_size
            );
        }
        if self.chunk_size > u32::MAX as usize {
            bail!("chunk_size {} exceeds the frame length field", self.chunk_size);
        }
        if self.io_timeout_ms == 0 {
            bail!("io_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            interface: self.interface,
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        (self.wait_timeout_secs > 0).then(|| Duration::from_secs(self.wait_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, 0x100000);
        assert_eq!(config.selector().vendor_id, 0x057E);
        assert_eq!(config.selector().product_id, 0x3000);
        assert!(config.wait_timeout().is_none());
    }

    #[test]
    fn test_chunk_must_fit_frame() {
        let config = ServerConfig {
            chunk_size: 4096,
            max_frame_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            chunk_size: 4096,
            max_frame_size: 4096 + HEADER_SIZE,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dbi.toml");
        std::fs::write(&path, "root = \"/games\"\nchunk_size = 65536\n").unwrap();

        let loaded = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.root, PathBuf::from("/games"));
        assert_eq!(loaded.chunk_size, 65536);
        assert_eq!(loaded.io_timeout_ms, 5000);

        loaded.save_to_file(&path).unwrap();
        assert_eq!(ServerConfig::load_from_file(&path).unwrap(), loaded);
    }
}
