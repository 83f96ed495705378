use crate::config::types::{ContainerTemplate, DaemonError, Result};
/// Daemon configuration loading from a JSON file plus command-line overrides
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/kyntrixd.sock";
pub const DEFAULT_IMAGES_DIR: &str = "/var/lib/kyntrix/images";
pub const DEFAULT_STAGING_DIR: &str = "/mnt/root";
pub const DEFAULT_INGEST_URL: &str = "http://localhost:8081/ingest/tal";
pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Pending connections the kernel queues while one request is being served.
pub const LISTEN_BACKLOG: i32 = 16;

/// A request is read with a single `read` into a buffer of this size.
pub const REQUEST_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control socket location
    pub socket_path: PathBuf,
    /// Directory holding one prebuilt root filesystem per template
    pub images_dir: PathBuf,
    /// Where the template root is bind-mounted before pivoting into it
    pub staging_dir: PathBuf,
    /// Telemetry ingest endpoint handed to every sandbox
    pub ingest_url: String,
    /// Events the in-sandbox agent buffers before sending
    pub batch_size: u32,
    /// Agent flush interval
    pub flush_interval_ms: u64,
    /// Connection handlers; 1 keeps the serial accept/handle/close loop
    pub workers: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            workers: 1,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file; missing keys keep their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: DaemonConfig = serde_json::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DaemonError::Config("batch_size must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(DaemonError::Config("workers must be at least 1".to_string()));
        }
        if self.ingest_url.is_empty() {
            return Err(DaemonError::Config("ingest_url must not be empty".to_string()));
        }
        for (name, path) in [
            ("images_dir", &self.images_dir),
            ("staging_dir", &self.staging_dir),
        ] {
            if !path.is_absolute() {
                return Err(DaemonError::Config(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    path.display()
                )));
            }
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(DaemonError::Config("socket_path must not be empty".to_string()));
        }
        Ok(())
    }

    /// Root filesystem image backing a template.
    pub fn rootfs_for(&self, template: ContainerTemplate) -> PathBuf {
        let dir = match template {
            ContainerTemplate::Node => "node-rootfs",
            ContainerTemplate::Python => "python-rootfs",
        };
        self.images_dir.join(dir)
    }
}
