use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Thin-pool snapshotter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the snapshotter's persistent state (metadata.db).
    /// Created with mode 0755 on first start.
    pub root_path: PathBuf,
    /// Name of the device-mapper thin-pool device.
    pub pool_name: String,
    /// Block device backing the pool's data area.
    pub data_device: PathBuf,
    /// Block device backing the pool's metadata area.
    pub metadata_device: PathBuf,
    /// Thin-pool data block size in 512-byte sectors. Must be a multiple of
    /// 128 (64 KiB), the device-mapper minimum.
    pub data_block_size: u64,
    /// Size in megabytes of each new base thin device.
    pub base_image_size_mb: u64,
    /// Remove the pool device itself when the snapshotter closes. When false,
    /// close only releases in-memory handles and the pool stays active.
    pub deactivate_on_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/vmshim/snapshotter"),
            pool_name: "vmshim-pool".into(),
            data_device: PathBuf::new(),
            metadata_device: PathBuf::new(),
            data_block_size: 128,
            base_image_size_mb: 1024,
            deactivate_on_close: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(&format!("reading config {}", path.display()), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::InvalidArgument(format!("parsing config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.pool_name.is_empty() || self.pool_name.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "pool_name must be a non-empty dm device name, got {:?}",
                self.pool_name
            )));
        }
        if self.data_device.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("data_device must be set".into()));
        }
        if self.metadata_device.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("metadata_device must be set".into()));
        }
        if self.data_block_size < 128 || self.data_block_size % 128 != 0 {
            return Err(Error::InvalidArgument(format!(
                "data_block_size must be a multiple of 128 sectors, got {}",
                self.data_block_size
            )));
        }
        if self.base_image_size_mb == 0 {
            return Err(Error::InvalidArgument(
                "base_image_size_mb must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Size in bytes of each new base thin device.
    pub fn base_image_size_bytes(&self) -> u64 {
        self.base_image_size_mb * 1024 * 1024
    }
}
