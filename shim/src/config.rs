use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config location; overridable via the VMSHIM_CONFIG environment
/// variable.
const DEFAULT_CONFIG_PATH: &str = "/etc/vmshim/config.toml";

/// Shim runtime configuration: where the hypervisor and guest images live
/// and how big the VM is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor binary to spawn per VM.
    pub hypervisor_binary: PathBuf,
    /// Unix socket path for the hypervisor's API.
    pub socket_path: PathBuf,
    pub kernel_image_path: PathBuf,
    pub kernel_args: String,
    /// Block device or image file attached as the VM's root drive (drive 1).
    pub root_drive: PathBuf,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub log_fifo: Option<PathBuf>,
    pub metrics_fifo: Option<PathBuf>,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hypervisor_binary: PathBuf::from("firecracker"),
            socket_path: PathBuf::from("/run/vmshim/api.sock"),
            kernel_image_path: PathBuf::from("/var/lib/vmshim/vmlinux"),
            kernel_args: "console=ttyS0 noapic reboot=k panic=1 pci=off nomodules rw".into(),
            root_drive: PathBuf::from("/var/lib/vmshim/rootfs.img"),
            vcpu_count: 1,
            mem_size_mib: 256,
            log_fifo: None,
            metrics_fifo: None,
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from VMSHIM_CONFIG or the default path; a missing file yields
    /// the built-in defaults.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("VMSHIM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.vcpu_count >= 1, "vcpu_count must be >= 1");
        anyhow::ensure!(self.mem_size_mib >= 64, "mem_size_mib must be >= 64");
        anyhow::ensure!(
            !self.kernel_args.is_empty(),
            "kernel_args must not be empty"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.vcpu_count, 1);
        assert_eq!(config.mem_size_mib, 256);
        assert_eq!(config.socket_path, PathBuf::from("/run/vmshim/api.sock"));
        assert!(config.log_fifo.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn load_from_toml_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
hypervisor_binary = "/opt/fc/firecracker"
vcpu_count = 2
mem_size_mib = 512
log_fifo = "/run/vmshim/log.fifo"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.hypervisor_binary, PathBuf::from("/opt/fc/firecracker"));
        assert_eq!(config.vcpu_count, 2);
        assert_eq!(config.mem_size_mib, 512);
        assert_eq!(config.log_fifo, Some(PathBuf::from("/run/vmshim/log.fifo")));
        // Unset fields keep their defaults.
        assert_eq!(config.root_drive, PathBuf::from("/var/lib/vmshim/rootfs.img"));
    }

    #[test]
    fn validation_rejects_tiny_memory() {
        let mut config = Config::default();
        config.mem_size_mib = 32;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_vcpus() {
        let mut config = Config::default();
        config.vcpu_count = 0;
        assert!(config.validate().is_err());
    }
}
