pub mod cid;
pub mod hypervisor;
pub mod vsock;

use std::path::Path;

use anyhow::Context;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vmshim_protocol::{ErrorCode, VmMount, TASK_SERVICE_PORT};

use crate::config::Config;
use crate::vm::hypervisor::{DriveConfig, Machine, MachineConfig};
use crate::vm::vsock::AgentClient;

/// Only ext4-formatted block devices can be attached as container rootfs.
const SUPPORTED_MOUNT_FS_TYPE: &str = "ext4";

/// Reasons a VM failed to come up, with the wire error code each maps to.
#[derive(Debug, Error)]
pub enum VmStartError {
    #[error("unsupported mount type '{0}', expected '{SUPPORTED_MOUNT_FS_TYPE}'")]
    UnsupportedMountType(String),

    #[error("guest agent unreachable: {0}")]
    AgentUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VmStartError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VmStartError::UnsupportedMountType(_) => ErrorCode::InvalidArgument,
            VmStartError::AgentUnavailable(_) => ErrorCode::Unavailable,
            VmStartError::Other(_) => ErrorCode::Internal,
        }
    }
}

/// A booted microVM owned by this shim process.
pub struct VmInstance {
    machine: Machine,
    pub cid: u32,
}

impl VmInstance {
    /// Tear the VMM down. Errors are reported to the caller but the child is
    /// gone either way (kill_on_drop backs this up).
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.machine.stop_vmm().await
    }
}

/// Build the VM's drive list: drive "1" is always the root drive, the
/// snapshotter-provided rootfs mounts become drives "2"..N in order.
///
/// Rejects any mount whose filesystem type is not ext4 so the error fires
/// before a hypervisor process is ever spawned.
pub fn build_drives(root_drive: &Path, rootfs: &[VmMount]) -> Result<Vec<DriveConfig>, VmStartError> {
    let mut drives = vec![DriveConfig {
        drive_id: "1".to_string(),
        path_on_host: root_drive.to_path_buf(),
        is_root_device: true,
        is_read_only: false,
    }];

    for (i, mount) in rootfs.iter().enumerate() {
        if mount.fstype != SUPPORTED_MOUNT_FS_TYPE {
            return Err(VmStartError::UnsupportedMountType(mount.fstype.clone()));
        }
        drives.push(DriveConfig {
            drive_id: (i + 2).to_string(),
            path_on_host: mount.source.clone().into(),
            is_root_device: false,
            is_read_only: false,
        });
    }

    Ok(drives)
}

/// Boot a VM for this shim: allocate a CID, spawn and start the hypervisor,
/// then dial the in-guest agent.
///
/// Cleanup runs in reverse on failure: a started-but-unreachable VM is
/// stopped before the error returns.
pub async fn start(
    config: &Config,
    rootfs: &[VmMount],
    token: &CancellationToken,
) -> Result<(VmInstance, AgentClient), VmStartError> {
    let drives = build_drives(&config.root_drive, rootfs)?;

    let cid = cid::find_available_cid(token)?;

    let machine_config = MachineConfig {
        socket_path: config.socket_path.clone(),
        kernel_image_path: config.kernel_image_path.clone(),
        kernel_args: config.kernel_args.clone(),
        vcpu_count: config.vcpu_count,
        mem_size_mib: config.mem_size_mib,
        log_fifo: config.log_fifo.clone(),
        metrics_fifo: config.metrics_fifo.clone(),
        vsock_cid: cid,
        drives,
    };

    info!(cid, vcpus = config.vcpu_count, mem_mib = config.mem_size_mib, "starting VM");

    let mut machine = Machine::new(&config.hypervisor_binary, machine_config)
        .await
        .context("spawning hypervisor")?;

    if let Err(e) = machine.start().await {
        error!(error = %e, "hypervisor start failed, tearing down");
        let _ = machine.stop_vmm().await;
        return Err(VmStartError::Other(e.context("starting hypervisor instance")));
    }

    let agent = match AgentClient::dial(cid, TASK_SERVICE_PORT, token).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(cid, error = %e, "guest agent dial failed, tearing down VM");
            let _ = machine.stop_vmm().await;
            return Err(VmStartError::AgentUnavailable(e.to_string()));
        }
    };

    info!(cid, pid = ?machine.pid(), "VM started and agent connected");

    Ok((VmInstance { machine, cid }, agent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn mount(fstype: &str, source: &str) -> VmMount {
        VmMount {
            source: source.into(),
            fstype: fstype.into(),
            options: vec![],
        }
    }

    #[test]
    fn root_drive_is_always_first() {
        let drives = build_drives(Path::new("/var/lib/vmshim/rootfs.img"), &[]).unwrap();
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].drive_id, "1");
        assert!(drives[0].is_root_device);
        assert!(!drives[0].is_read_only);
    }

    #[test]
    fn rootfs_mounts_become_drives_two_onward() {
        let drives = build_drives(
            Path::new("/root.img"),
            &[
                mount("ext4", "/dev/mapper/p0-snap-1"),
                mount("ext4", "/dev/mapper/p0-snap-2"),
            ],
        )
        .unwrap();
        assert_eq!(drives.len(), 3);
        assert_eq!(drives[1].drive_id, "2");
        assert_eq!(drives[1].path_on_host, PathBuf::from("/dev/mapper/p0-snap-1"));
        assert!(!drives[1].is_root_device);
        assert_eq!(drives[2].drive_id, "3");
    }

    #[test]
    fn non_ext4_mount_is_invalid_argument() {
        let err = build_drives(Path::new("/root.img"), &[mount("xfs", "/foo")]).unwrap_err();
        assert!(matches!(err, VmStartError::UnsupportedMountType(ref t) if t == "xfs"));
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(err.to_string().contains("expected 'ext4'"));
    }

    #[test]
    fn error_codes_map_to_wire_kinds() {
        assert_eq!(
            VmStartError::AgentUnavailable("dial failed".into()).code(),
            ErrorCode::Unavailable
        );
        assert_eq!(
            VmStartError::Other(anyhow::anyhow!("boom")).code(),
            ErrorCode::Internal
        );
    }
}
