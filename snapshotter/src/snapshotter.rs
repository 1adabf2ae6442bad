//! Snapshotter façade tying the metadata store and the thin-pool together.
//!
//! Every operation runs inside a metadata transaction: read-only operations
//! always roll back, writable ones commit only after the device side has
//! succeeded. Device-side partial state is reverted by the pool's own
//! rollback before the transaction is discarded.

use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::dmsetup;
use crate::error::{Error, Result};
use crate::pool::PoolDevice;
use crate::store::{Info, Kind, MetaStore, Snapshot};

const METADATA_FILE_NAME: &str = "metadata.db";
const FS_TYPE_EXT4: &str = "ext4";

/// mkfs.ext4 extended options: skip zeroing in advance, thin blocks are
/// allocated on first write anyway.
const MKFS_EXT4_OPTS: &str = "nodiscard,lazy_itable_init=0,lazy_journal_init=0";

/// A mount entry handed to the runtime. For this snapshotter the source is
/// always a formatted block device under /dev/mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub fstype: String,
    pub options: Vec<String>,
}

/// Disk usage of a snapshot. Block-level accounting is unsupported here.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub size: u64,
    pub inodes: u64,
}

pub struct Snapshotter {
    config: Config,
    store: MetaStore,
    pool: PoolDevice,
    /// First close outcome, replayed by every later close call.
    close_result: Mutex<Option<Result<()>>>,
}

impl Snapshotter {
    /// Create the snapshotter: prepare the root directory, open the metadata
    /// store, and attach the thin-pool.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&config.root_path)
            .map_err(|e| {
                Error::io(
                    &format!("creating root directory {}", config.root_path.display()),
                    e,
                )
            })?;

        let store = MetaStore::open(&config.root_path.join(METADATA_FILE_NAME)).await?;
        let pool = PoolDevice::new(&config).await?;

        Ok(Self {
            config,
            store,
            pool,
            close_result: Mutex::new(None),
        })
    }

    /// Fetch the info record for a snapshot key.
    pub async fn stat(&self, key: &str) -> Result<Info> {
        debug!(key, "stat");
        let tx = self.store.transaction(false).await?;
        let result = tx.get_info(key);
        let _ = tx.rollback();
        result
    }

    /// Update a snapshot's labels.
    pub async fn update(&self, info: &Info, fieldpaths: &[String]) -> Result<Info> {
        debug!(key = %info.name, fieldpaths = ?fieldpaths, "update");
        let mut tx = self.store.transaction(true).await?;
        match tx.update_info(info, fieldpaths) {
            Ok(updated) => {
                tx.commit().await?;
                Ok(updated)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Block-level usage accounting is not supported by this snapshotter.
    pub async fn usage(&self, key: &str) -> Result<Usage> {
        debug!(key, "usage");
        Err(Error::NotImplemented("usage".into()))
    }

    /// Return the mount for a snapshot's device. The record fetch drives the
    /// result; the read transaction's outcome past that point does not.
    pub async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        debug!(key, "mounts");
        let tx = self.store.transaction(false).await?;
        let snap = tx.get_snapshot(key)?;
        let _ = tx.rollback();
        Ok(self.build_mounts(&snap))
    }

    /// Create a writable snapshot under `key`, optionally from `parent`.
    pub async fn prepare(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        debug!(key, parent, "prepare");
        self.create_snapshot(Kind::Active, key, parent, labels).await
    }

    /// Create a read-only snapshot under `key` from `parent`.
    pub async fn view(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        debug!(key, parent, "view");
        self.create_snapshot(Kind::View, key, parent, labels).await
    }

    /// Commit an Active snapshot under its new name. The device keeps its
    /// id-derived name, so nothing moves on the pool side.
    pub async fn commit(
        &self,
        name: &str,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        debug!(name, key, "commit");
        let mut tx = self.store.transaction(true).await?;
        match tx.commit_active(key, name, labels) {
            Ok(_) => tx.commit().await,
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Remove a snapshot and its device. A device-side failure rolls the
    /// metadata deletion back so the record and device stay paired.
    pub async fn remove(&self, key: &str) -> Result<()> {
        debug!(key, "remove");
        let mut tx = self.store.transaction(true).await?;
        let (snapshot_id, _info) = match tx.remove(key) {
            Ok(removed) => removed,
            Err(e) => {
                let _ = tx.rollback();
                return Err(e);
            }
        };

        let device_name = self.device_name(&snapshot_id);
        if let Err(e) = self.pool.remove_device(&device_name, true).await {
            warn!(key, device = %device_name, error = %e, "device removal failed, keeping metadata");
            let _ = tx.rollback();
            return Err(e);
        }

        tx.commit().await
    }

    /// Visit every snapshot record.
    pub async fn walk<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&Info) -> Result<()>,
    {
        debug!("walk");
        let tx = self.store.transaction(false).await?;
        let result = tx.walk_info(f);
        let _ = tx.rollback();
        result
    }

    /// Close the metadata store and the pool. Idempotent: cleanup runs once
    /// and every call returns the first aggregated outcome.
    pub async fn close(&self) -> Result<()> {
        let mut cached = self.close_result.lock().await;
        if let Some(result) = cached.as_ref() {
            return result.clone();
        }

        let mut errors: Vec<Error> = Vec::new();
        if let Err(e) = self.store.close() {
            errors.push(e);
        }
        if let Err(e) = self.pool.close(self.config.deactivate_on_close).await {
            errors.push(e);
        }

        let result = match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Internal(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        };
        *cached = Some(result.clone());
        result
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        let mut tx = self.store.transaction(true).await?;
        let snap = match tx.create_snapshot(kind, key, parent, labels) {
            Ok(snap) => snap,
            Err(e) => {
                let _ = tx.rollback();
                return Err(e);
            }
        };

        let device_name = self.device_name(&snap.id);
        let size = self.config.base_image_size_bytes();

        let device_result = if snap.parent_ids.is_empty() {
            debug!(device = %device_name, "creating new thin device");
            match self.pool.create_thin_device(&device_name, size).await {
                Ok(()) => match self.mkfs(&device_name).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // The thin device exists but carries no filesystem;
                        // drop it so the key can be replayed.
                        if let Err(re) = self.pool.remove_device(&device_name, false).await {
                            warn!(device = %device_name, error = %re, "failed to drop unformatted device");
                        }
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            }
        } else {
            let parent_device = self.device_name(&snap.parent_ids[0]);
            debug!(device = %device_name, parent = %parent_device, "creating snapshot device");
            self.pool
                .create_snapshot_device(&parent_device, &device_name, size)
                .await
        };

        if let Err(e) = device_result {
            let _ = tx.rollback();
            return Err(e);
        }

        tx.commit().await?;

        // Container images do not expect ext4's lost+found in their root.
        self.scrub_lost_found(&device_name).await;

        Ok(self.build_mounts(&snap))
    }

    async fn mkfs(&self, device_name: &str) -> Result<()> {
        let device_path = dmsetup::device_path(device_name);
        debug!(device = %device_path.display(), "mkfs.ext4");

        let output = Command::new("mkfs.ext4")
            .arg("-E")
            .arg(MKFS_EXT4_OPTS)
            .arg(&device_path)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("failed to execute mkfs.ext4: {}", e)))?;

        if !output.status.success() {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(Error::Internal(format!(
                "mkfs.ext4 failed on {}: {}",
                device_path.display(),
                combined.trim()
            )));
        }
        Ok(())
    }

    /// Best effort: mount the freshly formatted device on a scratch dir and
    /// delete `lost+found`. Failures are logged and ignored.
    async fn scrub_lost_found(&self, device_name: &str) {
        let device_path = dmsetup::device_path(device_name);
        let mount_dir = self.config.root_path.join("tmp").join(device_name);

        if let Err(e) = tokio::fs::create_dir_all(&mount_dir).await {
            debug!(device = device_name, error = %e, "skipping lost+found cleanup");
            return;
        }

        let mounted = Command::new("mount")
            .arg(&device_path)
            .arg(&mount_dir)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false);
        if mounted {
            if let Err(e) = tokio::fs::remove_dir_all(mount_dir.join("lost+found")).await {
                debug!(device = device_name, error = %e, "lost+found not removed");
            }
            if let Ok(out) = Command::new("umount").arg(&mount_dir).output().await {
                if !out.status.success() {
                    warn!(device = device_name, "failed to unmount scratch dir");
                }
            }
        } else {
            debug!(device = device_name, "transient mount failed, leaving lost+found");
        }

        let _ = tokio::fs::remove_dir(&mount_dir).await;
    }

    fn device_name(&self, snapshot_id: &str) -> String {
        snapshot_device_name(&self.config.pool_name, snapshot_id)
    }

    fn build_mounts(&self, snap: &Snapshot) -> Vec<Mount> {
        build_device_mounts(&self.device_name(&snap.id), snap.kind)
    }
}

/// Canonical device name for a snapshot id. The pool name prefix avoids
/// collisions with devices from other pools.
pub fn snapshot_device_name(pool_name: &str, snapshot_id: &str) -> String {
    format!("{}-snap-{}", pool_name, snapshot_id)
}

/// Build the single ext4 mount entry for a snapshot's device. Everything but
/// a writable Active snapshot mounts read-only.
fn build_device_mounts(device_name: &str, kind: Kind) -> Vec<Mount> {
    let mut options = Vec::new();
    if kind != Kind::Active {
        options.push("ro".to_string());
    }

    vec![Mount {
        source: dmsetup::device_path(device_name).display().to_string(),
        fstype: FS_TYPE_EXT4.to_string(),
        options,
    }]
}

/// Metadata file location for a snapshotter root, exposed for diagnostics.
pub fn metadata_path(root: &Path) -> PathBuf {
    root.join(METADATA_FILE_NAME)
}
