//! Thin-pool device controller.
//!
//! Owns the dm thin-pool and every thin device carved out of it. Pool
//! messages (`create_thin`, `create_snap`, `delete`) are serialized behind a
//! single mutex because the pool's message channel is not concurrent-safe;
//! operations on distinct devices otherwise proceed in parallel, serialized
//! per device name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::dmsetup::{self, SECTOR_SIZE};
use crate::error::{Error, Result};

/// Bound on thin-device-id allocation retries when ids collide with entries
/// already present in pool metadata.
const MAX_DEVICE_ID_ATTEMPTS: u32 = 100;

/// Lifecycle state of a thin device. Transitions are monotonic within a
/// single operation; `Faulty` is terminal and requires operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Creating,
    Created,
    Activating,
    Activated,
    Suspended,
    Deactivating,
    Deactivated,
    Removing,
    Removed,
    Faulty,
}

/// In-memory record of a thin device known to the pool.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    /// Thin device id inside the pool's metadata.
    pub id: u32,
    /// Thin id of the parent device for snapshots.
    pub parent_id: Option<u32>,
    pub size: u64,
    pub state: DeviceState,
}

/// Controller for a dm thin-pool and its thin devices.
pub struct PoolDevice {
    pool_name: String,
    devices: Mutex<HashMap<String, DeviceInfo>>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    message_lock: Mutex<()>,
    next_device_id: AtomicU32,
}

impl PoolDevice {
    /// Attach to (or create) the thin-pool described by `config`.
    ///
    /// If a pool with the same name is already active, its live table is
    /// compared against the expected one: a match reattaches, a mismatch
    /// fails with `AlreadyExists`.
    pub async fn new(config: &Config) -> Result<Self> {
        dmsetup::version()
            .await
            .map_err(|e| Error::Unavailable(format!("device-mapper is not usable: {}", e)))?;

        let data_size = dmsetup::block_device_size(&config.data_device).await?;
        let expected = dmsetup::thin_pool_table(
            &config.metadata_device,
            &config.data_device,
            data_size / SECTOR_SIZE,
            config.data_block_size,
        );

        if dmsetup::device_exists(&config.pool_name).await {
            let current = dmsetup::table(&config.pool_name).await?;
            if !pool_tables_match(&current, &expected) {
                return Err(Error::AlreadyExists(format!(
                    "pool {} is active with different parameters",
                    config.pool_name
                )));
            }
            info!(pool = %config.pool_name, "reattached to existing thin-pool");
        } else {
            dmsetup::create_device(&config.pool_name, &expected).await?;
            info!(pool = %config.pool_name, size_sectors = data_size / SECTOR_SIZE, "thin-pool created");
        }

        Ok(Self {
            pool_name: config.pool_name.clone(),
            devices: Mutex::new(HashMap::new()),
            device_locks: Mutex::new(HashMap::new()),
            message_lock: Mutex::new(()),
            next_device_id: AtomicU32::new(1),
        })
    }

    /// The pool's dm device name.
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Device node path for a thin device.
    pub fn device_path(&self, name: &str) -> PathBuf {
        dmsetup::device_path(name)
    }

    /// Current in-memory record for a device, if known.
    pub async fn device(&self, name: &str) -> Option<DeviceInfo> {
        self.devices.lock().await.get(name).cloned()
    }

    /// Create and activate a fresh thin device of `size_bytes`.
    ///
    /// Atomic against partial failure: if activation fails after the pool
    /// accepted `create_thin`, the thin id is released via a `delete` message
    /// and the dm node removed before the error returns.
    pub async fn create_thin_device(&self, name: &str, size_bytes: u64) -> Result<()> {
        let sectors = validate_size(name, size_bytes)?;
        let _guard = self.lock_device(name).await;

        if self.device(name).await.is_some() {
            return Err(Error::AlreadyExists(format!("device {}", name)));
        }
        self.set_device(DeviceInfo {
            name: name.to_string(),
            id: 0,
            parent_id: None,
            size: size_bytes,
            state: DeviceState::Creating,
        })
        .await;

        let id = match self
            .send_create_message(|id| dmsetup::create_thin_message(id))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // The pool never accepted the message, so there is nothing
                // to roll back.
                self.forget_device(name).await;
                return Err(e);
            }
        };
        self.update_device(name, |d| {
            d.id = id;
            d.state = DeviceState::Created;
        })
        .await;

        debug!(device = name, id, size_bytes, "thin device allocated");

        if let Err(e) = self.activate(name, sectors, id).await {
            error!(device = name, id, error = %e, "thin device activation failed, rolling back");
            self.rollback_device(name, id).await;
            return Err(e);
        }
        self.update_device(name, |d| d.state = DeviceState::Activated)
            .await;
        Ok(())
    }

    /// Create and activate a snapshot of `parent_name` under `name`.
    ///
    /// The parent is suspended around the `create_snap` message so the
    /// snapshot sees a quiesced origin, and resumed afterwards even when the
    /// message fails.
    pub async fn create_snapshot_device(
        &self,
        parent_name: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<()> {
        if parent_name == name {
            return Err(Error::InvalidArgument(format!(
                "snapshot device name equals parent: {}",
                name
            )));
        }
        let sectors = validate_size(name, size_bytes)?;
        let (_g1, _g2) = self.lock_device_pair(parent_name, name).await;

        let parent = self
            .device(parent_name)
            .await
            .ok_or_else(|| Error::NotFound(format!("device {}", parent_name)))?;
        if self.device(name).await.is_some() {
            return Err(Error::AlreadyExists(format!("device {}", name)));
        }
        self.set_device(DeviceInfo {
            name: name.to_string(),
            id: 0,
            parent_id: Some(parent.id),
            size: size_bytes,
            state: DeviceState::Creating,
        })
        .await;

        let suspend_parent = parent.state == DeviceState::Activated;
        if suspend_parent {
            if let Err(e) = dmsetup::suspend(parent_name).await {
                self.forget_device(name).await;
                return Err(e);
            }
            self.update_device(parent_name, |d| d.state = DeviceState::Suspended)
                .await;
        }

        let msg_result = self
            .send_create_message(|id| dmsetup::create_snap_message(id, parent.id))
            .await;

        if suspend_parent {
            match dmsetup::resume(parent_name).await {
                Ok(()) => {
                    self.update_device(parent_name, |d| d.state = DeviceState::Activated)
                        .await;
                }
                Err(e) => {
                    error!(device = parent_name, error = %e, "failed to resume snapshot parent");
                    self.update_device(parent_name, |d| d.state = DeviceState::Faulty)
                        .await;
                    match msg_result {
                        Ok(id) => self.rollback_device(name, id).await,
                        Err(_) => self.forget_device(name).await,
                    }
                    return Err(e);
                }
            }
        }

        let id = match msg_result {
            Ok(id) => id,
            Err(e) => {
                self.forget_device(name).await;
                return Err(e);
            }
        };
        self.update_device(name, |d| {
            d.id = id;
            d.state = DeviceState::Created;
        })
        .await;

        debug!(
            device = name,
            id,
            parent = parent_name,
            parent_id = parent.id,
            "snapshot device allocated"
        );

        if let Err(e) = self.activate(name, sectors, id).await {
            error!(device = name, id, error = %e, "snapshot activation failed, rolling back");
            self.rollback_device(name, id).await;
            return Err(e);
        }
        self.update_device(name, |d| d.state = DeviceState::Activated)
            .await;
        Ok(())
    }

    /// Remove a thin device: quiesce and drop the dm node, then release the
    /// thin id back to the pool.
    ///
    /// With `deferred`, node removal is postponed by the kernel until open
    /// descriptors drain; without it, a held device fails with `Busy`.
    pub async fn remove_device(&self, name: &str, deferred: bool) -> Result<()> {
        let _guard = self.lock_device(name).await;

        let device = self
            .device(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("device {}", name)))?;
        self.update_device(name, |d| d.state = DeviceState::Deactivating)
            .await;

        if dmsetup::device_exists(name).await {
            if let Err(e) = dmsetup::suspend(name).await {
                // A device that vanished between the checks is fine; anything
                // else blocks the removal.
                if !matches!(e, Error::NotFound(_)) {
                    self.update_device(name, |d| d.state = DeviceState::Faulty)
                        .await;
                    return Err(e);
                }
            }
            match dmsetup::remove(name, deferred).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {}
                Err(Error::Busy(held)) if !deferred => {
                    let _ = dmsetup::resume(name).await;
                    self.update_device(name, |d| d.state = DeviceState::Activated)
                        .await;
                    return Err(Error::Busy(held));
                }
                Err(e) => {
                    self.update_device(name, |d| d.state = DeviceState::Faulty)
                        .await;
                    return Err(e);
                }
            }
        }
        self.update_device(name, |d| d.state = DeviceState::Deactivated)
            .await;

        self.update_device(name, |d| d.state = DeviceState::Removing)
            .await;
        {
            let _m = self.message_lock.lock().await;
            if let Err(e) =
                dmsetup::message(&self.pool_name, 0, &dmsetup::delete_message(device.id)).await
            {
                error!(device = name, id = device.id, error = %e, "failed to release thin device id");
                self.update_device(name, |d| d.state = DeviceState::Faulty)
                    .await;
                return Err(e);
            }
        }
        self.update_device(name, |d| d.state = DeviceState::Removed)
            .await;
        self.forget_device(name).await;

        debug!(device = name, id = device.id, deferred, "thin device removed");
        Ok(())
    }

    /// Release the pool. With `deactivate`, the pool device itself is
    /// removed; otherwise only in-memory handles go away.
    pub async fn close(&self, deactivate: bool) -> Result<()> {
        if deactivate {
            dmsetup::remove(&self.pool_name, false).await?;
            info!(pool = %self.pool_name, "thin-pool deactivated");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn activate(&self, name: &str, sectors: u64, id: u32) -> Result<()> {
        self.update_device(name, |d| d.state = DeviceState::Activating)
            .await;
        dmsetup::create_device(name, &dmsetup::thin_table(&self.pool_name, sectors, id)).await
    }

    /// Allocate a thin id and deliver a create message under the pool-wide
    /// message lock, skipping ids the pool metadata already holds.
    async fn send_create_message<F>(&self, build: F) -> Result<u32>
    where
        F: Fn(u32) -> String,
    {
        let _m = self.message_lock.lock().await;
        for _ in 0..MAX_DEVICE_ID_ATTEMPTS {
            let id = self.next_device_id.fetch_add(1, Ordering::SeqCst);
            match dmsetup::message(&self.pool_name, 0, &build(id)).await {
                Ok(()) => return Ok(id),
                Err(Error::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal(format!(
            "could not allocate a thin device id in pool {} after {} attempts",
            self.pool_name, MAX_DEVICE_ID_ATTEMPTS
        )))
    }

    /// Undo a partially created device: release its thin id and drop any dm
    /// node. If the rollback itself fails, the device is left `Faulty` so the
    /// leak stays visible.
    async fn rollback_device(&self, name: &str, id: u32) {
        let mut failed = false;
        {
            let _m = self.message_lock.lock().await;
            if let Err(e) =
                dmsetup::message(&self.pool_name, 0, &dmsetup::delete_message(id)).await
            {
                error!(device = name, id, error = %e, "rollback: failed to release thin device id");
                failed = true;
            }
        }
        if dmsetup::device_exists(name).await {
            if let Err(e) = dmsetup::remove(name, false).await {
                error!(device = name, error = %e, "rollback: failed to remove dm node");
                failed = true;
            }
        }
        if failed {
            self.update_device(name, |d| d.state = DeviceState::Faulty)
                .await;
        } else {
            self.forget_device(name).await;
        }
    }

    async fn lock_device(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.device_locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Lock two devices in name order so concurrent snapshot operations on
    /// the same pair cannot deadlock.
    async fn lock_device_pair(
        &self,
        a: &str,
        b: &str,
    ) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        if a <= b {
            let first = self.lock_device(a).await;
            let second = self.lock_device(b).await;
            (first, second)
        } else {
            let first = self.lock_device(b).await;
            let second = self.lock_device(a).await;
            (first, second)
        }
    }

    async fn set_device(&self, info: DeviceInfo) {
        self.devices.lock().await.insert(info.name.clone(), info);
    }

    async fn update_device<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut DeviceInfo),
    {
        if let Some(device) = self.devices.lock().await.get_mut(name) {
            f(device);
        }
    }

    async fn forget_device(&self, name: &str) {
        self.devices.lock().await.remove(name);
    }

    #[cfg(test)]
    pub(crate) fn new_detached(pool_name: &str) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            devices: Mutex::new(HashMap::new()),
            device_locks: Mutex::new(HashMap::new()),
            message_lock: Mutex::new(()),
            next_device_id: AtomicU32::new(1),
        }
    }

    #[cfg(test)]
    pub(crate) async fn seed_device_for_test(&self, info: DeviceInfo) {
        self.set_device(info).await;
    }
}

fn validate_size(name: &str, size_bytes: u64) -> Result<u64> {
    if size_bytes == 0 || size_bytes % SECTOR_SIZE != 0 {
        return Err(Error::InvalidArgument(format!(
            "size of device {} must be a non-zero multiple of {} bytes, got {}",
            name, SECTOR_SIZE, size_bytes
        )));
    }
    Ok(size_bytes / SECTOR_SIZE)
}

/// Compare a live pool table against the expected one. `dmsetup table`
/// reports backing devices as major:minor rather than the paths the table
/// was loaded with, so only the stable fields participate: start, length,
/// target type, and data block size.
fn pool_tables_match(existing: &str, expected: &str) -> bool {
    let e: Vec<&str> = existing.split_whitespace().collect();
    let x: Vec<&str> = expected.split_whitespace().collect();
    if e.len() < 6 || x.len() < 6 {
        return false;
    }
    e[0] == x[0] && e[1] == x[1] && e[2] == x[2] && e[5] == x[5]
}
