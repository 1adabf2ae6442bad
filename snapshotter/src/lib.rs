//! Device-mapper thin-pool snapshotter.
//!
//! Implements the snapshot lifecycle contract (prepare/view/commit/remove/
//! mounts/walk/stat/update) on top of dm thin provisioning. Every snapshot
//! is a thinly provisioned volume derived from its parent, surfaced to the
//! runtime as a formatted ext4 block device named
//! `<pool>-snap-<snapshot-id>` under /dev/mapper.

pub mod config;
pub mod dmsetup;
pub mod error;
pub mod pool;
pub mod snapshotter;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use pool::{DeviceInfo, DeviceState, PoolDevice};
pub use snapshotter::{snapshot_device_name, Mount, Snapshotter, Usage};
pub use store::{Info, Kind, MetaStore, Snapshot};
