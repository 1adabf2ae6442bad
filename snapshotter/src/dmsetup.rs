//! Low-level device-mapper control plane. All operations shell out to the
//! host's `dmsetup` binary; table lines and pool messages are built as
//! strings here so callers never format them by hand.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Directory where device-mapper exposes device nodes.
pub const DEV_MAPPER_DIR: &str = "/dev/mapper";

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Low-water-mark (in data blocks) passed to the thin-pool target; the kernel
/// emits a dm event when free space drops below it.
const LOW_WATER_MARK: u64 = 32768;

/// Full device node path for a dm device name.
pub fn device_path(name: &str) -> PathBuf {
    PathBuf::from(format!("{}/{}", DEV_MAPPER_DIR, name))
}

/// Parsed output of `dmsetup info -c` for a single device.
#[derive(Debug, Clone)]
pub struct DmDeviceInfo {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    /// Attribute string, e.g. "L--w" (live, writable) or "LIsw" (suspended).
    pub attr: String,
    pub open_count: u32,
}

impl DmDeviceInfo {
    pub fn is_suspended(&self) -> bool {
        self.attr.contains('s')
    }
}

// ---------------------------------------------------------------------------
// Table and message builders
// ---------------------------------------------------------------------------

/// Build a `thin-pool` target line.
///
/// Format: `start length thin-pool metadata_dev data_dev block_size
/// low_water_mark feature_count features`. Block zeroing is skipped because
/// freshly provisioned blocks are immediately overwritten by mkfs.
pub fn thin_pool_table(
    metadata_device: &Path,
    data_device: &Path,
    data_size_sectors: u64,
    block_size_sectors: u64,
) -> String {
    format!(
        "0 {} thin-pool {} {} {} {} 1 skip_block_zeroing",
        data_size_sectors,
        metadata_device.display(),
        data_device.display(),
        block_size_sectors,
        LOW_WATER_MARK,
    )
}

/// Build a `thin` target line mapping a pool's thin device id.
pub fn thin_table(pool_name: &str, size_sectors: u64, device_id: u32) -> String {
    format!(
        "0 {} thin {}/{} {}",
        size_sectors, DEV_MAPPER_DIR, pool_name, device_id
    )
}

/// Pool message allocating a fresh thin device id.
pub fn create_thin_message(device_id: u32) -> String {
    format!("create_thin {}", device_id)
}

/// Pool message creating a snapshot of an existing thin device.
pub fn create_snap_message(device_id: u32, parent_id: u32) -> String {
    format!("create_snap {} {}", device_id, parent_id)
}

/// Pool message releasing a thin device id.
pub fn delete_message(device_id: u32) -> String {
    format!("delete {}", device_id)
}

// ---------------------------------------------------------------------------
// dmsetup operations
// ---------------------------------------------------------------------------

/// Probe the dmsetup binary and driver, returning the version string.
pub async fn version() -> Result<String> {
    run_dmsetup_output("dmsetup", &["version"]).await
}

/// Create a device with the given table and resume it.
pub async fn create_device(name: &str, table: &str) -> Result<()> {
    run_dmsetup(name, &["create", name, "--table", table]).await
}

/// Whether a dm device with this name exists.
pub async fn device_exists(name: &str) -> bool {
    info(name).await.is_ok()
}

/// Fetch the active table line of a device.
pub async fn table(name: &str) -> Result<String> {
    let out = run_dmsetup_output(name, &["table", name]).await?;
    Ok(out.trim().to_string())
}

/// Fetch device status fields via `dmsetup info -c`.
pub async fn info(name: &str) -> Result<DmDeviceInfo> {
    let out = run_dmsetup_output(
        name,
        &[
            "info",
            "-c",
            "--noheadings",
            "-o",
            "name,major,minor,attr,open",
            "--separator",
            ":",
            name,
        ],
    )
    .await?;

    let line = out.trim();
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 5 {
        return Err(Error::Internal(format!(
            "unexpected dmsetup info output for '{}': {:?}",
            name, line
        )));
    }

    Ok(DmDeviceInfo {
        name: parts[0].to_string(),
        major: parts[1].trim().parse().unwrap_or(0),
        minor: parts[2].trim().parse().unwrap_or(0),
        attr: parts[3].trim().to_string(),
        open_count: parts[4].trim().parse().unwrap_or(0),
    })
}

/// Send a target message to a device at the given sector.
pub async fn message(name: &str, sector: u64, msg: &str) -> Result<()> {
    run_dmsetup(name, &["message", name, &sector.to_string(), msg]).await
}

/// Suspend a device, flushing outstanding I/O.
pub async fn suspend(name: &str) -> Result<()> {
    run_dmsetup(name, &["suspend", name]).await
}

/// Resume a suspended device.
pub async fn resume(name: &str) -> Result<()> {
    run_dmsetup(name, &["resume", name]).await
}

/// Remove a device node. With `deferred`, removal is postponed by the kernel
/// until the last holder closes the device.
pub async fn remove(name: &str, deferred: bool) -> Result<()> {
    let mut args = vec!["remove"];
    if deferred {
        args.push("--deferred");
    }
    args.push("--retry");
    args.push(name);
    run_dmsetup(name, &args).await
}

/// Size in bytes of a block device, via `blockdev --getsize64`.
pub async fn block_device_size(path: &Path) -> Result<u64> {
    let path_str = path.display().to_string();
    let out = run("blockdev", &path_str, &["--getsize64", &path_str]).await?;
    out.trim()
        .parse()
        .map_err(|e| Error::Internal(format!("parsing size of {}: {}", path.display(), e)))
}

// ---------------------------------------------------------------------------
// Process execution
// ---------------------------------------------------------------------------

/// Classify a failed invocation by its stderr. `target` names the device or
/// message the caller was operating on, so error messages stay attributable.
fn classify_error(target: &str, op: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("resource busy") || lower.contains("device is busy") {
        Error::Busy(target.to_string())
    } else if lower.contains("file exists") {
        Error::AlreadyExists(target.to_string())
    } else if lower.contains("no such device")
        || lower.contains("not found")
        || lower.contains("device does not exist")
    {
        Error::NotFound(target.to_string())
    } else {
        Error::Internal(format!(
            "dmsetup {} failed on '{}': {}",
            op,
            target,
            stderr.trim()
        ))
    }
}

async fn run_dmsetup(target: &str, args: &[&str]) -> Result<()> {
    run_dmsetup_output(target, args).await.map(|_| ())
}

async fn run_dmsetup_output(target: &str, args: &[&str]) -> Result<String> {
    run("dmsetup", target, args).await
}

async fn run(binary: &str, target: &str, args: &[&str]) -> Result<String> {
    debug!(binary, args = ?args, "running device-mapper command");

    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Internal(format!("failed to execute {}: {}", binary, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_error(
            target,
            args.first().unwrap_or(&""),
            &stderr,
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
