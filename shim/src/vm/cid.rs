use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// VHOST_VSOCK_SET_GUEST_CID from linux/vhost.h: _IOW(0xAF, 0x60, __u64).
const VHOST_VSOCK_SET_GUEST_CID: libc::c_ulong = 0x4008_af60;

const VSOCK_DEVICE_PATH: &str = "/dev/vhost-vsock";

/// CIDs 0-2 are reserved (hypervisor, local, host).
const START_CID: u32 = 3;

/// Reserve the first available vsock guest context id.
///
/// Scans upward from CID 3 issuing `VHOST_VSOCK_SET_GUEST_CID`; the kernel
/// answers `EADDRINUSE` for taken ids, which statically reserved ranges also
/// produce, so "taken" simply means "try the next one". Any other errno is
/// fatal. Cancelling `token` aborts the scan.
///
/// The reservation itself is made by the hypervisor when it opens the vsock
/// device; this scan only finds a free id, so the probe fd is closed on
/// return.
pub fn find_available_cid(token: &CancellationToken) -> Result<u32> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(VSOCK_DEVICE_PATH)
        .with_context(|| format!("failed to open {}", VSOCK_DEVICE_PATH))?;
    let fd = file.as_raw_fd();

    for cid in START_CID..u32::MAX {
        if token.is_cancelled() {
            bail!("vsock context id search cancelled");
        }

        let guest_cid: u64 = cid.into();
        let ret = unsafe { libc::ioctl(fd, VHOST_VSOCK_SET_GUEST_CID, &guest_cid) };
        if ret == 0 {
            debug!(cid, "reserved vsock guest context id");
            return Ok(cid);
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EADDRINUSE) => continue,
            _ => {
                return Err(err).with_context(|| {
                    format!("VHOST_VSOCK_SET_GUEST_CID ioctl failed for cid {}", cid)
                })
            }
        }
    }

    bail!("no available vsock context id")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_cids_are_skipped() {
        // 0 = hypervisor, 1 = local, 2 = host; allocation starts above them.
        assert!(START_CID >= 3);
    }

    #[test]
    fn ioctl_request_encoding() {
        // _IOW(0xAF, 0x60, __u64): direction=write (0x40 in the top byte),
        // size 8, type 0xAF, nr 0x60.
        assert_eq!(VHOST_VSOCK_SET_GUEST_CID, 0x4008_af60);
    }

    #[test]
    fn cancelled_token_aborts_search() {
        let token = CancellationToken::new();
        token.cancel();
        // Either the device is absent (open fails) or the scan aborts on the
        // cancelled token; it must not loop.
        let result = find_available_cid(&token);
        assert!(result.is_err());
    }
}
