//! Out-of-process bootstrap: the daemon invokes `vmshim start <id>` and gets
//! back the socket address of a freshly forked shim that inherited the
//! listening socket on fd 3.

use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// Fd number the serve-mode child finds its listener on.
pub const LISTENER_FD: RawFd = 3;

/// OOM score adjustment for shim processes; the shim must outlive the
/// containers it supervises under memory pressure.
const SHIM_OOM_SCORE_ADJ: i32 = -999;

const SHIM_RUN_DIR: &str = "/run/vmshim";

#[derive(Debug, Clone)]
pub struct StartOpts {
    pub id: String,
    pub namespace: String,
    /// Host daemon API address, forwarded so the child can publish events.
    pub address: String,
    /// Binary the child execs to publish events.
    pub publish_binary: String,
    pub debug: bool,
}

/// Socket address for a shim, namespaced to avoid id collisions across
/// daemon namespaces.
pub fn socket_address(namespace: &str, id: &str) -> PathBuf {
    Path::new(SHIM_RUN_DIR).join(namespace).join(id).join("shim.sock")
}

/// Fork the serve-mode shim: bind its socket, hand it over on fd 3, record
/// `shim.pid` and `address` in the working directory, and lower the child's
/// OOM score. Returns the socket address for the daemon.
pub fn start_shim(opts: &StartOpts) -> Result<String> {
    let socket_path = socket_address(&opts.namespace, &opts.id);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let _ = std::fs::remove_file(&socket_path);

    let listener = std::os::unix::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    let listen_fd = std::os::fd::AsRawFd::as_raw_fd(&listener);

    let self_exe = std::env::current_exe().context("resolving own executable")?;
    let cwd = std::env::current_dir().context("resolving working directory")?;

    let mut cmd = std::process::Command::new(self_exe);
    cmd.arg("--namespace")
        .arg(&opts.namespace)
        .arg("--address")
        .arg(&opts.address)
        .arg("--publish-binary")
        .arg(&opts.publish_binary);
    if opts.debug {
        cmd.arg("--debug");
    }
    cmd.current_dir(&cwd).env("TOKIO_WORKER_THREADS", "2");

    unsafe {
        cmd.pre_exec(move || {
            // dup2 clears CLOEXEC, so the child sees the listener on fd 3.
            if libc::dup2(listen_fd, LISTENER_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Own process group: daemon-directed signals must not hit the shim.
            if libc::setpgid(0, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().context("spawning shim process")?;
    let pid = child.id();
    // The parent exits right after; the daemon supervises the child through
    // its socket, and init reaps it.
    drop(child);

    write_pid_file(&cwd.join("shim.pid"), pid)?;
    let address = socket_path.to_string_lossy().into_owned();
    write_address_file(&cwd.join("address"), &address)?;

    set_oom_score_adj(pid, SHIM_OOM_SCORE_ADJ)
        .context("failed to set OOM score on shim")?;

    info!(pid, address = %address, "shim started");
    Ok(address)
}

/// Take the listener inherited from the bootstrap, if any.
pub fn inherited_listener() -> Option<std::os::unix::net::UnixListener> {
    let flags = unsafe { libc::fcntl(LISTENER_FD, libc::F_GETFD) };
    if flags < 0 {
        return None;
    }
    Some(unsafe { std::os::unix::net::UnixListener::from_raw_fd(LISTENER_FD) })
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    std::fs::write(path, pid.to_string())
        .with_context(|| format!("writing {}", path.display()))
}

fn write_address_file(path: &Path, address: &str) -> Result<()> {
    std::fs::write(path, address).with_context(|| format!("writing {}", path.display()))
}

fn set_oom_score_adj(pid: u32, score: i32) -> Result<()> {
    let path = format!("/proc/{}/oom_score_adj", pid);
    std::fs::write(&path, score.to_string()).with_context(|| format!("writing {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_address_is_namespaced() {
        assert_eq!(
            socket_address("default", "task-1"),
            PathBuf::from("/run/vmshim/default/task-1/shim.sock")
        );
        assert_ne!(
            socket_address("ns-a", "task-1"),
            socket_address("ns-b", "task-1")
        );
    }

    #[test]
    fn pid_and_address_files() {
        let dir = tempfile::tempdir().unwrap();

        let pid_path = dir.path().join("shim.pid");
        write_pid_file(&pid_path, 4321).unwrap();
        assert_eq!(std::fs::read_to_string(&pid_path).unwrap(), "4321");

        let addr_path = dir.path().join("address");
        write_address_file(&addr_path, "/run/vmshim/default/t/shim.sock").unwrap();
        assert_eq!(
            std::fs::read_to_string(&addr_path).unwrap(),
            "/run/vmshim/default/t/shim.sock"
        );
    }

    #[test]
    fn oom_score_adj_path_shape() {
        // Writing one's own current adjustment is always permitted.
        let current =
            std::fs::read_to_string(format!("/proc/{}/oom_score_adj", std::process::id()))
                .unwrap();
        let current: i32 = current.trim().parse().unwrap();
        set_oom_score_adj(std::process::id(), current).unwrap();
    }
}
