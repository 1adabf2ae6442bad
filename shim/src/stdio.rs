//! Stdio proxying between host-side named pipes and the guest's fixed vsock
//! ports. stdin flows host to guest; stdout and stderr flow guest to host.

use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use vmshim_protocol::{STDERR_PORT, STDIN_PORT, STDIO_BUFFER_SIZE, STDOUT_PORT};

use crate::vm::vsock::{self, FdStream};

/// Spawn one proxy task per supplied stream. An empty path skips that
/// stream. Tasks terminate when either endpoint closes or `token` fires.
pub fn spawn_proxies(
    token: &CancellationToken,
    cid: u32,
    stdin: String,
    stdout: String,
    stderr: String,
) {
    tokio::spawn(proxy_io(token.clone(), stdin, cid, STDIN_PORT, true));
    tokio::spawn(proxy_io(token.clone(), stdout, cid, STDOUT_PORT, false));
    tokio::spawn(proxy_io(token.clone(), stderr, cid, STDERR_PORT, false));
}

/// Copy bytes in one direction between a host fifo and a guest vsock port.
/// Errors are logged, never propagated; the task owns both endpoints and
/// closes them on exit.
async fn proxy_io(token: CancellationToken, path: String, cid: u32, port: u32, host_to_guest: bool) {
    if path.is_empty() {
        return;
    }
    debug!(path, cid, port, "setting up stdio proxy");

    let fifo = match open_fifo(&path) {
        Ok(fifo) => fifo,
        Err(e) => {
            error!(path, error = %e, "error opening fifo");
            return;
        }
    };

    let conn = match vsock::connect(cid, port).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(cid, port, error = %e, "unable to dial stdio vsock port");
            return;
        }
    };

    debug!(path, port, "begin copying stdio");

    let result = if host_to_guest {
        copy_stream(token, fifo, conn).await
    } else {
        copy_stream(token, conn, fifo).await
    };
    match result {
        Ok(bytes) => debug!(path, port, bytes, "stdio copy finished"),
        Err(e) => error!(path, port, error = %e, "error copying stdio"),
    }
    // Both endpoints drop (and close) here, on cancellation as well.
}

/// Fixed-buffer copy loop. Returns the number of bytes moved. Cancellation
/// stops the copy between chunks; both streams are dropped by the caller.
async fn copy_stream(
    token: CancellationToken,
    mut from: FdStream,
    mut to: FdStream,
) -> Result<u64> {
    let mut buf = [0u8; STDIO_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(total),
            read = from.read(&mut buf) => read.context("stdio read")?,
        };
        if n == 0 {
            return Ok(total);
        }
        tokio::select! {
            _ = token.cancelled() => return Ok(total),
            write = to.write_all(&buf[..n]) => write.context("stdio write")?,
        }
        total += n as u64;
    }
}

/// Open a fifo read/write and non-blocking. Opening O_RDWR keeps the fifo
/// from delivering EOF while the peer end is not yet attached.
fn open_fifo(path: &str) -> Result<FdStream> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("opening fifo {}", path))?;

    FdStream::new(OwnedFd::from(file)).context("registering fifo with tokio")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_port_assignment() {
        // Each stream has its own well-known port on the guest.
        assert_eq!(STDIN_PORT, 11000);
        assert_eq!(STDOUT_PORT, 11001);
        assert_eq!(STDERR_PORT, 11002);
    }

    #[test]
    fn open_fifo_missing_path_errors() {
        assert!(open_fifo("/nonexistent/fifo-path").is_err());
    }

    #[tokio::test]
    async fn copy_stream_moves_bytes_through_a_pipe_pair() {
        // A socketpair provides two connected non-blocking fds, the same
        // shape as a fifo/vsock pairing.
        let (a, b) = socket_pair();
        let (c, d) = socket_pair();

        let token = CancellationToken::new();
        let copier = tokio::spawn(copy_stream(
            token.clone(),
            FdStream::new(b).unwrap(),
            FdStream::new(c).unwrap(),
        ));

        let mut source = FdStream::new(a).unwrap();
        let mut sink = FdStream::new(d).unwrap();

        source.write_all(b"hello stdio").await.unwrap();
        drop(source); // closes the write side, ending the copy

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = sink.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if received.len() >= 11 {
                break;
            }
        }
        assert_eq!(&received, b"hello stdio");

        let copied = copier.await.unwrap().unwrap();
        assert_eq!(copied, 11);
    }

    #[tokio::test]
    async fn copy_stream_stops_on_cancellation() {
        let (_a, b) = socket_pair();
        let (c, _d) = socket_pair();

        let token = CancellationToken::new();
        let copier = tokio::spawn(copy_stream(
            token.clone(),
            FdStream::new(b).unwrap(),
            FdStream::new(c).unwrap(),
        ));

        // Nothing is written; the copy is parked in its read. Cancel must
        // unblock it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();

        let copied = copier.await.unwrap().unwrap();
        assert_eq!(copied, 0);
    }

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        use std::os::fd::FromRawFd;

        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }
}
