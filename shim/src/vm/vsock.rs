use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vmshim_protocol::{self as protocol, TaskRequest, TaskResponse};

/// An async stream over a raw non-blocking fd, backed by `AsyncFd<OwnedFd>`.
///
/// Vsock sockets cannot be wrapped in `tokio::net::UnixStream` because mio's
/// internal bookkeeping expects `AF_UNIX` semantics (e.g. `getpeername` with
/// `sockaddr_un`), and fifos are not sockets at all. Both are plain fds with
/// readiness semantics, so `AsyncRead`/`AsyncWrite` are implemented directly
/// via `libc::read`/`libc::write`.
pub struct FdStream {
    inner: tokio::io::unix::AsyncFd<OwnedFd>,
}

impl FdStream {
    pub fn new(fd: OwnedFd) -> std::io::Result<Self> {
        let inner = tokio::io::unix::AsyncFd::new(fd)?;
        Ok(Self { inner })
    }
}

impl AsyncRead for FdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::read(fd, unfilled.as_mut_ptr() as *mut libc::c_void, unfilled.len())
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let fd = self.inner.get_ref().as_raw_fd();
        let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        if ret == 0 {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(std::io::Error::last_os_error()))
        }
    }
}

/// Number of vsock dial attempts before the guest agent is declared
/// unreachable. The VM boots in well under a second, so the schedule of
/// 100/200/400/800/1600 ms leaves ample headroom.
const DIAL_RETRY_COUNT: u32 = 5;
const DIAL_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Exponential backoff delay for a 0-indexed attempt.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Persistent RPC client for the in-guest task agent.
///
/// One framed `TaskRequest` goes out per call and one framed `TaskResponse`
/// comes back; agent-side failures arrive as `TaskResponse::Error` rather
/// than transport errors.
pub struct AgentClient {
    stream: FdStream,
    cid: u32,
}

impl AgentClient {
    /// Dial the guest agent with exponential backoff. Cancellation of
    /// `token` aborts the backoff loop between attempts.
    pub async fn dial(cid: u32, port: u32, token: &CancellationToken) -> Result<Self> {
        let mut last_err = None;

        for attempt in 0..DIAL_RETRY_COUNT {
            if token.is_cancelled() {
                bail!("vsock dial to cid {} cancelled", cid);
            }

            match connect(cid, port).await {
                Ok(stream) => {
                    debug!(cid, port, attempt, "vsock dial succeeded");
                    return Ok(Self { stream, cid });
                }
                Err(e) => {
                    let delay = backoff_delay(DIAL_INITIAL_DELAY, attempt);
                    warn!(
                        cid,
                        port,
                        attempt = attempt + 1,
                        retries = DIAL_RETRY_COUNT,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "vsock dial failed"
                    );
                    last_err = Some(e);
                    tokio::select! {
                        _ = token.cancelled() => bail!("vsock dial to cid {} cancelled", cid),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no dial attempts made"))
            .context(format!(
                "vsock dial to cid {} port {} failed after {} attempts",
                cid, port, DIAL_RETRY_COUNT
            )))
    }

    /// Send one request and read its response.
    pub async fn call(&mut self, req: &TaskRequest) -> Result<TaskResponse> {
        let (mut read_half, mut write_half) = tokio::io::split(&mut self.stream);
        protocol::write_message(&mut write_half, req)
            .await
            .with_context(|| format!("sending {} to agent at cid {}", req.op(), self.cid))?;
        let resp: TaskResponse = protocol::read_message(&mut read_half)
            .await
            .with_context(|| {
                format!("reading {} response from agent at cid {}", req.op(), self.cid)
            })?;
        Ok(resp)
    }
}

/// Create one non-blocking AF_VSOCK connection wrapped for tokio.
pub async fn connect(cid: u32, port: u32) -> Result<FdStream> {
    let fd = tokio::task::spawn_blocking(move || create_vsock_connection(cid, port))
        .await
        .context("vsock connect task panicked")??;

    FdStream::new(fd).context("failed to register vsock fd with tokio")
}

/// Create a raw AF_VSOCK connection and return an `OwnedFd`.
///
/// Addressing uses `struct sockaddr_vm` (CID + port); the returned fd is set
/// non-blocking for use with `AsyncFd`.
fn create_vsock_connection(cid: u32, port: u32) -> Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        bail!(
            "failed to create vsock socket: {}",
            std::io::Error::last_os_error()
        );
    }

    // sockaddr_vm layout per include/uapi/linux/vm_sockets.h
    #[repr(C)]
    struct SockaddrVm {
        svm_family: libc::sa_family_t,
        svm_reserved1: u16,
        svm_port: u32,
        svm_cid: u32,
        svm_flags: u8,
        svm_zero: [u8; 3],
    }

    let addr = SockaddrVm {
        svm_family: libc::AF_VSOCK as libc::sa_family_t,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: cid,
        svm_flags: 0,
        svm_zero: [0u8; 3],
    };

    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const SockaddrVm as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        bail!("vsock connect to cid {} port {} failed: {}", cid, port, err);
    }

    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        bail!("failed to set vsock socket non-blocking: {}", err);
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
