use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// How long to wait for the hypervisor's API socket to appear after spawn.
const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one microVM.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Unix socket the hypervisor serves its API on.
    pub socket_path: PathBuf,
    pub kernel_image_path: PathBuf,
    pub kernel_args: String,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub log_fifo: Option<PathBuf>,
    pub metrics_fifo: Option<PathBuf>,
    /// Guest context id for the VM's vsock device.
    pub vsock_cid: u32,
    /// Attached drives in order; drive "1" is the root.
    pub drives: Vec<DriveConfig>,
}

/// One block device attached to the VM.
#[derive(Debug, Clone, Serialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// A running hypervisor process and its API endpoint.
///
/// The API is HTTP/1.1 over the Unix socket: the machine is described with a
/// series of PUTs, then booted with an InstanceStart action. Each call opens
/// its own connection.
pub struct Machine {
    child: tokio::process::Child,
    config: MachineConfig,
}

impl Machine {
    /// Spawn the hypervisor binary and wait for its API socket.
    ///
    /// On any failure after the spawn the child is killed before the error
    /// returns.
    pub async fn new(binary: &Path, config: MachineConfig) -> Result<Self> {
        // A stale socket from a previous run would make the bind fail.
        let _ = tokio::fs::remove_file(&config.socket_path).await;
        if let Some(parent) = config.socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        debug!(
            binary = %binary.display(),
            socket = %config.socket_path.display(),
            "spawning hypervisor"
        );

        let mut child = tokio::process::Command::new(binary)
            .arg("--api-sock")
            .arg(&config.socket_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn hypervisor {}", binary.display()))?;

        if let Err(e) = wait_for_socket(&config.socket_path, API_SOCKET_TIMEOUT).await {
            let _ = child.kill().await;
            return Err(e);
        }

        Ok(Self { child, config })
    }

    /// Configure the machine over the API and boot it.
    pub async fn start(&mut self) -> Result<()> {
        self.put(
            "/machine-config",
            serde_json::json!({
                "vcpu_count": self.config.vcpu_count,
                "mem_size_mib": self.config.mem_size_mib,
            }),
        )
        .await?;

        self.put(
            "/boot-source",
            serde_json::json!({
                "kernel_image_path": self.config.kernel_image_path,
                "boot_args": self.config.kernel_args,
            }),
        )
        .await?;

        if let Some(log_fifo) = &self.config.log_fifo {
            self.put("/logger", serde_json::json!({ "log_path": log_fifo }))
                .await?;
        }
        if let Some(metrics_fifo) = &self.config.metrics_fifo {
            self.put(
                "/metrics",
                serde_json::json!({ "metrics_path": metrics_fifo }),
            )
            .await?;
        }

        for drive in &self.config.drives {
            self.put(&format!("/drives/{}", drive.drive_id), serde_json::json!(drive))
                .await?;
        }

        self.put(
            "/vsock",
            serde_json::json!({
                "vsock_id": "root",
                "guest_cid": self.config.vsock_cid,
            }),
        )
        .await?;

        self.put(
            "/actions",
            serde_json::json!({ "action_type": "InstanceStart" }),
        )
        .await?;

        debug!(cid = self.config.vsock_cid, "hypervisor instance started");
        Ok(())
    }

    /// Terminate the VMM process.
    pub async fn stop_vmm(&mut self) -> Result<()> {
        debug!("stopping VMM");
        if let Err(e) = self.child.kill().await {
            // Already-exited children are fine.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(e).context("failed to kill hypervisor process");
            }
        }
        let _ = tokio::fs::remove_file(&self.config.socket_path).await;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Issue one PUT against the API socket and check for a 2xx response.
    async fn put(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let stream = UnixStream::connect(&self.config.socket_path)
            .await
            .with_context(|| {
                format!(
                    "connecting to hypervisor API {}",
                    self.config.socket_path.display()
                )
            })?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        let request = build_put_request(path, &body.to_string());
        write_half
            .write_all(request.as_bytes())
            .await
            .context("writing hypervisor API request")?;

        let mut reader = BufReader::new(read_half);
        let mut status_line = String::new();
        reader
            .read_line(&mut status_line)
            .await
            .context("reading hypervisor API status line")?;
        let status = parse_status_line(&status_line)?;

        // Drain headers, keeping the body length for error reporting.
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line.trim().is_empty() {
                break;
            }
            if let Some(value) = line
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(str::trim)
            {
                content_length = value.parse().unwrap_or(0);
            }
        }

        if (200..300).contains(&status) {
            return Ok(());
        }

        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            let _ = reader.read_exact(&mut body).await;
        }
        let detail = String::from_utf8_lossy(&body);
        bail!(
            "hypervisor API PUT {} failed with status {}: {}",
            path,
            status,
            detail.trim()
        );
    }
}

fn build_put_request(path: &str, body: &str) -> String {
    format!(
        "PUT {} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    )
}

fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        bail!("malformed hypervisor API status line: {:?}", line.trim());
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .with_context(|| format!("malformed hypervisor API status line: {:?}", line.trim()))
}

/// Wait for a socket file to appear on disk, with timeout.
async fn wait_for_socket(socket_path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let poll_interval = Duration::from_millis(10);

    loop {
        if socket_path.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(socket = %socket_path.display(), "hypervisor API socket never appeared");
            bail!(
                "hypervisor API socket did not appear within {:?}: {}",
                timeout,
                socket_path.display()
            );
        }
        tokio::time::sleep(poll_interval).await;
    }
}
