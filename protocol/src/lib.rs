use serde::{Deserialize, Serialize};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Vsock port the in-guest task agent listens on.
pub const TASK_SERVICE_PORT: u32 = 10789;

/// Vsock ports for the three stdio streams of the task's init process.
/// The host shim dials these; the guest agent bridges them to the process.
pub const STDIN_PORT: u32 = 11000;
pub const STDOUT_PORT: u32 = 11001;
pub const STDERR_PORT: u32 = 11002;

/// Buffer size used when copying stdio bytes between fifos and vsock.
pub const STDIO_BUFFER_SIZE: usize = 1024;

/// Maximum message size (16 MiB) to prevent unbounded allocations.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Framing: each message is a 4-byte big-endian length prefix followed by JSON bytes.
/// The length prefix encodes the size of the JSON payload only (not including itself).

// ---------------------------------------------------------------------------
// Task-service requests (host daemon -> shim, and shim -> guest agent)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskRequest {
    /// Create a task from an OCI bundle.
    Create(CreateTaskRequest),

    /// Start a created task or exec.
    Start(StartRequest),

    /// Delete a stopped task or exec, reaping its resources.
    Delete(DeleteRequest),

    /// Run an additional process inside the task.
    Exec(ExecProcessRequest),

    /// Resize the pty of a process.
    ResizePty(ResizePtyRequest),

    /// Query runtime state of a process.
    State(StateRequest),

    /// Pause the whole task.
    Pause(PauseRequest),

    /// Resume a paused task.
    Resume(ResumeRequest),

    /// Deliver a signal to a process.
    Kill(KillRequest),

    /// List all pids inside the task.
    Pids(PidsRequest),

    /// Close a process's stdin.
    CloseIo(CloseIoRequest),

    /// Checkpoint the task to a path.
    Checkpoint(CheckpointTaskRequest),

    /// Query shim/task pid information.
    Connect(ConnectRequest),

    /// Shut the service down.
    Shutdown(ShutdownRequest),

    /// Collect task resource statistics.
    Stats(StatsRequest),

    /// Update task resource limits.
    Update(UpdateTaskRequest),

    /// Wait for a process to exit.
    Wait(WaitRequest),
}

impl TaskRequest {
    /// Operation name for logging.
    pub fn op(&self) -> &'static str {
        match self {
            TaskRequest::Create(_) => "create",
            TaskRequest::Start(_) => "start",
            TaskRequest::Delete(_) => "delete",
            TaskRequest::Exec(_) => "exec",
            TaskRequest::ResizePty(_) => "resize_pty",
            TaskRequest::State(_) => "state",
            TaskRequest::Pause(_) => "pause",
            TaskRequest::Resume(_) => "resume",
            TaskRequest::Kill(_) => "kill",
            TaskRequest::Pids(_) => "pids",
            TaskRequest::CloseIo(_) => "close_io",
            TaskRequest::Checkpoint(_) => "checkpoint",
            TaskRequest::Connect(_) => "connect",
            TaskRequest::Shutdown(_) => "shutdown",
            TaskRequest::Stats(_) => "stats",
            TaskRequest::Update(_) => "update",
            TaskRequest::Wait(_) => "wait",
        }
    }

    /// Task id the request addresses.
    pub fn task_id(&self) -> &str {
        match self {
            TaskRequest::Create(r) => &r.id,
            TaskRequest::Start(r) => &r.id,
            TaskRequest::Delete(r) => &r.id,
            TaskRequest::Exec(r) => &r.id,
            TaskRequest::ResizePty(r) => &r.id,
            TaskRequest::State(r) => &r.id,
            TaskRequest::Pause(r) => &r.id,
            TaskRequest::Resume(r) => &r.id,
            TaskRequest::Kill(r) => &r.id,
            TaskRequest::Pids(r) => &r.id,
            TaskRequest::CloseIo(r) => &r.id,
            TaskRequest::Checkpoint(r) => &r.id,
            TaskRequest::Connect(r) => &r.id,
            TaskRequest::Shutdown(r) => &r.id,
            TaskRequest::Stats(r) => &r.id,
            TaskRequest::Update(r) => &r.id,
            TaskRequest::Wait(r) => &r.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub id: String,
    /// Host path of the OCI bundle directory (contains config.json).
    pub bundle: String,
    /// Rootfs block devices supplied by the snapshotter, attached to the VM
    /// as drives 2..N in order.
    #[serde(default)]
    pub rootfs: Vec<VmMount>,
    #[serde(default)]
    pub terminal: bool,
    /// Host-side named pipe paths; empty string means the stream is unused.
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub checkpoint: String,
    /// Opaque runtime options; the shim repacks these into [`ExtraData`]
    /// together with the bundle's config.json before forwarding.
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

/// A block-device mount handed from the snapshotter to task Create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMount {
    /// Device path on the host, e.g. "/dev/mapper/pool-snap-4".
    pub source: String,
    /// Filesystem type; the shim only accepts "ext4".
    pub fstype: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub id: String,
    #[serde(default)]
    pub exec_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub id: String,
    #[serde(default)]
    pub exec_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    pub id: String,
    pub exec_id: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// OCI process spec for the exec'd process.
    #[serde(default)]
    pub spec: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePtyRequest {
    pub id: String,
    #[serde(default)]
    pub exec_id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub id: String,
    #[serde(default)]
    pub exec_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    pub id: String,
    #[serde(default)]
    pub exec_id: String,
    /// Signal number to deliver (default: 15 = SIGTERM).
    #[serde(default = "default_kill_signal")]
    pub signal: u32,
    /// Deliver to all processes in the task, not just init.
    #[serde(default)]
    pub all: bool,
}

fn default_kill_signal() -> u32 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseIoRequest {
    pub id: String,
    #[serde(default)]
    pub exec_id: String,
    #[serde(default)]
    pub stdin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTaskRequest {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub id: String,
    #[serde(default)]
    pub now: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    pub id: String,
    #[serde(default)]
    pub resources: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRequest {
    pub id: String,
    #[serde(default)]
    pub exec_id: String,
}

/// Envelope the shim packs into Create's options so the guest agent can
/// recreate the bundle inside the VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraData {
    /// Base64 of the bundle's config.json bytes.
    pub json_spec: String,
    /// Original caller-supplied options, carried through untouched.
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Task-service responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskResponse {
    /// Task created; carries the init pid inside the guest.
    Created(CreateTaskResponse),

    /// Process started.
    Started(StartResponse),

    /// Process deleted; carries its exit record.
    Deleted(DeleteResponse),

    /// Runtime state of a process.
    State(StateResponse),

    /// Pids inside the task.
    Pids(PidsResponse),

    /// Shim/task pid information.
    Connected(ConnectResponse),

    /// Exit record from Wait.
    Waited(WaitResponse),

    /// Task resource statistics.
    Stats(StatsResponse),

    /// Acknowledgment for operations with no payload.
    Empty,

    /// Error response.
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub id: String,
    #[serde(default)]
    pub bundle: String,
    pub pid: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub exit_status: u32,
    #[serde(default)]
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsResponse {
    pub pids: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub shim_pid: u32,
    pub task_pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(default)]
    pub stats: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Stable error kinds carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Busy,
    Unavailable,
    DeadlineExceeded,
    Internal,
    NotImplemented,
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Encode a message as length-prefixed JSON bytes.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode a length-prefixed JSON message from a byte buffer.
/// Returns the deserialized message and the number of bytes consumed.
pub fn decode_message<T: serde::de::DeserializeOwned>(
    buf: &[u8],
) -> Result<(T, usize), Box<dyn std::error::Error>> {
    if buf.len() < 4 {
        return Err("buffer too short for length prefix".into());
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Err("buffer too short for payload".into());
    }
    let msg: T = serde_json::from_slice(&buf[4..4 + len])?;
    Ok((msg, 4 + len))
}

/// Read a length-prefixed JSON message from an async reader.
pub async fn read_message<R: AsyncReadExt + Unpin, T: serde::de::DeserializeOwned>(
    reader: &mut R,
) -> Result<T, WireError> {
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let msg = serde_json::from_slice(&buf)?;
    Ok(msg)
}

/// Write a length-prefixed JSON message to an async writer.
pub async fn write_message<W: AsyncWriteExt + Unpin, T: Serialize>(
    writer: &mut W,
    msg: &T,
) -> Result<(), WireError> {
    let encoded = encode_message(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // TaskRequest serialization round-trips
    // -----------------------------------------------------------------------

    fn roundtrip_request(req: &TaskRequest) -> TaskRequest {
        let json = serde_json::to_string(req).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_request_create_roundtrip() {
        let req = TaskRequest::Create(CreateTaskRequest {
            id: "task-1".into(),
            bundle: "/run/bundles/task-1".into(),
            rootfs: vec![VmMount {
                source: "/dev/mapper/pool-snap-7".into(),
                fstype: "ext4".into(),
                options: vec![],
            }],
            terminal: false,
            stdin: "/run/fifo/stdin".into(),
            stdout: "/run/fifo/stdout".into(),
            stderr: String::new(),
            checkpoint: String::new(),
            options: None,
        });
        let rt = roundtrip_request(&req);
        if let TaskRequest::Create(c) = rt {
            assert_eq!(c.id, "task-1");
            assert_eq!(c.rootfs.len(), 1);
            assert_eq!(c.rootfs[0].fstype, "ext4");
            assert_eq!(c.stdin, "/run/fifo/stdin");
            assert!(c.stderr.is_empty());
        } else {
            panic!("expected Create variant");
        }
    }

    #[test]
    fn test_request_create_defaults() {
        // A minimal Create only needs id and bundle on the wire.
        let json = r#"{"type":"Create","id":"t","bundle":"/b"}"#;
        let req: TaskRequest = serde_json::from_str(json).unwrap();
        if let TaskRequest::Create(c) = req {
            assert!(c.rootfs.is_empty());
            assert!(!c.terminal);
            assert!(c.stdin.is_empty());
            assert!(c.options.is_none());
        } else {
            panic!("expected Create variant");
        }
    }

    #[test]
    fn test_request_state_roundtrip() {
        let req = TaskRequest::State(StateRequest {
            id: "task-1".into(),
            exec_id: "exec-2".into(),
        });
        let rt = roundtrip_request(&req);
        if let TaskRequest::State(s) = rt {
            assert_eq!(s.id, "task-1");
            assert_eq!(s.exec_id, "exec-2");
        } else {
            panic!("expected State variant");
        }
    }

    #[test]
    fn test_request_kill_roundtrip() {
        let req = TaskRequest::Kill(KillRequest {
            id: "task-1".into(),
            exec_id: String::new(),
            signal: 9,
            all: true,
        });
        let rt = roundtrip_request(&req);
        if let TaskRequest::Kill(k) = rt {
            assert_eq!(k.signal, 9);
            assert!(k.all);
        } else {
            panic!("expected Kill variant");
        }
    }

    #[test]
    fn test_kill_default_signal() {
        // When signal is not in JSON, it should default to 15 (SIGTERM).
        let json = r#"{"type":"Kill","id":"t"}"#;
        let req: TaskRequest = serde_json::from_str(json).unwrap();
        if let TaskRequest::Kill(k) = req {
            assert_eq!(k.signal, 15);
            assert!(!k.all);
        } else {
            panic!("expected Kill variant");
        }
    }

    #[test]
    fn test_request_resize_pty_roundtrip() {
        let req = TaskRequest::ResizePty(ResizePtyRequest {
            id: "task-1".into(),
            exec_id: String::new(),
            width: 80,
            height: 24,
        });
        let rt = roundtrip_request(&req);
        if let TaskRequest::ResizePty(r) = rt {
            assert_eq!(r.width, 80);
            assert_eq!(r.height, 24);
        } else {
            panic!("expected ResizePty variant");
        }
    }

    #[test]
    fn test_request_shutdown_roundtrip() {
        let req = TaskRequest::Shutdown(ShutdownRequest {
            id: "task-1".into(),
            now: true,
        });
        let rt = roundtrip_request(&req);
        if let TaskRequest::Shutdown(s) = rt {
            assert!(s.now);
        } else {
            panic!("expected Shutdown variant");
        }
    }

    // -----------------------------------------------------------------------
    // TaskResponse serialization round-trips
    // -----------------------------------------------------------------------

    fn roundtrip_response(resp: &TaskResponse) -> TaskResponse {
        let json = serde_json::to_string(resp).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_response_created_roundtrip() {
        let resp = TaskResponse::Created(CreateTaskResponse { pid: 1234 });
        let rt = roundtrip_response(&resp);
        if let TaskResponse::Created(c) = rt {
            assert_eq!(c.pid, 1234);
        } else {
            panic!("expected Created variant");
        }
    }

    #[test]
    fn test_response_deleted_roundtrip() {
        let resp = TaskResponse::Deleted(DeleteResponse {
            pid: 1234,
            exit_status: 137,
            exited_at: Utc::now(),
        });
        let rt = roundtrip_response(&resp);
        if let TaskResponse::Deleted(d) = rt {
            assert_eq!(d.pid, 1234);
            assert_eq!(d.exit_status, 137);
        } else {
            panic!("expected Deleted variant");
        }
    }

    #[test]
    fn test_response_state_roundtrip() {
        let resp = TaskResponse::State(StateResponse {
            id: "task-1".into(),
            bundle: "/b".into(),
            pid: 42,
            status: TaskStatus::Stopped,
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            terminal: false,
            exit_status: 42,
            exited_at: Some(Utc::now()),
        });
        let rt = roundtrip_response(&resp);
        if let TaskResponse::State(s) = rt {
            assert_eq!(s.status, TaskStatus::Stopped);
            assert_eq!(s.exit_status, 42);
            assert!(s.exited_at.is_some());
        } else {
            panic!("expected State variant");
        }
    }

    #[test]
    fn test_response_empty_roundtrip() {
        let resp = TaskResponse::Empty;
        let rt = roundtrip_response(&resp);
        assert!(matches!(rt, TaskResponse::Empty));
    }

    #[test]
    fn test_response_error_roundtrip() {
        let resp = TaskResponse::Error(ErrorResponse {
            code: ErrorCode::NotFound,
            message: "no such task".into(),
        });
        let rt = roundtrip_response(&resp);
        if let TaskResponse::Error(e) = rt {
            assert_eq!(e.code, ErrorCode::NotFound);
            assert_eq!(e.message, "no such task");
        } else {
            panic!("expected Error variant");
        }
    }

    #[test]
    fn test_all_error_codes_roundtrip() {
        let codes = [
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::InvalidArgument,
            ErrorCode::FailedPrecondition,
            ErrorCode::Busy,
            ErrorCode::Unavailable,
            ErrorCode::DeadlineExceeded,
            ErrorCode::Internal,
            ErrorCode::NotImplemented,
        ];
        for code in codes {
            let resp = TaskResponse::Error(ErrorResponse {
                code,
                message: format!("test {:?}", code),
            });
            let json = serde_json::to_string(&resp).unwrap();
            let rt: TaskResponse = serde_json::from_str(&json).unwrap();
            if let TaskResponse::Error(e) = rt {
                assert_eq!(e.code, code);
            } else {
                panic!("expected Error variant");
            }
        }
    }

    #[test]
    fn test_task_status_roundtrip() {
        for status in [
            TaskStatus::Created,
            TaskStatus::Running,
            TaskStatus::Stopped,
            TaskStatus::Paused,
            TaskStatus::Pausing,
            TaskStatus::Unknown,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let rt: TaskStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(rt, status);
        }
    }

    // -----------------------------------------------------------------------
    // ExtraData envelope
    // -----------------------------------------------------------------------

    #[test]
    fn test_extra_data_roundtrip() {
        let extra = ExtraData {
            json_spec: "eyJvY2lWZXJzaW9uIjoiMS4wLjAifQ==".into(),
            options: Some(serde_json::json!({"no_pivot_root": true})),
        };
        let json = serde_json::to_string(&extra).unwrap();
        let rt: ExtraData = serde_json::from_str(&json).unwrap();
        assert_eq!(rt.json_spec, extra.json_spec);
        assert_eq!(rt.options.unwrap()["no_pivot_root"], true);
    }

    #[test]
    fn test_extra_data_without_options() {
        let json = r#"{"json_spec":"e30="}"#;
        let extra: ExtraData = serde_json::from_str(json).unwrap();
        assert_eq!(extra.json_spec, "e30=");
        assert!(extra.options.is_none());
    }

    // -----------------------------------------------------------------------
    // Length-prefixed framing
    // -----------------------------------------------------------------------

    #[test]
    fn test_encode_decode_framing() {
        let req = TaskRequest::Pause(PauseRequest { id: "t".into() });
        let encoded = encode_message(&req).unwrap();

        // First 4 bytes are big-endian length.
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len() - 4);

        let (decoded, consumed): (TaskRequest, usize) = decode_message(&encoded).unwrap();
        assert!(matches!(decoded, TaskRequest::Pause(_)));
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_decode_buffer_too_short() {
        let result = decode_message::<TaskRequest>(&[0, 0]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_payload_incomplete() {
        // Length prefix says 100 bytes but only 4 bytes of payload follow.
        let buf = vec![0, 0, 0, 100, 1, 2, 3, 4];
        let result = decode_message::<TaskRequest>(&buf);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_read_message_roundtrip() {
        let req = TaskRequest::Wait(WaitRequest {
            id: "task-1".into(),
            exec_id: String::new(),
        });

        let (client, server) = tokio::io::duplex(1024);
        let (mut server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        write_message(&mut client_write, &req).await.unwrap();

        let decoded: TaskRequest = read_message(&mut server_read).await.unwrap();
        if let TaskRequest::Wait(w) = decoded {
            assert_eq!(w.id, "task-1");
        } else {
            panic!("expected Wait variant");
        }
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_frame() {
        let (client, server) = tokio::io::duplex(64);
        let (mut server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        // A length prefix beyond MAX_MESSAGE_SIZE must fail before any
        // payload allocation happens.
        client_write
            .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let result: Result<TaskRequest, WireError> = read_message(&mut server_read).await;
        assert!(matches!(
            result,
            Err(WireError::MessageTooLarge { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Port constants
    // -----------------------------------------------------------------------

    #[test]
    fn test_port_constants() {
        assert_eq!(TASK_SERVICE_PORT, 10789);
        assert_eq!(STDIN_PORT, 11000);
        assert_eq!(STDOUT_PORT, 11001);
        assert_eq!(STDERR_PORT, 11002);
        // The three stdio ports must be distinct from each other and from
        // the task-service port.
        let ports = [TASK_SERVICE_PORT, STDIN_PORT, STDOUT_PORT, STDERR_PORT];
        for (i, a) in ports.iter().enumerate() {
            for b in &ports[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_max_message_size() {
        assert_eq!(MAX_MESSAGE_SIZE, 16 * 1024 * 1024);
    }

    #[test]
    fn test_stdio_buffer_size() {
        assert_eq!(STDIO_BUFFER_SIZE, 1024);
    }

    #[test]
    fn test_request_op_and_task_id() {
        let req = TaskRequest::Kill(KillRequest {
            id: "task-9".into(),
            exec_id: String::new(),
            signal: 15,
            all: false,
        });
        assert_eq!(req.op(), "kill");
        assert_eq!(req.task_id(), "task-9");

        let req = TaskRequest::Create(CreateTaskRequest {
            id: "task-1".into(),
            bundle: "/b".into(),
            rootfs: vec![],
            terminal: false,
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            checkpoint: String::new(),
            options: None,
        });
        assert_eq!(req.op(), "create");
        assert_eq!(req.task_id(), "task-1");
    }
}
