//! The task-service shim: proxies the task lifecycle protocol to the
//! in-guest agent, booting the VM lazily on first Create and tearing it
//! down on Kill/Shutdown. One shim process owns at most one VM.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use vmshim_protocol::{
    CreateTaskRequest, DeleteResponse, ErrorCode, ErrorResponse, KillRequest, ShutdownRequest,
    StartRequest, StateRequest, TaskRequest, TaskResponse, TaskStatus,
};

use crate::config::Config;
use crate::events::{EventPublisher, TaskExit};
use crate::stdio;
use crate::vm::{self, vsock::AgentClient, VmInstance};

/// The VM and agent connection owned by this shim once Create has run.
struct VmTask {
    container_id: String,
    vm: VmInstance,
    agent: Arc<Mutex<AgentClient>>,
    /// Broadcast cancellation for stdio proxies and the state monitor.
    task_token: CancellationToken,
}

struct Inner {
    config: Config,
    publisher: EventPublisher,
    state: Mutex<Option<VmTask>>,
    /// Signals the server loop that Shutdown was requested and the process
    /// should exit once in-flight requests drain.
    shutdown_tx: mpsc::UnboundedSender<()>,
}

#[derive(Clone)]
pub struct TaskService {
    inner: Arc<Inner>,
}

impl TaskService {
    /// Build the service. The returned receiver fires when Shutdown asks the
    /// process to exit.
    pub fn new(config: Config, publisher: EventPublisher) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Inner {
                    config,
                    publisher,
                    state: Mutex::new(None),
                    shutdown_tx,
                }),
            },
            shutdown_rx,
        )
    }

    /// Dispatch one task request.
    pub async fn handle(&self, req: TaskRequest) -> TaskResponse {
        debug!(op = req.op(), id = req.task_id(), "task request");
        match req {
            TaskRequest::Create(r) => self.create(r).await,
            TaskRequest::Start(r) => self.start(r).await,
            TaskRequest::Kill(r) => self.kill(r).await,
            TaskRequest::Shutdown(r) => self.shutdown(r).await,
            other => self.forward(other).await,
        }
    }

    /// Plain proxy for every method without shim-side behavior.
    async fn forward(&self, req: TaskRequest) -> TaskResponse {
        let Some((agent, _token)) = self.task_handles().await else {
            return error_response(ErrorCode::FailedPrecondition, "no VM started for this shim");
        };
        let result = agent.lock().await.call(&req).await;
        match result {
            Ok(resp) => resp,
            Err(e) => error_response(ErrorCode::Internal, e),
        }
    }

    async fn create(&self, mut req: CreateTaskRequest) -> TaskResponse {
        info!(
            id = %req.id,
            bundle = %req.bundle,
            terminal = req.terminal,
            stdin = %req.stdin,
            stdout = %req.stdout,
            stderr = %req.stderr,
            "creating task"
        );

        // First Create boots the VM; the lock also serializes racing Creates.
        let (agent, token, cid) = {
            let mut state = self.inner.state.lock().await;
            if state.is_none() {
                let task_token = CancellationToken::new();
                match vm::start(&self.inner.config, &req.rootfs, &task_token).await {
                    Ok((vm, agent)) => {
                        *state = Some(VmTask {
                            container_id: req.id.clone(),
                            vm,
                            agent: Arc::new(Mutex::new(agent)),
                            task_token,
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to start VM");
                        return error_response(e.code(), e);
                    }
                }
            }
            let task = state.as_ref().unwrap();
            (task.agent.clone(), task.task_token.clone(), task.vm.cid)
        };

        // Pack the bundle's config.json next to any caller options so the
        // agent can recreate the bundle inside the VM.
        match pack_bundle(Path::new(&req.bundle), req.options.take()) {
            Ok(options) => req.options = Some(options),
            Err(e) => return error_response(ErrorCode::Internal, e),
        }

        let (stdin, stdout, stderr) = (req.stdin.clone(), req.stdout.clone(), req.stderr.clone());

        let resp = agent.lock().await.call(&TaskRequest::Create(req)).await;
        match resp {
            Ok(TaskResponse::Created(created)) => {
                stdio::spawn_proxies(&token, cid, stdin, stdout, stderr);
                info!(pid = created.pid, "successfully created task");
                TaskResponse::Created(created)
            }
            Ok(other) => other,
            Err(e) => {
                error!(error = %e, "create failed");
                error_response(ErrorCode::Internal, e)
            }
        }
    }

    async fn start(&self, req: StartRequest) -> TaskResponse {
        let Some((agent, token)) = self.task_handles().await else {
            return error_response(ErrorCode::FailedPrecondition, "no VM started for this shim");
        };

        let resp = agent.lock().await.call(&TaskRequest::Start(req.clone())).await;
        match resp {
            Ok(TaskResponse::Started(started)) => {
                let monitor = self.clone();
                tokio::spawn(monitor.monitor_state(
                    agent,
                    token,
                    req.id,
                    req.exec_id,
                    started.pid,
                ));
                TaskResponse::Started(started)
            }
            Ok(other) => other,
            Err(e) => error_response(ErrorCode::Internal, e),
        }
    }

    /// Poll the task's state once per second; on Stopped publish the exit
    /// event and shut the shim down. Exits silently when the task token is
    /// cancelled first.
    async fn monitor_state(
        self,
        agent: Arc<Mutex<AgentClient>>,
        token: CancellationToken,
        id: String,
        exec_id: String,
        pid: u32,
    ) {
        let period = Duration::from_secs(1);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            let req = TaskRequest::State(StateRequest {
                id: id.clone(),
                exec_id: exec_id.clone(),
            });
            let state = match agent.lock().await.call(&req).await {
                Ok(TaskResponse::State(state)) => state,
                Ok(TaskResponse::Error(e)) => {
                    error!(code = ?e.code, message = %e.message, "error monitoring state");
                    continue;
                }
                Ok(other) => {
                    error!(response = ?other, "unexpected response while monitoring state");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "error monitoring state");
                    continue;
                }
            };

            if state.status == TaskStatus::Stopped {
                let container_id = {
                    let guard = self.inner.state.lock().await;
                    guard
                        .as_ref()
                        .map(|t| t.container_id.clone())
                        .unwrap_or_else(|| id.clone())
                };
                let event = TaskExit {
                    container_id: container_id.clone(),
                    id: container_id,
                    pid,
                    exit_status: state.exit_status,
                    exited_at: Utc::now(),
                };
                if let Err(e) = self.inner.publisher.publish(&event).await {
                    error!(error = %e, "failed to publish task exit");
                }
                self.shutdown(ShutdownRequest { id, now: true }).await;
                return;
            }
        }
    }

    /// Kill the task. The VM is torn down and the per-task context cancelled
    /// regardless of the agent's verdict; multi-container VMs are out of
    /// scope, so any kill ends the VM.
    async fn kill(&self, req: KillRequest) -> TaskResponse {
        let Some((agent, token)) = self.task_handles().await else {
            return error_response(ErrorCode::FailedPrecondition, "no VM started for this shim");
        };

        let resp = agent.lock().await.call(&TaskRequest::Kill(req)).await;

        debug!("stopping VM during kill");
        self.stop_vm().await;
        token.cancel();

        match resp {
            Ok(r) => r,
            Err(e) => error_response(ErrorCode::Internal, e),
        }
    }

    /// Shut the whole shim down: agent first (best effort), then the VM,
    /// then the per-task context, then signal the process to exit. Cleanup
    /// steps all run even when earlier ones fail.
    async fn shutdown(&self, req: ShutdownRequest) -> TaskResponse {
        info!(id = %req.id, now = req.now, "shutdown");

        if let Some((agent, _)) = self.task_handles().await {
            let call = async {
                agent.lock().await.call(&TaskRequest::Shutdown(req)).await
            };
            match tokio::time::timeout(Duration::from_secs(3), call).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "failed to shutdown agent"),
                Err(_) => debug!("agent shutdown timed out (expected while VM stops)"),
            }
        }

        debug!("stopping VM");
        let stop_err = self.stop_vm().await;

        if let Some((_, token)) = self.task_handles().await {
            token.cancel();
        }

        let _ = self.inner.shutdown_tx.send(());

        match stop_err {
            Some(e) => error_response(ErrorCode::Internal, e),
            None => TaskResponse::Empty,
        }
    }

    async fn stop_vm(&self) -> Option<anyhow::Error> {
        let mut state = self.inner.state.lock().await;
        if let Some(task) = state.as_mut() {
            if let Err(e) = task.vm.stop().await {
                error!(error = %e, "failed to stop VM");
                return Some(e);
            }
        }
        None
    }

    async fn task_handles(&self) -> Option<(Arc<Mutex<AgentClient>>, CancellationToken)> {
        let state = self.inner.state.lock().await;
        state
            .as_ref()
            .map(|t| (t.agent.clone(), t.task_token.clone()))
    }
}

/// Synthetic response for the out-of-band cleanup command: the task is
/// reported as killed, nothing else to reap.
pub fn cleanup_response() -> DeleteResponse {
    DeleteResponse {
        pid: 0,
        exit_status: 128 + libc::SIGKILL as u32,
        exited_at: Utc::now(),
    }
}

fn error_response(code: ErrorCode, err: impl std::fmt::Display) -> TaskResponse {
    TaskResponse::Error(ErrorResponse {
        code,
        message: err.to_string(),
    })
}

/// Read the bundle's config.json and pack it, together with the caller's
/// options, into the envelope the agent expects.
fn pack_bundle(bundle: &Path, options: Option<serde_json::Value>) -> Result<serde_json::Value> {
    let spec_path = bundle.join("config.json");
    let json_spec = std::fs::read(&spec_path)
        .with_context(|| format!("reading bundle spec {}", spec_path.display()))?;

    let extra = vmshim_protocol::ExtraData {
        json_spec: base64::engine::general_purpose::STANDARD.encode(&json_spec),
        options,
    };
    serde_json::to_value(&extra).context("serializing task options envelope")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmshim_protocol::VmMount;

    fn service() -> (TaskService, mpsc::UnboundedReceiver<()>) {
        TaskService::new(Config::default(), EventPublisher::Null)
    }

    #[tokio::test]
    async fn forward_without_vm_is_failed_precondition() {
        let (svc, _rx) = service();
        let resp = svc
            .handle(TaskRequest::Pause(vmshim_protocol::PauseRequest {
                id: "t".into(),
            }))
            .await;
        match resp {
            TaskResponse::Error(e) => assert_eq!(e.code, ErrorCode::FailedPrecondition),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn kill_without_vm_is_failed_precondition() {
        let (svc, _rx) = service();
        let resp = svc
            .handle(TaskRequest::Kill(KillRequest {
                id: "t".into(),
                exec_id: String::new(),
                signal: 15,
                all: false,
            }))
            .await;
        assert!(matches!(
            resp,
            TaskResponse::Error(ErrorResponse {
                code: ErrorCode::FailedPrecondition,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn create_rejects_non_ext4_rootfs_before_boot() {
        let (svc, _rx) = service();
        let resp = svc
            .handle(TaskRequest::Create(CreateTaskRequest {
                id: "t".into(),
                bundle: "/nonexistent".into(),
                rootfs: vec![VmMount {
                    source: "/foo".into(),
                    fstype: "xfs".into(),
                    options: vec![],
                }],
                terminal: false,
                stdin: String::new(),
                stdout: String::new(),
                stderr: String::new(),
                checkpoint: String::new(),
                options: None,
            }))
            .await;
        match resp {
            TaskResponse::Error(e) => {
                assert_eq!(e.code, ErrorCode::InvalidArgument);
                assert!(e.message.contains("xfs"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        // The failed boot left no VM behind.
        assert!(svc.task_handles().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_without_vm_still_signals_exit() {
        let (svc, mut rx) = service();
        let resp = svc
            .handle(TaskRequest::Shutdown(ShutdownRequest {
                id: "t".into(),
                now: true,
            }))
            .await;
        assert!(matches!(resp, TaskResponse::Empty));
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn cleanup_reports_sigkill() {
        let resp = cleanup_response();
        assert_eq!(resp.exit_status, 137);
        assert_eq!(resp.pid, 0);
    }

    #[test]
    fn pack_bundle_embeds_spec_and_options() {
        let dir = tempfile::tempdir().unwrap();
        let spec = br#"{"ociVersion":"1.0.2"}"#;
        std::fs::write(dir.path().join("config.json"), spec).unwrap();

        let packed = pack_bundle(
            dir.path(),
            Some(serde_json::json!({"no_pivot_root": true})),
        )
        .unwrap();

        let extra: vmshim_protocol::ExtraData = serde_json::from_value(packed).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&extra.json_spec)
            .unwrap();
        assert_eq!(decoded, spec);
        assert_eq!(extra.options.unwrap()["no_pivot_root"], true);
    }

    #[test]
    fn pack_bundle_missing_spec_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pack_bundle(dir.path(), None).is_err());
    }
}
