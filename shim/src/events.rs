//! Task lifecycle events published to the host daemon's event bus.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

/// Topic the host daemon expects task exits on.
pub const TASK_EXIT_TOPIC: &str = "/tasks/exit";

/// Published exactly once when a task's init process stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExit {
    pub container_id: String,
    pub id: String,
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

/// Sink for task events.
///
/// `Binary` re-execs the daemon-supplied publish binary with the event JSON
/// on stdin, the convention the host daemon hands shims via its
/// publish-binary flag. `Channel` delivers in-process for tests. `Null`
/// drops events.
pub enum EventPublisher {
    Binary {
        binary: PathBuf,
        address: String,
        namespace: String,
    },
    Channel(mpsc::UnboundedSender<TaskExit>),
    Null,
}

impl EventPublisher {
    pub async fn publish(&self, event: &TaskExit) -> Result<()> {
        match self {
            EventPublisher::Binary {
                binary,
                address,
                namespace,
            } => {
                let payload =
                    serde_json::to_vec(event).context("serializing task exit event")?;

                debug!(
                    binary = %binary.display(),
                    topic = TASK_EXIT_TOPIC,
                    container_id = %event.container_id,
                    "publishing event"
                );

                let mut child = tokio::process::Command::new(binary)
                    .arg("--address")
                    .arg(address)
                    .arg("publish")
                    .arg("--topic")
                    .arg(TASK_EXIT_TOPIC)
                    .arg("--namespace")
                    .arg(namespace)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .with_context(|| format!("spawning publisher {}", binary.display()))?;

                if let Some(mut stdin) = child.stdin.take() {
                    stdin
                        .write_all(&payload)
                        .await
                        .context("writing event to publisher stdin")?;
                }
                let status = child.wait().await.context("waiting for publisher")?;
                if !status.success() {
                    bail!("publisher exited with {:?}", status.code());
                }
                Ok(())
            }
            EventPublisher::Channel(tx) => {
                tx.send(event.clone())
                    .map_err(|_| anyhow::anyhow!("event channel closed"))
            }
            EventPublisher::Null => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> TaskExit {
        TaskExit {
            container_id: "task-1".into(),
            id: "task-1".into(),
            pid: 1234,
            exit_status: 42,
            exited_at: Utc::now(),
        }
    }

    #[test]
    fn task_exit_serialization() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let rt: TaskExit = serde_json::from_str(&json).unwrap();
        assert_eq!(rt.container_id, "task-1");
        assert_eq!(rt.exit_status, 42);
    }

    #[test]
    fn exit_topic() {
        assert_eq!(TASK_EXIT_TOPIC, "/tasks/exit");
    }

    #[tokio::test]
    async fn channel_publisher_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publisher = EventPublisher::Channel(tx);

        publisher.publish(&sample_event()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.exit_status, 42);
    }

    #[tokio::test]
    async fn null_publisher_accepts_everything() {
        EventPublisher::Null.publish(&sample_event()).await.unwrap();
    }

    #[tokio::test]
    async fn binary_publisher_fails_on_missing_binary() {
        let publisher = EventPublisher::Binary {
            binary: PathBuf::from("/nonexistent/publisher"),
            address: "/run/host.sock".into(),
            namespace: "default".into(),
        };
        assert!(publisher.publish(&sample_event()).await.is_err());
    }
}
