//! Framed task-service server over the daemon-facing Unix socket.

use tokio::net::UnixListener;
use tracing::{debug, warn};

use vmshim_protocol::{self as protocol, TaskRequest, WireError};

use crate::service::TaskService;

/// Accept loop. Runs until the listener fails; process shutdown is driven
/// by the caller selecting on the service's shutdown channel and signals.
pub async fn serve(listener: UnixListener, service: TaskService) -> anyhow::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        debug!("daemon connection accepted");
        tokio::spawn(handle_connection(stream, service.clone()));
    }
}

async fn handle_connection(stream: tokio::net::UnixStream, service: TaskService) {
    let (mut read_half, mut write_half) = stream.into_split();

    loop {
        let req: TaskRequest = match protocol::read_message(&mut read_half).await {
            Ok(req) => req,
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("daemon connection closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read task request");
                return;
            }
        };

        let resp = service.handle(req).await;
        if let Err(e) = protocol::write_message(&mut write_half, &resp).await {
            warn!(error = %e, "failed to write task response");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventPublisher;
    use vmshim_protocol::{PauseRequest, TaskResponse};

    #[tokio::test]
    async fn serve_answers_framed_requests() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("shim.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let (service, _shutdown_rx) = TaskService::new(Config::default(), EventPublisher::Null);
        tokio::spawn(serve(listener, service));

        let stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();

        // No VM is running, so any proxied request earns a typed error
        // response rather than a dropped connection.
        let req = TaskRequest::Pause(PauseRequest { id: "t".into() });
        protocol::write_message(&mut write_half, &req).await.unwrap();

        let resp: TaskResponse = protocol::read_message(&mut read_half).await.unwrap();
        assert!(matches!(resp, TaskResponse::Error(_)));

        // The connection stays usable for further requests.
        protocol::write_message(&mut write_half, &req).await.unwrap();
        let resp: TaskResponse = protocol::read_message(&mut read_half).await.unwrap();
        assert!(matches!(resp, TaskResponse::Error(_)));
    }
}
