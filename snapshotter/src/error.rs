use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds surfaced by the snapshotter and its pool controller.
///
/// Every variant carries a human-readable message naming the snapshot key or
/// device involved. `Clone` is required so an aggregated close result can be
/// handed out repeatedly.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("{0}: device is busy")]
    Busy(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}: not implemented")]
    NotImplemented(String),

    #[error("device '{0}' is in a faulty state")]
    Faulty(String),
}

impl Error {
    /// Wrap an I/O error with context as an Internal error.
    pub fn io(context: &str, err: std::io::Error) -> Self {
        Error::Internal(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_subject() {
        assert_eq!(
            Error::NotFound("snapshot a".into()).to_string(),
            "snapshot a: not found"
        );
        assert_eq!(
            Error::Busy("pool-snap-3".into()).to_string(),
            "pool-snap-3: device is busy"
        );
        assert_eq!(
            Error::Faulty("pool-snap-3".into()).to_string(),
            "device 'pool-snap-3' is in a faulty state"
        );
    }

    #[test]
    fn error_is_cloneable() {
        let err = Error::AlreadyExists("snapshot b".into());
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn io_wraps_context() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::io("opening metadata", io);
        let msg = err.to_string();
        assert!(msg.contains("opening metadata"));
        assert!(msg.contains("denied"));
    }
}
