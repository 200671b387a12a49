use uuid::Uuid;

/// Failures surfaced by the playback core to its callers.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("maximum concurrent sessions reached ({max})")]
    CapacityReached { max: usize },

    #[error("{0} not ready")]
    NotReady(String),

    #[error("session {0} not found or expired")]
    SessionNotFound(Uuid),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resolve media: {0:#}")]
    Resolve(anyhow::Error),

    #[error("probe media: {0:#}")]
    Probe(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;
