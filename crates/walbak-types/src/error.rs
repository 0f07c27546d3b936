use thiserror::Error;

pub type Result<T> = std::result::Result<T, WalbakError>;

#[derive(Debug, Error)]
pub enum WalbakError {
    /// A state-machine precondition did not hold.
    #[error("bad state: volume '{vol}' is '{current}', expected '{expected}'")]
    BadState {
        vol: String,
        current: String,
        expected: String,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("volume '{0}' is stopping")]
    Stopping(String),

    /// Queue closed: no more items will arrive.
    #[error("queue closed")]
    QueueClosed,

    /// Queue failed: some pipeline stage signalled an error.
    #[error("queue error")]
    QueueFailed,

    /// The peer rejected the request with a textual message
    /// (too-new-diff, different-uuid, ...). Not a connection failure.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("{0}")]
    Other(String),
}

impl WalbakError {
    /// Message sent back to the client when a handler fails.
    /// Keeps the kind word first so controllers can match on it.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}
