use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DumpError>;

/// Classification of a failed HTTP exchange, derived from the transport.
///
/// The retry policy keys off this: connect/read/write failures are transient,
/// everything else is fatal for the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    CouldNotConnect,
    WriteError,
    ReadError,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::CouldNotConnect => "could not connect to server",
            TransportKind::WriteError => "error while writing request",
            TransportKind::ReadError => "error while reading response",
            TransportKind::Other => "transport error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("{kind}: {message}")]
    Transport {
        kind: TransportKind,
        message: String,
    },

    /// The server answered with an explicit error envelope or bad status.
    #[error("server error {num}: {message}")]
    Api { num: i64, message: String },

    #[error("got invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot write file '{path}': {message}")]
    FileWrite { path: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("too many retries: {0}")]
    RetriesExhausted(String),

    #[error("{0}")]
    Other(String),
}

impl DumpError {
    pub fn malformed(context: &str) -> Self {
        DumpError::InvalidResponse(format!("got malformed JSON response: {context}"))
    }
}
