//! Kernel error types.

use thiserror::Error;

/// Kernel result type.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors raised by the kernel framework and the Python adapter.
#[derive(Error, Debug)]
pub enum KernelError {
    /// The frontend closed its stdin connection or never opened one.
    #[error("frontend disconnected: {0}")]
    Disconnected(String),

    /// Input was requested while the current request disallows stdin.
    #[error("This frontend does not support input requests")]
    StdinNotAllowed,

    /// An input hook is already installed on the interpreter.
    #[error("input redirection already active")]
    AlreadyRedirected,

    /// Message signature missing or not matching the connection key.
    #[error("message signature does not match")]
    InvalidSignature,

    /// Malformed or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration or connection file.
    #[error("config error: {0}")]
    Config(String),

    /// Error raised by the embedded interpreter.
    #[error("python error: {0}")]
    Python(#[from] pyo3::PyErr),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
