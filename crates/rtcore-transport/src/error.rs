use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve host {host}: {reason}")]
    HostResolution { host: String, reason: String },

    #[error("gave up resolving {host} after {attempts} attempts")]
    ResolveExhausted { host: String, attempts: u32 },

    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("host unreachable: peer {peer}")]
    HostUnreachable { peer: u32 },

    #[error("endpoint already in use: {addr}")]
    EndpointInUse { addr: String },

    #[error("invalid endpoint {addr}: {reason}")]
    InvalidEndpoint { addr: String, reason: String },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("unknown {field} value: {value}")]
    UnknownDiscriminant { field: &'static str, value: u8 },

    #[error("multiplexer already started")]
    AlreadyStarted,

    #[error("multiplexer not running")]
    NotRunning,

    #[error("send queue full on {endpoint}")]
    QueueFull { endpoint: String },

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
