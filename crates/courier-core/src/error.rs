//! The error taxonomy surfaced by the transport, store, and CLI layers.

use thiserror::Error;

/// Errors surfaced to callers of the Courier engines (`spec.md` §7).
#[derive(Debug, Error)]
pub enum CourierError {
    /// Storage cap exceeded, or an invalid TTL was requested at submission.
    #[error("submit rejected: {0}")]
    SubmitRejected(String),

    /// Socket bind/send failure, or a transient I/O fault that persisted
    /// past the single built-in retry.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// A decoded message was structurally invalid (short, unknown kind, or
    /// length-inconsistent).
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A DATA message's CRC-32 did not match its payload.
    #[error("checksum mismatch")]
    BadChecksum,

    /// The message's version byte did not match the protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The bundle's TTL elapsed before it reached DELIVERED.
    #[error("bundle expired")]
    BundleExpired,

    /// A custody record exhausted its retry budget without a downstream
    /// confirmation. Purely internal — the upstream holder is not informed
    /// and continues retrying independently.
    #[error("custody retries exhausted")]
    CustodyRetryExhausted,
}

pub type Result<T> = std::result::Result<T, CourierError>;
