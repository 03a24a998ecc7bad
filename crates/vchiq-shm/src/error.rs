//! Transport error taxonomy.

use vchiq_primitives::sem::WaitError;

/// Error returned by transport operations.
///
/// Peer protocol violations are never surfaced here; the drain loop logs and
/// skips them so the slot stream keeps moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// A bounded pool (ports, completion nodes, fragments) is exhausted
    OutOfMemory,
    /// A bounded or polled wait expired
    Timeout,
    /// The operation was torn down mid-wait
    Cancelled,
    /// Caller error: bad size, wrong service state, malformed argument
    InvalidParameter,
    /// Non-blocking dequeue found nothing
    NoMoreEntries,
    /// No entity matches the given handle or port
    NotFound,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::OutOfMemory => write!(f, "out of memory"),
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::Cancelled => write!(f, "cancelled"),
            TransportError::InvalidParameter => write!(f, "invalid parameter"),
            TransportError::NoMoreEntries => write!(f, "no more entries"),
            TransportError::NotFound => write!(f, "not found"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<WaitError> for TransportError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => TransportError::Timeout,
            WaitError::Cancelled => TransportError::Cancelled,
        }
    }
}
