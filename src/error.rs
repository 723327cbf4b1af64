use crate::transport::TransportError;
use uuid::Uuid;

/// Reasons an inbound frame is rejected by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the smallest valid frame, or a byte count pointing past the end.
    #[error("frame truncated")]
    Truncated,
    /// The device answered with an exception response (function code with bit 0x80 set).
    #[error("device rejected request with exception code {0:#04x}")]
    DeviceError(u8),
    /// The trailing CRC does not match the one computed over the frame.
    #[error("checksum mismatch - calculated={calculated:#06x} received={received:#06x}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The function code is not one of the supported read codes,
    /// or not the one the outstanding request used.
    #[error("unsupported function code {0:#04x}")]
    Unsupported(u8),
    /// A request asking for zero registers.
    #[error("request covers no registers")]
    EmptyRead,
}

/// Broad classes of failure, see [`Error::category`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Timing,
    Lifecycle,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Radio or link failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A malformed or rejected frame resolved the in-flight request.
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),
    /// No frame arrived before the request deadline.
    #[error("no response before the command deadline")]
    Timeout,
    /// Another request is already awaiting its response on this link.
    #[error("a request is already in flight")]
    Busy,
    #[error("timed out opening the link")]
    ConnectTimeout,
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("subscribing to notifications on {0} failed")]
    SubscribeFailed(Uuid),
    /// The link is closed, or was closed while the request was pending.
    #[error("device disconnected")]
    Disconnected,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transport(_) => ErrorCategory::Transport,
            Error::Protocol(_) => ErrorCategory::Protocol,
            Error::Timeout | Error::Busy => ErrorCategory::Timing,
            Error::ConnectTimeout
            | Error::ServiceNotFound(_)
            | Error::CharacteristicNotFound(_)
            | Error::SubscribeFailed(_)
            | Error::Disconnected => ErrorCategory::Lifecycle,
        }
    }
}

/// A specialized `Result` type for session operations.
pub type Result<T> = std::result::Result<T, Error>;
