//! The link capability a [`DeviceSession`](crate::session::DeviceSession) drives.
//!
//! A transport hides the radio: how the device was found, how it is addressed and how
//! GATT operations are performed. The session only needs to open and close the link,
//! look up the characteristics of one service, subscribe to notifications and write
//! request frames.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Raw notification payloads in arrival order. The sender side is dropped when the link goes away.
pub type Inbound = mpsc::UnboundedReceiver<Vec<u8>>;

/// Errors reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The operation needs an open link.
    #[error("link is not open")]
    NotConnected,
    /// The transport handle was lost and the session cannot reconnect.
    #[error("transport is unavailable")]
    Unavailable,
    /// Characteristic was not found on the discovered service.
    #[error("unknown characteristic {0}")]
    UnknownCharacteristic(Uuid),
    /// Any other failure of the underlying link.
    #[error("{0}")]
    Link(String),
    /// An error from the `bluest` crate.
    #[cfg(feature = "ble")]
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluest::Error),
}

#[async_trait]
pub trait Transport: Send + 'static {
    /// Establish the link to the device.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Look up `service` and return the ids of its characteristics, or `None` if the
    /// device does not expose it.
    async fn discover(&mut self, service: Uuid) -> Result<Option<Vec<Uuid>>, TransportError>;

    /// Enable notifications on `characteristic`.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<Inbound, TransportError>;

    /// Write one frame to `characteristic`.
    async fn write(&mut self, characteristic: Uuid, frame: &[u8]) -> Result<(), TransportError>;

    /// Release the link. Closing a link that is not open succeeds.
    async fn close(&mut self) -> Result<(), TransportError>;
}
