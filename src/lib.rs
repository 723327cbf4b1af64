#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bluetti_lib
//!
//! This crate talks to Bluetti power stations over Bluetooth Low Energy. Requests are
//! MODBUS RTU read frames written to one GATT characteristic, responses and telemetry
//! arrive as notifications on another.
//!
//! The protocol engine does not depend on a radio: it drives anything implementing
//! [`transport::Transport`]. A [`DeviceSession`] turns that notification-driven link
//! into ordinary request/response calls with timeouts and keeps the last known
//! [`Snapshot`] of the device.
//!
//! ## Features
//!
//! - `ble`: Enables [`ble::BleTransport`], a transport on top of the `bluest` crate.
//! - `bin-dependencies`: Enables everything the `bluetti` command-line tool needs (includes `ble`).

/// Command session: one request in flight, correlated by ordering.
pub mod command;
pub mod config;
/// Contains error types for the library.
mod error;
mod link;
/// MODBUS RTU frame encoding and decoding.
pub mod protocol;
pub mod registers;
pub mod session;
pub mod snapshot;
pub mod transport;

/// Bluetooth Low Energy transport.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;

pub use config::{ConfigError, GattProfile, SessionConfig};
pub use error::{DecodeError, Error, ErrorCategory, Result};
pub use registers::{ChargingStatus, IdentityField, IdentityLookup, IdentityTable};
pub use session::{ConnectionState, DeviceSession, PowerTriad, SessionEvent};
pub use snapshot::{DeviceIdentity, Snapshot, Telemetry};
pub use transport::{Transport, TransportError};
