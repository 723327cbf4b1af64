//! Fixed register table of the power station and the decoding of register words
//! into domain quantities.

use crate::protocol::{CommandDescriptor, FunctionCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A logical quantity exposed by the device, one register each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quantity {
    BatteryLevel,
    PowerInput,
    PowerOutput,
    ChargingStatus,
    DeviceModel,
    SerialNumber,
    FirmwareVersion,
}

impl Quantity {
    pub const ALL: [Quantity; 7] = [
        Quantity::BatteryLevel,
        Quantity::PowerInput,
        Quantity::PowerOutput,
        Quantity::ChargingStatus,
        Quantity::DeviceModel,
        Quantity::SerialNumber,
        Quantity::FirmwareVersion,
    ];

    pub const fn address(self) -> u16 {
        match self {
            Quantity::BatteryLevel => 0x0100,
            Quantity::PowerInput => 0x0101,
            Quantity::PowerOutput => 0x0102,
            Quantity::ChargingStatus => 0x0103,
            Quantity::DeviceModel => 0x0200,
            Quantity::SerialNumber => 0x0201,
            Quantity::FirmwareVersion => 0x0202,
        }
    }

    pub fn from_address(address: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.address() == address)
    }
}

/// First telemetry register. Frames that arrive with no request outstanding are read from here.
pub const TELEMETRY_BASE: u16 = Quantity::BatteryLevel.address();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargingStatus {
    Idle,
    Charging,
    Discharging,
    Unknown,
}

impl From<u16> for ChargingStatus {
    fn from(value: u16) -> Self {
        match value {
            0 => ChargingStatus::Idle,
            1 => ChargingStatus::Charging,
            2 => ChargingStatus::Discharging,
            _ => ChargingStatus::Unknown,
        }
    }
}

impl fmt::Display for ChargingStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChargingStatus::Idle => write!(f, "idle"),
            ChargingStatus::Charging => write!(f, "charging"),
            ChargingStatus::Discharging => write!(f, "discharging"),
            ChargingStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// The domain-level reads a session can perform, each a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// Battery level only.
    Battery,
    /// Power input, power output and charging status.
    PowerTriad,
    /// Model, serial number and firmware version codes.
    Identity,
    /// The four telemetry registers.
    All,
}

impl Query {
    pub fn descriptor(self, function: FunctionCode) -> CommandDescriptor {
        let (first, count) = match self {
            Query::Battery => (Quantity::BatteryLevel, 1),
            Query::PowerTriad => (Quantity::PowerInput, 3),
            Query::Identity => (Quantity::DeviceModel, 3),
            Query::All => (Quantity::BatteryLevel, 4),
        };
        CommandDescriptor::new(function, first.address(), count)
    }
}

/// Values decoded from one response. Only the quantities the payload covered are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegisterValues {
    pub battery_level: Option<u16>,
    pub power_input: Option<u16>,
    pub power_output: Option<u16>,
    pub charging_status: Option<ChargingStatus>,
    pub model: Option<u16>,
    pub serial_number: Option<u16>,
    pub firmware_version: Option<u16>,
}

impl RegisterValues {
    /// Read `payload` as consecutive big-endian words, the first one at `start_register`.
    ///
    /// A trailing odd byte is ignored, as are words at addresses outside the table.
    pub fn decode(start_register: u16, payload: &[u8]) -> Self {
        let mut values = Self::default();
        for (offset, word) in payload.chunks_exact(2).enumerate() {
            let address = start_register.wrapping_add(offset as u16);
            let word = u16::from_be_bytes([word[0], word[1]]);
            match Quantity::from_address(address) {
                Some(quantity) => values.set(quantity, word),
                None => log::trace!("Ignoring register {address:04X} = {word}"),
            }
        }
        values
    }

    fn set(&mut self, quantity: Quantity, word: u16) {
        match quantity {
            Quantity::BatteryLevel => self.battery_level = Some(word),
            Quantity::PowerInput => self.power_input = Some(word),
            Quantity::PowerOutput => self.power_output = Some(word),
            Quantity::ChargingStatus => self.charging_status = Some(ChargingStatus::from(word)),
            Quantity::DeviceModel => self.model = Some(word),
            Quantity::SerialNumber => self.serial_number = Some(word),
            Quantity::FirmwareVersion => self.firmware_version = Some(word),
        }
    }

    pub fn has_telemetry(&self) -> bool {
        self.battery_level.is_some()
            || self.power_input.is_some()
            || self.power_output.is_some()
            || self.charging_status.is_some()
    }

    pub fn has_identity(&self) -> bool {
        self.model.is_some() || self.serial_number.is_some() || self.firmware_version.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_telemetry() && !self.has_identity()
    }
}

/// Device specific naming of the raw identity codes.
pub trait IdentityLookup: Send + Sync {
    fn model(&self, code: u16) -> Option<String>;
    fn serial_number(&self, code: u16) -> Option<String>;
    fn firmware_version(&self, code: u16) -> Option<String>;
}

/// A lookup that knows no codes, every identity field stays unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

impl IdentityLookup for NoLookup {
    fn model(&self, _code: u16) -> Option<String> {
        None
    }

    fn serial_number(&self, _code: u16) -> Option<String> {
        None
    }

    fn firmware_version(&self, _code: u16) -> Option<String> {
        None
    }
}

/// Code tables, usually loaded from the `identity` section of the configuration file.
///
/// ```yaml
/// identity:
///   models:
///     1: AC200P
///   firmware-versions:
///     4096: "1.0.0"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IdentityTable {
    pub models: HashMap<u16, String>,
    pub serial_numbers: HashMap<u16, String>,
    pub firmware_versions: HashMap<u16, String>,
}

impl IdentityLookup for IdentityTable {
    fn model(&self, code: u16) -> Option<String> {
        self.models.get(&code).cloned()
    }

    fn serial_number(&self, code: u16) -> Option<String> {
        self.serial_numbers.get(&code).cloned()
    }

    fn firmware_version(&self, code: u16) -> Option<String> {
        self.firmware_versions.get(&code).cloned()
    }
}

/// An identity register after lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityField {
    Known(String),
    Unknown(u16),
}

impl IdentityField {
    pub fn resolve(code: u16, name: Option<String>) -> Self {
        match name {
            Some(name) => IdentityField::Known(name),
            None => IdentityField::Unknown(code),
        }
    }
}

impl fmt::Display for IdentityField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IdentityField::Known(name) => write!(f, "{name}"),
            IdentityField::Unknown(code) => write!(f, "unknown ({code:#06x})"),
        }
    }
}
