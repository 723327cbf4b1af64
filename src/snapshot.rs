use crate::registers::{ChargingStatus, IdentityField, IdentityLookup, RegisterValues};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Last known identity of the device. `None` means the register was never read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub model: Option<IdentityField>,
    pub serial_number: Option<IdentityField>,
    pub firmware_version: Option<IdentityField>,
}

impl DeviceIdentity {
    pub fn from_values(values: &RegisterValues, lookup: &dyn IdentityLookup) -> Self {
        Self {
            model: values
                .model
                .map(|code| IdentityField::resolve(code, lookup.model(code))),
            serial_number: values
                .serial_number
                .map(|code| IdentityField::resolve(code, lookup.serial_number(code))),
            firmware_version: values
                .firmware_version
                .map(|code| IdentityField::resolve(code, lookup.firmware_version(code))),
        }
    }
}

/// Last known readings and when they were taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    /// State of charge in %
    pub battery_level: Option<u16>,
    /// Input power in W
    pub power_input: Option<u16>,
    /// Output power in W
    pub power_output: Option<u16>,
    pub charging_status: Option<ChargingStatus>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub identity: DeviceIdentity,
    pub telemetry: Telemetry,
}

impl Snapshot {
    /// Return a copy of `self` with every quantity present in `values` replaced.
    ///
    /// The telemetry timestamp moves to `now` only if `values` carried telemetry.
    pub fn merged(
        &self,
        values: &RegisterValues,
        lookup: &dyn IdentityLookup,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        let identity = DeviceIdentity::from_values(values, lookup);
        if identity.model.is_some() {
            next.identity.model = identity.model;
        }
        if identity.serial_number.is_some() {
            next.identity.serial_number = identity.serial_number;
        }
        if identity.firmware_version.is_some() {
            next.identity.firmware_version = identity.firmware_version;
        }

        let telemetry = &mut next.telemetry;
        if let Some(v) = values.battery_level {
            telemetry.battery_level = Some(v);
        }
        if let Some(v) = values.power_input {
            telemetry.power_input = Some(v);
        }
        if let Some(v) = values.power_output {
            telemetry.power_output = Some(v);
        }
        if let Some(v) = values.charging_status {
            telemetry.charging_status = Some(v);
        }
        if values.has_telemetry() {
            telemetry.timestamp = Some(now);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{IdentityTable, NoLookup};
    use chrono::TimeZone;

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();

        let first = Snapshot::default().merged(
            &RegisterValues {
                battery_level: Some(75),
                power_input: Some(100),
                ..Default::default()
            },
            &NoLookup,
            t0,
        );
        let second = first.merged(
            &RegisterValues {
                power_input: Some(0),
                charging_status: Some(ChargingStatus::Discharging),
                ..Default::default()
            },
            &NoLookup,
            t1,
        );

        assert_eq!(
            second.telemetry,
            Telemetry {
                battery_level: Some(75),
                power_input: Some(0),
                power_output: None,
                charging_status: Some(ChargingStatus::Discharging),
                timestamp: Some(t1),
            }
        );
        // the first snapshot is unchanged
        assert_eq!(first.telemetry.power_input, Some(100));
        assert_eq!(first.telemetry.timestamp, Some(t0));
    }

    #[test]
    fn test_identity_merge_does_not_stamp_telemetry() {
        let mut table = IdentityTable::default();
        table.models.insert(7, "EB3A".to_string());

        let snapshot = Snapshot::default().merged(
            &RegisterValues {
                model: Some(7),
                firmware_version: Some(0x0203),
                ..Default::default()
            },
            &table,
            Utc::now(),
        );

        assert_eq!(
            snapshot.identity,
            DeviceIdentity {
                model: Some(IdentityField::Known("EB3A".to_string())),
                serial_number: None,
                firmware_version: Some(IdentityField::Unknown(0x0203)),
            }
        );
        assert_eq!(snapshot.telemetry.timestamp, None);
    }
}
