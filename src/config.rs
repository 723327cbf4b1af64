use crate::command::DEFAULT_COMMAND_TIMEOUT;
use crate::protocol::FunctionCode;
use crate::registers::IdentityTable;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot open config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The GATT service and characteristics carrying the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GattProfile {
    pub service: Uuid,
    /// Requests are written here.
    pub write_characteristic: Uuid,
    /// Responses and telemetry are notified here.
    pub notify_characteristic: Uuid,
}

impl GattProfile {
    pub const BLUETTI: GattProfile = GattProfile {
        service: Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb),
        write_characteristic: Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb),
        notify_characteristic: Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb),
    };
}

impl Default for GattProfile {
    fn default() -> Self {
        Self::BLUETTI
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
    pub gatt: GattProfile,
    /// How long a request waits for its response.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub discover_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub subscribe_timeout: Duration,
    /// Read function used for every query.
    pub function: FunctionCode,
    pub identity: IdentityTable,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gatt: GattProfile::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            discover_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            function: FunctionCode::ReadHoldingRegisters,
            identity: IdentityTable::default(),
        }
    }
}

impl SessionConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "bluetti.yaml";

    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let config_file_path = config_file_path.as_ref();
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)?;
        let config: Self = serde_yaml::from_reader(&config_file)?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.function, FunctionCode::ReadHoldingRegisters);
        assert_eq!(
            config.gatt.service.to_string(),
            "0000ff00-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            config.gatt.write_characteristic.to_string(),
            "0000ff02-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            config.gatt.notify_characteristic.to_string(),
            "0000ff01-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SessionConfig::from_yaml(
            r#"
command-timeout: 2s 500ms
function: read-input-registers
identity:
  models:
    1: AC200P
    2: AC300
"#,
        )
        .unwrap();
        assert_eq!(config.command_timeout, Duration::from_millis(2500));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.function, FunctionCode::ReadInputRegisters);
        assert_eq!(config.gatt, GattProfile::BLUETTI);
        assert_eq!(config.identity.models.get(&2).map(String::as_str), Some("AC300"));
        assert!(config.identity.serial_numbers.is_empty());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            SessionConfig::from_yaml("command-timeout: soon"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "gatt:\n  service: 0000ffe0-0000-1000-8000-00805f9b34fb\nsubscribe-timeout: 1s"
        )
        .unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(
            config.gatt.service.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            config.gatt.write_characteristic,
            GattProfile::BLUETTI.write_characteristic
        );
        assert_eq!(config.subscribe_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SessionConfig::load("/nonexistent/bluetti.yaml"),
            Err(ConfigError::Io(_))
        ));
    }
}
