//! BLE Connection Module
//!
//! The device session: one open link to the lock and, once discovery has
//! found it, the serial characteristic used for all traffic.

use crate::domain::error::{LockError, Result};
use crate::domain::models::PeripheralAddress;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, WriteRequest};
use crate::infrastructure::bluetooth::radio::{GattService, Radio};
use tracing::{info, warn};
use uuid::Uuid;

/// Which service and characteristic carry the serial stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Serial characteristic UUID
    pub serial_char_uuid: Uuid,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERIAL_SERVICE_UUID,
            serial_char_uuid: protocol::SERIAL_PORT_CHAR_UUID,
        }
    }
}

impl ConnectionConfig {
    /// Take the UUIDs from settings, keeping the defaults for malformed values.
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = Self::default();
        let service_uuid = settings.service_uuid().unwrap_or_else(|e| {
            warn!("{}; using {}", e, defaults.service_uuid);
            defaults.service_uuid
        });
        let serial_char_uuid = settings.serial_char_uuid().unwrap_or_else(|e| {
            warn!("{}; using {}", e, defaults.serial_char_uuid);
            defaults.serial_char_uuid
        });
        Self {
            service_uuid,
            serial_char_uuid,
        }
    }
}

/// An open link to the lock
#[derive(Debug)]
pub struct DeviceSession {
    address: PeripheralAddress,
    serial_characteristic: Option<Uuid>,
}

impl DeviceSession {
    pub fn new(address: PeripheralAddress) -> Self {
        Self {
            address,
            serial_characteristic: None,
        }
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    pub fn serial_characteristic(&self) -> Option<Uuid> {
        self.serial_characteristic
    }

    /// Serial characteristic is known, writes are allowed
    pub fn is_ready(&self) -> bool {
        self.serial_characteristic.is_some()
    }

    /// Locate the serial characteristic among the discovered services.
    pub fn attach_serial(
        &mut self,
        services: &[GattService],
        config: &ConnectionConfig,
    ) -> Result<Uuid> {
        let service = services
            .iter()
            .find(|s| s.uuid == config.service_uuid)
            .ok_or_else(|| LockError::discovery_failed(&self.address, "serial service not found"))?;
        info!("Found serial service");

        let characteristic = service
            .characteristics
            .iter()
            .copied()
            .find(|c| *c == config.serial_char_uuid)
            .ok_or_else(|| {
                LockError::discovery_failed(&self.address, "serial characteristic not found")
            })?;
        info!("Found serial characteristic");

        self.serial_characteristic = Some(characteristic);
        Ok(characteristic)
    }

    /// Write to the serial characteristic. Rejected, never queued, before discovery.
    pub fn write(&self, radio: &mut dyn Radio, request: WriteRequest) -> Result<()> {
        let characteristic = self.serial_characteristic.ok_or(LockError::NotConnected)?;
        radio.write(&self.address, characteristic, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{MockRadio, RadioCall};
    use crate::infrastructure::bluetooth::protocol::{encode_command, Command};

    fn session() -> DeviceSession {
        DeviceSession::new(PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap())
    }

    fn bluno_services() -> Vec<GattService> {
        vec![
            GattService {
                uuid: protocol::DEVICE_INFORMATION_SERVICE_UUID,
                characteristics: vec![],
            },
            GattService {
                uuid: protocol::SERIAL_SERVICE_UUID,
                characteristics: vec![
                    protocol::SERIAL_PORT_CHAR_UUID,
                    protocol::AT_COMMAND_CHAR_UUID,
                ],
            },
        ]
    }

    #[test]
    fn test_attach_serial() {
        let mut session = session();
        assert!(!session.is_ready());
        let c = session
            .attach_serial(&bluno_services(), &ConnectionConfig::default())
            .unwrap();
        assert_eq!(c, protocol::SERIAL_PORT_CHAR_UUID);
        assert!(session.is_ready());
    }

    #[test]
    fn test_missing_characteristic() {
        let mut session = session();
        let services = vec![GattService {
            uuid: protocol::SERIAL_SERVICE_UUID,
            characteristics: vec![protocol::AT_COMMAND_CHAR_UUID],
        }];
        let err = session
            .attach_serial(&services, &ConnectionConfig::default())
            .unwrap_err();
        assert!(matches!(err, LockError::DiscoveryFailed { .. }));
        assert!(session
            .attach_serial(&[], &ConnectionConfig::default())
            .is_err());
    }

    #[test]
    fn test_write_requires_discovery() {
        let (mut radio, probe) = MockRadio::new();
        let mut session = session();
        assert_eq!(
            session.write(&mut radio, encode_command(Command::StatusQuery)),
            Err(LockError::NotConnected)
        );
        assert!(probe.calls().is_empty());

        session
            .attach_serial(&bluno_services(), &ConnectionConfig::default())
            .unwrap();
        session
            .write(&mut radio, encode_command(Command::StatusQuery))
            .unwrap();
        assert_eq!(
            probe.calls(),
            vec![RadioCall::Write(
                session.address().clone(),
                protocol::SERIAL_PORT_CHAR_UUID,
                vec![0x00]
            )]
        );
    }

    #[test]
    fn test_config_from_bad_settings() {
        let settings = Settings {
            ble_service_uuid: "not-a-uuid".to_string(),
            ..Default::default()
        };
        assert_eq!(
            ConnectionConfig::from_settings(&settings),
            ConnectionConfig::default()
        );
    }
}
