//! Radio Adapter Seam
//!
//! Everything the connection manager asks of the Bluetooth stack. Calls only
//! *request* an operation and return at once; results come back later as
//! [`RadioEvent`]s on the manager's event channel, so the manager never waits
//! on the peripheral.

use crate::domain::error::Result;
use crate::domain::models::PeripheralAddress;
use crate::infrastructure::bluetooth::protocol::WriteRequest;
use std::time::SystemTime;
use uuid::Uuid;

/// Radio duty cycle while scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Background reconnect scanning
    LowPower,
    /// Interactive device picking
    LowLatency,
}

/// Raw advertisement as seen by the adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: PeripheralAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    pub timestamp: SystemTime,
}

/// A discovered GATT service and its characteristic UUIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Link-level callbacks, delivered in order to the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    AdapterStateChanged {
        enabled: bool,
    },
    Advertisement(Advertisement),
    ScanFailed {
        reason: String,
    },
    Connected(PeripheralAddress),
    ConnectFailed {
        address: PeripheralAddress,
        reason: String,
    },
    Disconnected(PeripheralAddress),
    ServicesDiscovered {
        address: PeripheralAddress,
        services: Vec<GattService>,
    },
    DiscoveryFailed {
        address: PeripheralAddress,
        reason: String,
    },
    Notification {
        address: PeripheralAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteFailed {
        address: PeripheralAddress,
        reason: String,
    },
}

/// Bluetooth LE central operations
pub trait Radio: Send {
    /// Whether the adapter is present and powered on
    fn is_enabled(&self) -> bool;

    /// Start (or retune) the adapter scan. Idempotent.
    fn start_scan(&mut self, mode: ScanMode) -> Result<()>;

    /// Stop the adapter scan. Idempotent.
    fn stop_scan(&mut self);

    /// Open a link. Answered by `Connected` or `ConnectFailed`.
    fn connect(&mut self, address: &PeripheralAddress) -> Result<()>;

    /// Answered by `ServicesDiscovered` or `DiscoveryFailed`.
    fn discover_services(&mut self, address: &PeripheralAddress) -> Result<()>;

    /// Enable notifications; values arrive as `Notification`.
    fn subscribe(&mut self, address: &PeripheralAddress, characteristic: Uuid) -> Result<()>;

    /// Queue a write. Writes to one peripheral are performed in order;
    /// a failure is reported as `WriteFailed`.
    fn write(
        &mut self,
        address: &PeripheralAddress,
        characteristic: Uuid,
        request: WriteRequest,
    ) -> Result<()>;

    /// Close the link (or cancel a pending connect). Idempotent.
    fn disconnect(&mut self, address: &PeripheralAddress);
}
