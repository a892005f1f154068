//! Error types for lock control operations.

use crate::domain::models::PeripheralAddress;

/// Result type alias for lock control operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors raised by the lock controller.
///
/// None of these cross the service boundary as panics: the connection
/// manager turns link-level failures into state events and returns the
/// synchronous rejections (`NotConnected`, `PayloadTooLarge`, ...) to the
/// caller of a [`ServiceHandle`](crate::infrastructure::bluetooth::ServiceHandle).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The radio adapter is missing or switched off.
    #[error("Bluetooth adapter unavailable")]
    RadioUnavailable,

    /// The adapter refused to start a scan.
    #[error("Scan failed: {reason}")]
    ScanFailed { reason: String },

    /// Opening the link to the peripheral failed.
    #[error("Connection to {address} failed: {reason}")]
    ConnectFailed {
        address: PeripheralAddress,
        reason: String,
    },

    /// Service discovery failed or the serial characteristic is missing.
    #[error("Service discovery on {address} failed: {reason}")]
    DiscoveryFailed {
        address: PeripheralAddress,
        reason: String,
    },

    /// Payload exceeds the peripheral's receive buffer.
    #[error("Payload of {len} bytes exceeds the {max} byte serial limit")]
    PayloadTooLarge { len: usize, max: usize },

    /// No connected session with a known serial characteristic.
    #[error("Not connected to the lock")]
    NotConnected,

    /// The peripheral has no command for this operation.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    #[error("Invalid passcode: {reason}")]
    InvalidPasscode { reason: String },

    #[error("Invalid peripheral address: {0:?}")]
    InvalidAddress(String),

    /// An unlock sequence is already being written.
    #[error("Unlock sequence already in progress")]
    UnlockInProgress,

    /// The connection manager task has exited.
    #[error("Lock service stopped")]
    ServiceStopped,
}

impl LockError {
    pub fn scan_failed(reason: impl Into<String>) -> Self {
        Self::ScanFailed {
            reason: reason.into(),
        }
    }

    pub fn connect_failed(address: &PeripheralAddress, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            address: address.clone(),
            reason: reason.into(),
        }
    }

    pub fn discovery_failed(address: &PeripheralAddress, reason: impl Into<String>) -> Self {
        Self::DiscoveryFailed {
            address: address.clone(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn invalid_passcode(reason: impl Into<String>) -> Self {
        Self::InvalidPasscode {
            reason: reason.into(),
        }
    }

    /// Whether the flow recovers on its own (rescan) after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed { .. } | Self::ConnectFailed { .. } | Self::DiscoveryFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LockError::PayloadTooLarge { len: 18, max: 17 };
        assert_eq!(
            err.to_string(),
            "Payload of 18 bytes exceeds the 17 byte serial limit"
        );
        assert_eq!(
            LockError::unsupported("lock").to_string(),
            "Unsupported operation: lock"
        );
    }

    #[test]
    fn test_recoverable_errors() {
        let address = PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap();
        assert!(LockError::connect_failed(&address, "timeout").is_recoverable());
        assert!(LockError::scan_failed("busy").is_recoverable());
        assert!(!LockError::RadioUnavailable.is_recoverable());
        assert!(!LockError::NotConnected.is_recoverable());
    }
}
