use crate::domain::error::LockError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Longest passcode the lock keypad accepts.
pub const MAX_PASSCODE_LENGTH: usize = 8;

/// Radio address of a peripheral, e.g. `AA:BB:CC:DD:EE:FF`.
///
/// Stored trimmed and upper-cased so configuration, scan results and
/// sessions always compare equal for the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    pub fn new(address: impl AsRef<str>) -> Result<Self, LockError> {
        let trimmed = address.as_ref().trim();
        if trimmed.is_empty() {
            return Err(LockError::InvalidAddress(address.as_ref().to_string()));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeripheralAddress {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeripheralAddress {
    type Error = LockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeripheralAddress> for String {
    fn from(address: PeripheralAddress) -> Self {
        address.0
    }
}

/// Link state reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lock state as last reported by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DoorState {
    #[default]
    Unknown,
    Locked,
    Unlocked,
    Error,
}

/// A single advertisement sighting, collapsed per address within a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub address: PeripheralAddress,
    pub name: Option<String>,
    pub signal_strength: Option<i16>,
    pub timestamp: SystemTime,
}

impl ScanRecord {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Keypad passcode: 1 to [`MAX_PASSCODE_LENGTH`] decimal digits.
#[derive(Clone, PartialEq, Eq)]
pub struct Passcode(Vec<u8>);

impl Passcode {
    pub fn from_digits(digits: Vec<u8>) -> Result<Self, LockError> {
        if digits.is_empty() {
            return Err(LockError::invalid_passcode("passcode is empty"));
        }
        if digits.len() > MAX_PASSCODE_LENGTH {
            return Err(LockError::invalid_passcode(format!(
                "passcode longer than {} digits",
                MAX_PASSCODE_LENGTH
            )));
        }
        if let Some(d) = digits.iter().find(|d| **d > 9) {
            return Err(LockError::invalid_passcode(format!("{} is not a digit", d)));
        }
        Ok(Self(digits))
    }

    pub fn digits(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Passcode {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .trim()
            .chars()
            .map(|c| {
                c.to_digit(10)
                    .map(|d| d as u8)
                    .ok_or_else(|| LockError::invalid_passcode(format!("{:?} is not a digit", c)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_digits(digits)
    }
}

impl Default for Passcode {
    fn default() -> Self {
        Self(vec![1, 2, 3, 4])
    }
}

// Never print the digits themselves.
impl fmt::Debug for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passcode({})", "•".repeat(self.0.len()))
    }
}

impl fmt::Display for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&"•".repeat(self.0.len()))
    }
}

impl From<&Passcode> for String {
    fn from(passcode: &Passcode) -> Self {
        passcode
            .0
            .iter()
            .map(|d| char::from(b'0' + d))
            .collect()
    }
}

/// How an unlock sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Events published to observers on the event bus.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStateChanged(ConnectionState),
    DoorStateChanged(DoorState),
    /// Device picker scan started or stopped.
    ScanningChanged(bool),
    DeviceFound(ScanRecord),
    UnlockFinished(UnlockOutcome),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalized() {
        let a = PeripheralAddress::new(" aa:bb:cc:dd:ee:ff ").unwrap();
        let b: PeripheralAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!(PeripheralAddress::new("   ").is_err());
    }

    #[test]
    fn test_address_serde() {
        let a = PeripheralAddress::new("aa:bb").unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"AA:BB\"");
        let back: PeripheralAddress = serde_json::from_str("\"aa:bb\"").unwrap();
        assert_eq!(back, a);
        assert!(serde_json::from_str::<PeripheralAddress>("\"\"").is_err());
    }

    #[test]
    fn test_passcode_parse() {
        let p: Passcode = "4711".parse().unwrap();
        assert_eq!(p.digits(), &[4, 7, 1, 1]);
        assert_eq!(String::from(&p), "4711");
        assert!("".parse::<Passcode>().is_err());
        assert!("12a4".parse::<Passcode>().is_err());
        assert!("123456789".parse::<Passcode>().is_err());
        assert!("12345678".parse::<Passcode>().is_ok());
    }

    #[test]
    fn test_passcode_is_masked() {
        let p: Passcode = "1234".parse().unwrap();
        assert_eq!(format!("{:?}", p), "Passcode(••••)");
        assert_eq!(p.to_string(), "••••");
    }

    #[test]
    fn test_passcode_rejects_non_digit_values() {
        assert!(Passcode::from_digits(vec![1, 10]).is_err());
    }
}
