//! Door Lock Serial Protocol
//!
//! The lock sits behind a Bluno-style BLE serial bridge: every byte written
//! to the serial characteristic is a keypad key or a status query, and the
//! lock answers with single status bytes notified on the same characteristic.

use crate::domain::error::{LockError, Result};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Serial bridge service advertised by the lock
pub const SERIAL_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000dfb0_0000_1000_8000_00805f9b34fb);

/// Serial port characteristic - carries commands out and status notifications in
pub const SERIAL_PORT_CHAR_UUID: Uuid = Uuid::from_u128(0x0000dfb1_0000_1000_8000_00805f9b34fb);

/// AT command characteristic of the bridge (unused by the lock protocol)
pub const AT_COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000dfb2_0000_1000_8000_00805f9b34fb);

/// Standard Device Information service
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// The bridge drops anything beyond 17 bytes in a single write.
pub const MAX_SERIAL_TX_SIZE: usize = 17;

/// Default spacing between keypad bytes. The lock loses keys written back-to-back.
pub const KEY_DELAY_MS: u64 = 250;

pub const GET_STATUS_COMMAND: u8 = 0x00;
pub const KEY_0: u8 = 0x30;
pub const KEY_ENTER: u8 = 0x23;
pub const KEY_CANCEL: u8 = 0x2A;

pub const LOCK_STATUS_BYTE: u8 = 0x61;
pub const UNLOCK_STATUS_BYTE: u8 = 0x62;
pub const ERROR_STATUS_BYTE: u8 = 0x66;
pub const START_MARKER_BYTE: u8 = 0xFF;

/// Commands understood by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Keypad digit 0-9
    Digit(u8),
    /// Keypad `#`
    Enter,
    /// Keypad `*`
    Cancel,
    /// Ask the lock to report its state
    StatusQuery,
}

impl Command {
    /// Digit key, or `None` for values above 9
    pub fn digit(d: u8) -> Option<Self> {
        (d <= 9).then_some(Self::Digit(d))
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Digit(d) => KEY_0 + d,
            Self::Enter => KEY_ENTER,
            Self::Cancel => KEY_CANCEL,
            Self::StatusQuery => GET_STATUS_COMMAND,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            GET_STATUS_COMMAND => Some(Self::StatusQuery),
            KEY_ENTER => Some(Self::Enter),
            KEY_CANCEL => Some(Self::Cancel),
            b if (KEY_0..=KEY_0 + 9).contains(&b) => Some(Self::Digit(b - KEY_0)),
            _ => None,
        }
    }
}

/// Status reported by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusByte {
    Locked,
    Unlocked,
    Error,
    /// Frame start, carries no state
    StartMarker,
    Unrecognized,
}

impl StatusByte {
    fn from_byte(b: u8) -> Self {
        match b {
            LOCK_STATUS_BYTE => Self::Locked,
            UNLOCK_STATUS_BYTE => Self::Unlocked,
            ERROR_STATUS_BYTE => Self::Error,
            START_MARKER_BYTE => Self::StartMarker,
            _ => Self::Unrecognized,
        }
    }
}

/// A payload validated for the serial characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    payload: Vec<u8>,
}

impl WriteRequest {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Validate an outbound payload.
///
/// Payloads longer than [`MAX_SERIAL_TX_SIZE`] are rejected, never split;
/// callers fragment multi-byte payloads themselves.
pub fn encode(bytes: &[u8]) -> Result<WriteRequest> {
    if bytes.len() > MAX_SERIAL_TX_SIZE {
        warn!(
            "Maximum data size exceeded. Cannot send more than {} bytes",
            MAX_SERIAL_TX_SIZE
        );
        return Err(LockError::PayloadTooLarge {
            len: bytes.len(),
            max: MAX_SERIAL_TX_SIZE,
        });
    }
    trace!("Encoded payload: {:02X?}", bytes);
    Ok(WriteRequest {
        payload: bytes.to_vec(),
    })
}

/// Encode a single command byte
pub fn encode_command(command: Command) -> WriteRequest {
    WriteRequest {
        payload: vec![command.as_byte()],
    }
}

/// Decode a notification buffer into the most recent status.
///
/// Only the newest status byte matters: the buffer is scanned from the end
/// and the first lock, unlock or error byte wins. Earlier bytes are stale or
/// padding. A start marker is framing and only reported when nothing else
/// in the buffer is recognised.
pub fn decode(bytes: &[u8]) -> StatusByte {
    let mut saw_marker = false;
    for &b in bytes.iter().rev() {
        match StatusByte::from_byte(b) {
            StatusByte::StartMarker => saw_marker = true,
            StatusByte::Unrecognized => {
                debug!("Skipping byte 0x{:02X}", b);
            }
            status => return status,
        }
    }

    if saw_marker {
        StatusByte::StartMarker
    } else {
        warn!("Unknown command bytes received from lock: {:02X?}", bytes);
        StatusByte::Unrecognized
    }
}
