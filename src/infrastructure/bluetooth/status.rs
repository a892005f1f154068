//! Status Interpreter
//!
//! Turns serial notifications into door state.

use crate::domain::models::DoorState;
use crate::infrastructure::bluetooth::protocol::{self, StatusByte};
use tracing::{debug, info, warn};

/// What a notification meant for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Door state was (re)reported; publish it
    DoorState(DoorState),
    /// The lock reported an error byte
    LockError,
    /// Nothing to publish
    Ignored,
}

#[derive(Debug, Default)]
pub struct StatusInterpreter {
    door_state: DoorState,
    error_sets_door_state: bool,
}

impl StatusInterpreter {
    pub fn new(error_sets_door_state: bool) -> Self {
        Self {
            door_state: DoorState::Unknown,
            error_sets_door_state,
        }
    }

    pub fn door_state(&self) -> DoorState {
        self.door_state
    }

    /// Forget the door state. Returns true if it was known before.
    pub fn reset(&mut self) -> bool {
        let was_known = self.door_state != DoorState::Unknown;
        self.door_state = DoorState::Unknown;
        was_known
    }

    pub fn interpret(&mut self, data: &[u8]) -> StatusUpdate {
        debug!("Serial notification: {:02X?}", data);
        match protocol::decode(data) {
            StatusByte::Locked => {
                info!("Door locked");
                self.door_state = DoorState::Locked;
                StatusUpdate::DoorState(self.door_state)
            }
            StatusByte::Unlocked => {
                info!("Door unlocked");
                self.door_state = DoorState::Unlocked;
                StatusUpdate::DoorState(self.door_state)
            }
            StatusByte::Error => {
                warn!("Error status received from lock");
                if self.error_sets_door_state {
                    self.door_state = DoorState::Error;
                }
                StatusUpdate::LockError
            }
            StatusByte::StartMarker | StatusByte::Unrecognized => StatusUpdate::Ignored,
        }
    }
}
