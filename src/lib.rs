//! Client for a Bluetooth LE keypad door lock.
//!
//! Keeps a link to the configured lock, tracks whether the door is locked,
//! and unlocks it by typing the passcode on its serial keypad.

pub mod domain;
pub mod infrastructure;
