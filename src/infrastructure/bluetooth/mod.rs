//! Bluetooth Module
//!
//! BLE client for the keypad door lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     DoorLockService                       │
//! │  (single owner task, applies one Event at a time)         │
//! └──────┬──────────┬───────────┬────────────┬───────────────┘
//!        │          │           │            │
//!        ▼          ▼           ▼            ▼
//! ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌───────────┐
//! │ Scanner  │ │ Session  │ │  Status  │ │ Sequencer │
//! │          │ │          │ │          │ │           │
//! │ - filters│ │ - GATT   │ │ - door   │ │ - keypad  │
//! │ - windows│ │   serial │ │   state  │ │   timing  │
//! └────┬─────┘ └────┬─────┘ └──────────┘ └───────────┘
//!      │            │
//!      ▼            ▼
//! ┌──────────────────────┐        ┌──────────┐
//! │  Radio (btleplug)    │        │ Protocol │
//! └──────────────────────┘        └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, keypad command bytes and status byte decoding
//! - [`radio`] - Request-only seam over the Bluetooth stack
//! - [`btle`] - btleplug implementation of the radio
//! - [`scanner`] - Filtered discovery with optional scan windows
//! - [`connection`] - The open link and its serial characteristic
//! - [`status`] - Door state from notifications
//! - [`sequencer`] - Passcode entry, one key per timer step
//! - [`timer`] - Deferred events for the manager
//! - [`service`] - Connection manager and its handle

pub mod btle;
pub mod connection;
pub mod protocol;
pub mod radio;
pub mod scanner;
pub mod sequencer;
pub mod service;
pub mod status;
pub mod timer;

#[cfg(test)]
pub(crate) mod mock;

pub use btle::BtleplugRadio;
pub use service::{DoorLockService, Event, ServiceHandle};
