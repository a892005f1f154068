//! BLE Scanner Module
//!
//! Filtered discovery of the lock. Two kinds of scan can run at the same
//! time over the one adapter scan: the background reconnect scan (filtered
//! by the configured address) and the interactive device picker (filtered by
//! the serial service UUID, bounded by a scan window).

use crate::domain::error::Result;
use crate::domain::models::{PeripheralAddress, ScanRecord};
use crate::infrastructure::bluetooth::radio::{Advertisement, Radio, ScanMode};
use crate::infrastructure::bluetooth::timer::{Timer, TimerEvent};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an advertisement must carry to be reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    Address(PeripheralAddress),
    Service(Uuid),
}

impl ScanFilter {
    pub fn matches(&self, adv: &Advertisement) -> bool {
        match self {
            Self::Address(address) => adv.address == *address,
            Self::Service(uuid) => adv.services.contains(uuid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanPurpose {
    /// Looking for the configured lock to reconnect
    AutoConnect,
    /// Listing nearby locks for the user to choose from
    DevicePicker,
}

impl ScanPurpose {
    fn mode(&self) -> ScanMode {
        match self {
            Self::AutoConnect => ScanMode::LowPower,
            Self::DevicePicker => ScanMode::LowLatency,
        }
    }
}

/// Identifies one scan session, so stale window timers can be told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(u64);

/// A matching advertisement, collapsed per address
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub purpose: ScanPurpose,
    pub record: ScanRecord,
    /// First time this address was seen in the session
    pub is_new: bool,
}

#[derive(Debug)]
struct ScanSession {
    id: ScanId,
    filter: ScanFilter,
    records: HashMap<PeripheralAddress, ScanRecord>,
}

/// BLE Scanner for discovering the lock
#[derive(Debug, Default)]
pub struct BleScanner {
    sessions: HashMap<ScanPurpose, ScanSession>,
    next_id: u64,
    radio_mode: Option<ScanMode>,
}

impl BleScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a scan session
    ///
    /// # Arguments
    /// * `filter` - address or service UUID the advertisement must match
    /// * `window` - stop automatically after this long (`None` scans until stopped)
    ///
    /// Any earlier session for the same purpose is replaced.
    pub fn start_scan(
        &mut self,
        radio: &mut dyn Radio,
        timer: &mut dyn Timer,
        purpose: ScanPurpose,
        filter: ScanFilter,
        window: Option<Duration>,
    ) -> Result<ScanId> {
        self.next_id += 1;
        let id = ScanId(self.next_id);
        info!("Starting {:?} scan with filter {:?}", purpose, filter);

        let previous = self.sessions.insert(
            purpose,
            ScanSession {
                id,
                filter,
                records: HashMap::new(),
            },
        );

        if let Err(e) = self.sync_radio(radio) {
            self.sessions.remove(&purpose);
            if let Some(previous) = previous {
                self.sessions.insert(purpose, previous);
            }
            return Err(e);
        }

        if let Some(window) = window {
            timer.schedule(window, TimerEvent::ScanWindowElapsed(id));
        }
        Ok(id)
    }

    /// Stop a scan session. Returns whether one was running.
    pub fn stop_scan(&mut self, radio: &mut dyn Radio, purpose: ScanPurpose) -> bool {
        if self.sessions.remove(&purpose).is_none() {
            return false;
        }
        info!("Stopping {:?} scan", purpose);
        if let Err(e) = self.sync_radio(radio) {
            warn!("Could not retune scan after stopping {:?}: {}", purpose, e);
        }
        true
    }

    /// Stop every session
    pub fn stop_all(&mut self, radio: &mut dyn Radio) {
        self.sessions.clear();
        if self.radio_mode.take().is_some() {
            radio.stop_scan();
        }
    }

    /// Window timer fired. Returns the purpose that was stopped, if the
    /// session is still the one the timer was set for.
    pub fn on_window_elapsed(&mut self, radio: &mut dyn Radio, id: ScanId) -> Option<ScanPurpose> {
        let purpose = self
            .sessions
            .iter()
            .find(|(_, session)| session.id == id)
            .map(|(purpose, _)| *purpose)?;
        debug!("Scan window elapsed for {:?}", purpose);
        self.stop_scan(radio, purpose);
        Some(purpose)
    }

    /// The adapter aborted scanning; all sessions are gone.
    pub fn on_scan_failed(&mut self) -> Vec<ScanPurpose> {
        self.radio_mode = None;
        self.sessions.drain().map(|(purpose, _)| purpose).collect()
    }

    /// Offer an advertisement to every running session.
    pub fn on_advertisement(&mut self, adv: &Advertisement) -> Vec<Sighting> {
        let mut sightings = Vec::new();
        for (purpose, session) in self.sessions.iter_mut() {
            if !session.filter.matches(adv) {
                continue;
            }
            let is_new = !session.records.contains_key(&adv.address);
            let record = session
                .records
                .entry(adv.address.clone())
                .or_insert_with(|| ScanRecord {
                    address: adv.address.clone(),
                    name: None,
                    signal_strength: None,
                    timestamp: adv.timestamp,
                });
            // Keep the last known name, take the newest signal reading.
            if adv.name.is_some() {
                record.name = adv.name.clone();
            }
            record.signal_strength = adv.rssi;
            record.timestamp = adv.timestamp;

            sightings.push(Sighting {
                purpose: *purpose,
                record: record.clone(),
                is_new,
            });
        }
        sightings
    }

    pub fn is_scanning(&self, purpose: ScanPurpose) -> bool {
        self.sessions.contains_key(&purpose)
    }

    /// Bring the adapter scan in line with the running sessions.
    fn sync_radio(&mut self, radio: &mut dyn Radio) -> Result<()> {
        let wanted = if self.sessions.contains_key(&ScanPurpose::DevicePicker) {
            Some(ScanPurpose::DevicePicker.mode())
        } else if self.sessions.contains_key(&ScanPurpose::AutoConnect) {
            Some(ScanPurpose::AutoConnect.mode())
        } else {
            None
        };

        if wanted == self.radio_mode {
            return Ok(());
        }
        match wanted {
            Some(mode) => {
                // Stop any existing scan first
                if self.radio_mode.is_some() {
                    radio.stop_scan();
                    self.radio_mode = None;
                }
                radio.start_scan(mode)?;
                self.radio_mode = Some(mode);
            }
            None => {
                radio.stop_scan();
                self.radio_mode = None;
            }
        }
        Ok(())
    }
}
