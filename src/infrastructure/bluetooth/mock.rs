//! Recording radio and hand-cranked timer for tests.

use crate::domain::error::{LockError, Result};
use crate::domain::models::PeripheralAddress;
use crate::infrastructure::bluetooth::protocol::WriteRequest;
use crate::infrastructure::bluetooth::radio::{Radio, ScanMode};
use crate::infrastructure::bluetooth::timer::{Timer, TimerEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// A request made to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan(ScanMode),
    StopScan,
    Connect(PeripheralAddress),
    DiscoverServices(PeripheralAddress),
    Subscribe(PeripheralAddress, Uuid),
    Write(PeripheralAddress, Uuid, Vec<u8>),
    Disconnect(PeripheralAddress),
}

#[derive(Debug)]
struct MockState {
    calls: Vec<RadioCall>,
    enabled: bool,
    fail_scans: bool,
    fail_connects: bool,
}

/// Radio that records every request and never produces events by itself
#[derive(Debug)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockRadio`] that has been moved into the manager
#[derive(Debug, Clone)]
pub struct RadioProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockRadio {
    pub fn new() -> (Self, RadioProbe) {
        let state = Arc::new(Mutex::new(MockState {
            calls: Vec::new(),
            enabled: true,
            fail_scans: false,
            fail_connects: false,
        }));
        (
            Self {
                state: state.clone(),
            },
            RadioProbe { state },
        )
    }

    fn record(&self, call: RadioCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl Radio for MockRadio {
    fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    fn start_scan(&mut self, mode: ScanMode) -> Result<()> {
        if self.state.lock().unwrap().fail_scans {
            return Err(LockError::scan_failed("scanner busy"));
        }
        self.record(RadioCall::StartScan(mode));
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.record(RadioCall::StopScan);
    }

    fn connect(&mut self, address: &PeripheralAddress) -> Result<()> {
        if self.state.lock().unwrap().fail_connects {
            return Err(LockError::connect_failed(address, "unknown peripheral"));
        }
        self.record(RadioCall::Connect(address.clone()));
        Ok(())
    }

    fn discover_services(&mut self, address: &PeripheralAddress) -> Result<()> {
        self.record(RadioCall::DiscoverServices(address.clone()));
        Ok(())
    }

    fn subscribe(&mut self, address: &PeripheralAddress, characteristic: Uuid) -> Result<()> {
        self.record(RadioCall::Subscribe(address.clone(), characteristic));
        Ok(())
    }

    fn write(
        &mut self,
        address: &PeripheralAddress,
        characteristic: Uuid,
        request: WriteRequest,
    ) -> Result<()> {
        self.record(RadioCall::Write(
            address.clone(),
            characteristic,
            request.into_payload(),
        ));
        Ok(())
    }

    fn disconnect(&mut self, address: &PeripheralAddress) {
        self.record(RadioCall::Disconnect(address.clone()));
    }
}

impl RadioProbe {
    pub fn calls(&self) -> Vec<RadioCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn count(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    /// Payloads written so far, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                RadioCall::Write(_, _, payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    pub fn fail_scans(&self, fail: bool) {
        self.state.lock().unwrap().fail_scans = fail;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.lock().unwrap().fail_connects = fail;
    }
}

/// Timer that only fires when the test says so
#[derive(Debug, Default, Clone)]
pub struct ManualTimer {
    pending: Arc<Mutex<Vec<(Duration, TimerEvent)>>>,
}

impl ManualTimer {
    pub fn pending(&self) -> Vec<(Duration, TimerEvent)> {
        self.pending.lock().unwrap().clone()
    }

    /// Remove and return the oldest scheduled event
    pub fn pop(&self) -> Option<(Duration, TimerEvent)> {
        let mut pending = self.pending.lock().unwrap();
        (!pending.is_empty()).then(|| pending.remove(0))
    }
}

impl Timer for ManualTimer {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) {
        self.pending.lock().unwrap().push((delay, event));
    }
}
