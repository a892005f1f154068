//! Bluetooth Service Module
//!
//! The connection manager. One task owns the device session, the scanner,
//! the status interpreter and the unlock sequencer; radio callbacks, timer
//! expiries, configuration changes and user commands all reach it as
//! [`Event`]s and are applied one at a time by [`DoorLockService::handle`].

use crate::domain::error::{LockError, Result};
use crate::domain::models::{
    AppEvent, ConnectionState, DoorState, MessageSeverity, PeripheralAddress, ScanRecord,
    UnlockOutcome,
};
use crate::domain::settings::ConfigStore;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, DeviceSession},
    protocol::{self, Command},
    radio::{Advertisement, GattService, Radio, RadioEvent},
    scanner::{BleScanner, ScanFilter, ScanPurpose},
    sequencer::{SequenceStep, UnlockSequencer},
    status::{StatusInterpreter, StatusUpdate},
    timer::{Timer, TimerEvent, TokioTimer},
};
use crate::infrastructure::event_bus::EventBus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where the connection manager is in its flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Connected,
    Disconnected,
}

impl ManagerState {
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Idle | Self::Scanning | Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting | Self::Discovering => ConnectionState::Connecting,
            Self::Connected => ConnectionState::Connected,
        }
    }
}

/// Everything the manager reacts to
#[derive(Debug)]
pub enum Event {
    Radio(RadioEvent),
    Timer(TimerEvent),
    DefaultDeviceChanged(Option<PeripheralAddress>),
    Command(ServiceCommand),
}

/// Requests made through a [`ServiceHandle`]
#[derive(Debug)]
pub enum ServiceCommand {
    Unlock(oneshot::Sender<Result<()>>),
    CancelUnlock,
    Lock(oneshot::Sender<Result<()>>),
    SendCommand(Command, oneshot::Sender<Result<()>>),
    RequestStatus(oneshot::Sender<Result<()>>),
    StartDeviceScan(Option<Duration>, oneshot::Sender<Result<()>>),
    StopDeviceScan,
    Snapshot(oneshot::Sender<ServiceSnapshot>),
    Shutdown,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub state: ManagerState,
    pub connection_state: ConnectionState,
    pub door_state: DoorState,
    pub target: Option<PeripheralAddress>,
    pub session: Option<PeripheralAddress>,
    pub picker_scanning: bool,
    pub unlocking: bool,
}

/// Connection manager for the configured lock
pub struct DoorLockService {
    state: ManagerState,
    target: Option<PeripheralAddress>,
    /// Connect requested, link not up yet
    pending: Option<PeripheralAddress>,
    session: Option<DeviceSession>,
    radio: Box<dyn Radio>,
    timer: Box<dyn Timer>,
    scanner: BleScanner,
    status: StatusInterpreter,
    sequencer: UnlockSequencer,
    config: Arc<dyn ConfigStore>,
    connection_config: ConnectionConfig,
    picker_window: Duration,
    events: EventBus,
    radio_unavailable_reported: bool,
}

impl DoorLockService {
    /// Create a new connection manager
    pub fn new(
        radio: Box<dyn Radio>,
        timer: Box<dyn Timer>,
        config: Arc<dyn ConfigStore>,
        events: EventBus,
    ) -> Self {
        let settings = config.settings();
        Self {
            state: ManagerState::Idle,
            target: settings.default_device_address.clone(),
            pending: None,
            session: None,
            radio,
            timer,
            scanner: BleScanner::new(),
            status: StatusInterpreter::new(settings.error_status_sets_door_state),
            sequencer: UnlockSequencer::new(settings.key_delay()),
            connection_config: ConnectionConfig::from_settings(&settings),
            picker_window: settings.picker_scan_window(),
            config,
            events,
            radio_unavailable_reported: false,
        }
    }

    /// Run the manager on its own task with the tokio timer.
    ///
    /// `sender` must be the sending side of `receiver`; radio backends post
    /// their callbacks into the same channel.
    pub fn spawn(
        radio: Box<dyn Radio>,
        config: Arc<dyn ConfigStore>,
        events: EventBus,
        sender: mpsc::UnboundedSender<Event>,
        receiver: mpsc::UnboundedReceiver<Event>,
    ) -> (ServiceHandle, JoinHandle<()>) {
        let timer = Box::new(TokioTimer::new(sender.clone()));
        let service = Self::new(radio, timer, config, events);
        let task = tokio::spawn(service.run(receiver));
        (ServiceHandle::new(sender), task)
    }

    /// Process events until shutdown or until every sender is gone.
    pub async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Event>) {
        let mut address_rx = Some(self.config.subscribe());
        if let Some(rx) = address_rx.as_mut() {
            // Changes made since construction are picked up here, not replayed.
            self.target = rx.borrow_and_update().clone();
        }
        self.start();

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle(event) {
                        break;
                    }
                }
                changed = next_address(&mut address_rx) => match changed {
                    Some(address) => {
                        self.handle(Event::DefaultDeviceChanged(address));
                    }
                    None => {
                        debug!("Configuration store dropped its change hook");
                        address_rx = None;
                    }
                },
            }
        }

        self.teardown();
        info!("Lock service stopped");
    }

    /// Kick off the flow for the configured address.
    pub fn start(&mut self) {
        info!("Starting lock service, target {:?}", self.target);
        self.start_flow();
    }

    /// Apply one event. Returns false once the service should stop.
    pub fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Radio(event) => self.on_radio_event(event),
            Event::Timer(event) => self.on_timer(event),
            Event::DefaultDeviceChanged(address) => self.on_default_device_changed(address),
            Event::Command(ServiceCommand::Shutdown) => return false,
            Event::Command(command) => self.on_command(command),
        }
        true
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            state: self.state,
            connection_state: self.state.connection_state(),
            door_state: self.status.door_state(),
            target: self.target.clone(),
            session: self.session.as_ref().map(|s| s.address().clone()),
            picker_scanning: self.scanner.is_scanning(ScanPurpose::DevicePicker),
            unlocking: self.sequencer.is_active(),
        }
    }

    fn set_state(&mut self, state: ManagerState) {
        if self.state == state {
            return;
        }
        info!("Connection state {:?} -> {:?}", self.state, state);
        self.state = state;
        if matches!(
            state,
            ManagerState::Connecting | ManagerState::Connected | ManagerState::Disconnected
        ) {
            self.events
                .publish(AppEvent::ConnectionStateChanged(state.connection_state()));
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ManagerState::Connected
            && self.session.as_ref().is_some_and(DeviceSession::is_ready)
    }

    /// Scan for the target unless a link is already up or underway.
    fn start_flow(&mut self) {
        if self.session.is_some() || self.pending.is_some() {
            return;
        }
        let Some(target) = self.target.clone() else {
            debug!("No default device configured");
            if self.state == ManagerState::Scanning {
                self.scanner.stop_scan(self.radio.as_mut(), ScanPurpose::AutoConnect);
                self.set_state(ManagerState::Idle);
            }
            return;
        };
        if !self.radio.is_enabled() {
            self.report_radio_unavailable();
            return;
        }

        match self.scanner.start_scan(
            self.radio.as_mut(),
            self.timer.as_mut(),
            ScanPurpose::AutoConnect,
            ScanFilter::Address(target),
            None,
        ) {
            Ok(_) => self.set_state(ManagerState::Scanning),
            Err(e) => self.report_failure(&e),
        }
    }

    fn report_failure(&self, error: &LockError) {
        let severity = if error.is_recoverable() {
            warn!("{}", error);
            MessageSeverity::Warning
        } else {
            error!("{}", error);
            MessageSeverity::Error
        };
        self.events.log(error.to_string(), severity);
    }

    fn report_radio_unavailable(&mut self) {
        if self.radio_unavailable_reported {
            return;
        }
        self.radio_unavailable_reported = true;
        error!("{}; waiting for the adapter to be enabled", LockError::RadioUnavailable);
        self.events
            .log(LockError::RadioUnavailable.to_string(), MessageSeverity::Error);
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::AdapterStateChanged { enabled } => self.on_adapter_state(enabled),
            RadioEvent::Advertisement(adv) => self.on_advertisement(adv),
            RadioEvent::ScanFailed { reason } => self.on_scan_failed(reason),
            RadioEvent::Connected(address) => self.on_connected(address),
            RadioEvent::ConnectFailed { address, reason } => {
                if self.pending.as_ref() == Some(&address) {
                    self.report_failure(&LockError::connect_failed(&address, reason));
                    self.link_lost();
                }
            }
            RadioEvent::Disconnected(address) => self.on_disconnected(address),
            RadioEvent::ServicesDiscovered { address, services } => {
                self.on_services_discovered(address, services)
            }
            RadioEvent::DiscoveryFailed { address, reason } => {
                self.on_discovery_failed(LockError::discovery_failed(&address, reason))
            }
            RadioEvent::Notification {
                address,
                characteristic,
                value,
            } => self.on_notification(address, characteristic, value),
            RadioEvent::WriteFailed { address, reason } => {
                if !self.is_session(&address) {
                    debug!("Ignoring write failure from {}", address);
                    return;
                }
                warn!("Write to {} failed: {}", address, reason);
                if self.sequencer.cancel() {
                    self.finish_unlock(UnlockOutcome::Failed(reason));
                }
            }
        }
    }

    fn on_adapter_state(&mut self, enabled: bool) {
        if enabled {
            info!("Bluetooth adapter enabled");
            self.radio_unavailable_reported = false;
            self.start_flow();
            return;
        }

        self.teardown();
        if self.state != ManagerState::Idle {
            self.set_state(ManagerState::Disconnected);
        }
        self.report_radio_unavailable();
    }

    fn on_advertisement(&mut self, adv: Advertisement) {
        for sighting in self.scanner.on_advertisement(&adv) {
            match sighting.purpose {
                ScanPurpose::DevicePicker => {
                    if sighting.is_new {
                        info!(
                            "Found device {} ({})",
                            sighting.record.display_name(),
                            sighting.record.address
                        );
                        self.events.publish(AppEvent::DeviceFound(sighting.record));
                    }
                }
                ScanPurpose::AutoConnect => {
                    if self.state == ManagerState::Scanning
                        && self.target.as_ref() == Some(&sighting.record.address)
                    {
                        debug!("Found default device");
                        self.connect_to(sighting.record.address);
                    }
                }
            }
        }
    }

    fn on_scan_failed(&mut self, reason: String) {
        warn!("{}", LockError::scan_failed(reason.clone()));
        self.events
            .log(format!("Scan failed: {}", reason), MessageSeverity::Warning);
        let stopped = self.scanner.on_scan_failed();
        if stopped.contains(&ScanPurpose::DevicePicker) {
            self.events.publish(AppEvent::ScanningChanged(false));
        }
        if self.state == ManagerState::Scanning {
            self.set_state(ManagerState::Disconnected);
        }
    }

    /// Open a link, tearing down any other one first.
    fn connect_to(&mut self, address: PeripheralAddress) {
        let current = self
            .session
            .as_ref()
            .map(|s| s.address().clone())
            .or_else(|| self.pending.clone());
        match current {
            Some(current) if current == address => return,
            Some(_) => self.teardown_link(),
            None => {}
        }

        self.scanner
            .stop_scan(self.radio.as_mut(), ScanPurpose::AutoConnect);
        info!("Connecting to {}", address);
        self.set_state(ManagerState::Connecting);
        match self.radio.connect(&address) {
            Ok(()) => self.pending = Some(address),
            Err(e) => {
                warn!("{}", e);
                self.link_lost();
            }
        }
    }

    fn on_connected(&mut self, address: PeripheralAddress) {
        if self.pending.as_ref() != Some(&address) {
            debug!("Ignoring connect event for {}", address);
            return;
        }
        info!("Connected to GATT server {}", address);
        self.pending = None;
        self.session = Some(DeviceSession::new(address.clone()));
        self.set_state(ManagerState::Discovering);

        if let Err(e) = self.radio.discover_services(&address) {
            self.on_discovery_failed(e);
        }
    }

    fn on_services_discovered(&mut self, address: PeripheralAddress, services: Vec<GattService>) {
        if self.state != ManagerState::Discovering || !self.is_session(&address) {
            debug!("Ignoring discovery result for {}", address);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let attached = session
            .attach_serial(&services, &self.connection_config)
            .and_then(|characteristic| self.radio.subscribe(&address, characteristic));
        if let Err(e) = attached {
            self.on_discovery_failed(e);
            return;
        }

        // Whatever the door did while we were away is unknown until queried.
        self.status.reset();
        self.events
            .publish(AppEvent::DoorStateChanged(DoorState::Unknown));
        self.set_state(ManagerState::Connected);
        self.events.log("Connected to lock", MessageSeverity::Success);

        if let Err(e) = self.write_command(Command::StatusQuery) {
            warn!("Status query failed: {}", e);
        }
    }

    fn on_discovery_failed(&mut self, error: LockError) {
        if let LockError::DiscoveryFailed { address, .. } = &error {
            if !self.is_session(address) {
                return;
            }
        }
        self.report_failure(&error);
        self.link_lost();
    }

    fn on_disconnected(&mut self, address: PeripheralAddress) {
        if self.pending.as_ref() != Some(&address) && !self.is_session(&address) {
            debug!("Ignoring disconnect from {}", address);
            return;
        }
        info!("Disconnected from GATT server {}", address);
        self.link_lost();
    }

    fn on_notification(&mut self, address: PeripheralAddress, characteristic: Uuid, value: Vec<u8>) {
        let serial = self
            .session
            .as_ref()
            .filter(|s| *s.address() == address)
            .and_then(DeviceSession::serial_characteristic);
        if serial != Some(characteristic) {
            return;
        }

        match self.status.interpret(&value) {
            StatusUpdate::DoorState(state) => {
                self.events.publish(AppEvent::DoorStateChanged(state));
            }
            StatusUpdate::LockError => {
                self.events
                    .log("Error status received from lock", MessageSeverity::Error);
                if self.status.door_state() == DoorState::Error {
                    self.events
                        .publish(AppEvent::DoorStateChanged(DoorState::Error));
                }
            }
            StatusUpdate::Ignored => {}
        }
    }

    /// The link is gone: release it on the radio side too and go looking again.
    fn link_lost(&mut self) {
        self.teardown_link();
        self.set_state(ManagerState::Disconnected);
        self.start_flow();
    }

    /// Actively close the current or pending link.
    fn teardown_link(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Tearing down session with {}", session.address());
            self.radio.disconnect(session.address());
        }
        if let Some(pending) = self.pending.take() {
            self.radio.disconnect(&pending);
        }
        if self.sequencer.cancel() {
            self.finish_unlock(UnlockOutcome::Failed(LockError::NotConnected.to_string()));
        }
    }

    /// Close links and stop all scans.
    fn teardown(&mut self) {
        self.teardown_link();
        let picker = self.scanner.is_scanning(ScanPurpose::DevicePicker);
        self.scanner.stop_all(self.radio.as_mut());
        if picker {
            self.events.publish(AppEvent::ScanningChanged(false));
        }
    }

    fn on_default_device_changed(&mut self, address: Option<PeripheralAddress>) {
        if address == self.target {
            debug!("Default device unchanged");
            if matches!(self.state, ManagerState::Idle | ManagerState::Disconnected) {
                self.start_flow();
            }
            return;
        }
        info!("Default device changed to {:?}", address);
        self.target = address;

        let current = self
            .session
            .as_ref()
            .map(|s| s.address().clone())
            .or_else(|| self.pending.clone());
        if current.is_some() {
            self.teardown_link();
            self.set_state(ManagerState::Disconnected);
        }
        self.start_flow();
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ScanWindowElapsed(id) => {
                if self.scanner.on_window_elapsed(self.radio.as_mut(), id)
                    == Some(ScanPurpose::DevicePicker)
                {
                    info!("Device scan window elapsed");
                    self.events.publish(AppEvent::ScanningChanged(false));
                }
            }
            TimerEvent::UnlockStep(id) => {
                if let Some(step) = self.sequencer.next_step(id) {
                    self.write_step(step);
                }
            }
        }
    }

    fn on_command(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::Unlock(reply) => {
                let passcode = self.config.passcode();
                match self.sequencer.submit(&passcode, self.is_connected()) {
                    Ok(step) => {
                        let _ = reply.send(Ok(()));
                        self.write_step(step);
                    }
                    Err(e) => {
                        warn!("Unlock rejected: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            ServiceCommand::CancelUnlock => {
                if self.sequencer.cancel() {
                    self.finish_unlock(UnlockOutcome::Cancelled);
                }
            }
            ServiceCommand::Lock(reply) => {
                info!("Lock requested; the lock has no lock command");
                let _ = reply.send(Err(LockError::unsupported("lock")));
            }
            ServiceCommand::SendCommand(command, reply) => {
                let result = if self.sequencer.is_active() {
                    Err(LockError::UnlockInProgress)
                } else {
                    self.write_command(command)
                };
                let _ = reply.send(result);
            }
            ServiceCommand::RequestStatus(reply) => {
                let result = if self.sequencer.is_active() {
                    Err(LockError::UnlockInProgress)
                } else {
                    self.write_command(Command::StatusQuery)
                };
                let _ = reply.send(result);
            }
            ServiceCommand::StartDeviceScan(window, reply) => {
                let _ = reply.send(self.start_device_scan(window));
            }
            ServiceCommand::StopDeviceScan => {
                if self
                    .scanner
                    .stop_scan(self.radio.as_mut(), ScanPurpose::DevicePicker)
                {
                    self.events.publish(AppEvent::ScanningChanged(false));
                }
            }
            ServiceCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ServiceCommand::Shutdown => {}
        }
    }

    fn start_device_scan(&mut self, window: Option<Duration>) -> Result<()> {
        if !self.radio.is_enabled() {
            return Err(LockError::RadioUnavailable);
        }
        let window = window.unwrap_or(self.picker_window);
        self.scanner.start_scan(
            self.radio.as_mut(),
            self.timer.as_mut(),
            ScanPurpose::DevicePicker,
            ScanFilter::Service(self.connection_config.service_uuid),
            Some(window),
        )?;
        self.events.publish(AppEvent::ScanningChanged(true));

        // List the current default first so it can be re-selected.
        if let Some(address) = self.target.clone() {
            let name = self
                .config
                .default_name()
                .unwrap_or_else(|| "Default Device".to_string());
            self.events.publish(AppEvent::DeviceFound(ScanRecord {
                address,
                name: Some(name),
                signal_strength: None,
                timestamp: SystemTime::now(),
            }));
        }
        Ok(())
    }

    /// Write one key of the unlock sequence and schedule the next.
    fn write_step(&mut self, step: SequenceStep) {
        if let Err(e) = self.write_command(step.command) {
            warn!("Unlock sequence aborted: {}", e);
            self.sequencer.cancel();
            self.finish_unlock(UnlockOutcome::Failed(e.to_string()));
            return;
        }
        if step.is_last {
            self.finish_unlock(UnlockOutcome::Completed);
        } else {
            self.timer
                .schedule(self.sequencer.key_delay(), TimerEvent::UnlockStep(step.id));
        }
    }

    fn finish_unlock(&mut self, outcome: UnlockOutcome) {
        info!("Unlock sequence finished: {:?}", outcome);
        self.events.publish(AppEvent::UnlockFinished(outcome));
    }

    fn write_command(&mut self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(LockError::NotConnected);
        }
        let Some(session) = self.session.as_ref() else {
            return Err(LockError::NotConnected);
        };
        debug!("Sending {:?}", command);
        session.write(self.radio.as_mut(), protocol::encode_command(command))
    }

    fn is_session(&self, address: &PeripheralAddress) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.address() == address)
    }
}

async fn next_address(
    rx: &mut Option<watch::Receiver<Option<PeripheralAddress>>>,
) -> Option<Option<PeripheralAddress>> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Cloneable front door to a running [`DoorLockService`]
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    sender: mpsc::UnboundedSender<Event>,
}

impl ServiceHandle {
    pub fn new(sender: mpsc::UnboundedSender<Event>) -> Self {
        Self { sender }
    }

    /// Submit the configured passcode. Resolves once the first key is
    /// written; the end of the sequence is published as `UnlockFinished`.
    pub async fn unlock(&self) -> Result<()> {
        self.request(ServiceCommand::Unlock).await?
    }

    pub fn cancel_unlock(&self) -> Result<()> {
        self.send(ServiceCommand::CancelUnlock)
    }

    pub async fn lock(&self) -> Result<()> {
        self.request(ServiceCommand::Lock).await?
    }

    /// Send a single keypad key
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.request(|reply| ServiceCommand::SendCommand(command, reply))
            .await?
    }

    pub async fn request_status(&self) -> Result<()> {
        self.request(ServiceCommand::RequestStatus).await?
    }

    /// Look for nearby locks; `None` uses the configured window.
    pub async fn start_device_scan(&self, window: Option<Duration>) -> Result<()> {
        self.request(|reply| ServiceCommand::StartDeviceScan(window, reply))
            .await?
    }

    pub fn stop_device_scan(&self) -> Result<()> {
        self.send(ServiceCommand::StopDeviceScan)
    }

    pub async fn snapshot(&self) -> Result<ServiceSnapshot> {
        self.request(ServiceCommand::Snapshot).await
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ServiceCommand::Shutdown)
    }

    /// Queue for radio backends and other event sources
    pub fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.sender.clone()
    }

    fn send(&self, command: ServiceCommand) -> Result<()> {
        self.sender
            .send(Event::Command(command))
            .map_err(|_| LockError::ServiceStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply))?;
        response.await.map_err(|_| LockError::ServiceStopped)
    }
}
