//! btleplug radio backend
//!
//! Every [`Radio`] call feeds a task and returns at once. Scan start/stop
//! requests go through one queue and each open link has its own task that
//! owns the peripheral, so both reach the adapter in the order issued.

use crate::domain::error::{LockError, Result};
use crate::domain::models::PeripheralAddress;
use crate::infrastructure::bluetooth::protocol::WriteRequest;
use crate::infrastructure::bluetooth::radio::{
    Advertisement, GattService, Radio, RadioEvent, ScanMode,
};
use crate::infrastructure::bluetooth::service::Event;
use anyhow::Context;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type EventSender = mpsc::UnboundedSender<Event>;
type PeripheralMap = Arc<Mutex<HashMap<PeripheralAddress, Peripheral>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanRequest {
    Start,
    Stop,
}

/// Adapter-level scan switch, awaited one request at a time
trait ScanControl: Send + Sync + 'static {
    fn start(&self) -> impl Future<Output = std::result::Result<(), String>> + Send;
    fn stop(&self) -> impl Future<Output = std::result::Result<(), String>> + Send;
}

impl ScanControl for Adapter {
    fn start(&self) -> impl Future<Output = std::result::Result<(), String>> + Send {
        let adapter = self.clone();
        async move {
            adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(|e| e.to_string())
        }
    }

    fn stop(&self) -> impl Future<Output = std::result::Result<(), String>> + Send {
        let adapter = self.clone();
        async move { adapter.stop_scan().await.map_err(|e| e.to_string()) }
    }
}

async fn run_scan_queue<C: ScanControl>(
    control: C,
    mut requests: mpsc::UnboundedReceiver<ScanRequest>,
    events: EventSender,
) {
    while let Some(request) = requests.recv().await {
        match request {
            ScanRequest::Start => {
                if let Err(reason) = control.start().await {
                    let _ = events.send(Event::Radio(RadioEvent::ScanFailed { reason }));
                }
            }
            ScanRequest::Stop => {
                if let Err(e) = control.stop().await {
                    debug!("Failed to stop scan: {}", e);
                }
            }
        }
    }
}

#[derive(Debug)]
enum LinkRequest {
    Discover,
    Subscribe(Uuid),
    Write(Uuid, Vec<u8>),
    Disconnect,
}

/// Radio backed by the first Bluetooth adapter on the system
pub struct BtleplugRadio {
    events: EventSender,
    scans: mpsc::UnboundedSender<ScanRequest>,
    enabled: Arc<AtomicBool>,
    peripherals: PeripheralMap,
    links: HashMap<PeripheralAddress, mpsc::UnboundedSender<LinkRequest>>,
    pump: JoinHandle<()>,
    scan_queue: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Open the first adapter and start forwarding its events.
    pub async fn new(events: EventSender) -> anyhow::Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to create Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }

        let state = adapter.adapter_state().await.unwrap_or(CentralState::Unknown);
        let enabled = Arc::new(AtomicBool::new(state != CentralState::PoweredOff));
        let peripherals: PeripheralMap = Arc::default();

        let stream = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let pump = tokio::spawn(pump_adapter_events(
            adapter.clone(),
            stream,
            events.clone(),
            enabled.clone(),
            peripherals.clone(),
        ));

        let (scans, scan_rx) = mpsc::unbounded_channel();
        let scan_queue = tokio::spawn(run_scan_queue(adapter, scan_rx, events.clone()));

        Ok(Self {
            events,
            scans,
            enabled,
            peripherals,
            links: HashMap::new(),
            pump,
            scan_queue,
        })
    }

    fn link(&self, address: &PeripheralAddress) -> Result<&mpsc::UnboundedSender<LinkRequest>> {
        self.links.get(address).ok_or(LockError::NotConnected)
    }

    fn request(&self, address: &PeripheralAddress, request: LinkRequest) -> Result<()> {
        self.link(address)?
            .send(request)
            .map_err(|_| LockError::NotConnected)
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.pump.abort();
        self.scan_queue.abort();
    }
}

impl Radio for BtleplugRadio {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn start_scan(&mut self, mode: ScanMode) -> Result<()> {
        if !self.is_enabled() {
            return Err(LockError::RadioUnavailable);
        }
        // btleplug exposes no duty cycle; every scan is the platform default.
        debug!("Starting adapter scan ({:?})", mode);
        self.scans
            .send(ScanRequest::Start)
            .map_err(|_| LockError::scan_failed("scan queue closed"))
    }

    fn stop_scan(&mut self) {
        let _ = self.scans.send(ScanRequest::Stop);
    }

    fn connect(&mut self, address: &PeripheralAddress) -> Result<()> {
        let peripheral = self
            .peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(address)
            .cloned()
            .ok_or_else(|| LockError::connect_failed(address, "peripheral not seen by adapter"))?;

        if let Some(previous) = self.links.remove(address) {
            let _ = previous.send(LinkRequest::Disconnect);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(peripheral, address.clone(), rx, self.events.clone()));
        self.links.insert(address.clone(), tx);
        Ok(())
    }

    fn discover_services(&mut self, address: &PeripheralAddress) -> Result<()> {
        self.request(address, LinkRequest::Discover)
            .map_err(|_| LockError::discovery_failed(address, "no open link"))
    }

    fn subscribe(&mut self, address: &PeripheralAddress, characteristic: Uuid) -> Result<()> {
        self.request(address, LinkRequest::Subscribe(characteristic))
    }

    fn write(
        &mut self,
        address: &PeripheralAddress,
        characteristic: Uuid,
        request: WriteRequest,
    ) -> Result<()> {
        self.request(
            address,
            LinkRequest::Write(characteristic, request.into_payload()),
        )
    }

    fn disconnect(&mut self, address: &PeripheralAddress) {
        if let Some(link) = self.links.remove(address) {
            let _ = link.send(LinkRequest::Disconnect);
        }
    }
}

fn peripheral_address(peripheral: &Peripheral) -> Option<PeripheralAddress> {
    PeripheralAddress::new(peripheral.address().to_string()).ok()
}

async fn address_of(adapter: &Adapter, id: &PeripheralId) -> Option<PeripheralAddress> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    peripheral_address(&peripheral)
}

async fn pump_adapter_events(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: EventSender,
    enabled: Arc<AtomicBool>,
    peripherals: PeripheralMap,
) {
    while let Some(event) = stream.next().await {
        let radio_event = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let Some(address) = peripheral_address(&peripheral) else {
                    continue;
                };
                peripherals
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(address.clone(), peripheral);
                RadioEvent::Advertisement(Advertisement {
                    address,
                    name: props.local_name,
                    rssi: props.rssi,
                    services: props.services,
                    timestamp: SystemTime::now(),
                })
            }
            CentralEvent::DeviceDisconnected(id) => match address_of(&adapter, &id).await {
                Some(address) => RadioEvent::Disconnected(address),
                None => continue,
            },
            CentralEvent::StateUpdate(state) => {
                let on = state != CentralState::PoweredOff;
                if enabled.swap(on, Ordering::SeqCst) == on {
                    continue;
                }
                RadioEvent::AdapterStateChanged { enabled: on }
            }
            _ => continue,
        };
        if events.send(Event::Radio(radio_event)).is_err() {
            break;
        }
    }
    debug!("Adapter event stream ended");
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

fn collect_services(peripheral: &Peripheral) -> Vec<GattService> {
    peripheral
        .services()
        .into_iter()
        .map(|service| GattService {
            uuid: service.uuid,
            characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
        })
        .collect()
}

/// Owns one peripheral for the lifetime of a link.
async fn run_link(
    peripheral: Peripheral,
    address: PeripheralAddress,
    mut requests: mpsc::UnboundedReceiver<LinkRequest>,
    events: EventSender,
) {
    let send = |event: RadioEvent| {
        let _ = events.send(Event::Radio(event));
    };

    if let Err(e) = peripheral.connect().await {
        send(RadioEvent::ConnectFailed {
            address,
            reason: e.to_string(),
        });
        return;
    }
    send(RadioEvent::Connected(address.clone()));

    let mut forwarder: Option<JoinHandle<()>> = None;
    while let Some(request) = requests.recv().await {
        match request {
            LinkRequest::Discover => match peripheral.discover_services().await {
                Ok(()) => send(RadioEvent::ServicesDiscovered {
                    address: address.clone(),
                    services: collect_services(&peripheral),
                }),
                Err(e) => send(RadioEvent::DiscoveryFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                }),
            },
            LinkRequest::Subscribe(uuid) => {
                match subscribe(&peripheral, &address, uuid, events.clone()).await {
                    Ok(task) => {
                        if let Some(old) = forwarder.replace(task) {
                            old.abort();
                        }
                    }
                    Err(reason) => send(RadioEvent::DiscoveryFailed {
                        address: address.clone(),
                        reason,
                    }),
                }
            }
            LinkRequest::Write(uuid, payload) => {
                let Some(characteristic) = find_characteristic(&peripheral, uuid) else {
                    send(RadioEvent::WriteFailed {
                        address: address.clone(),
                        reason: format!("characteristic {} not found", uuid),
                    });
                    continue;
                };
                let write_type = if characteristic
                    .properties
                    .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
                {
                    WriteType::WithoutResponse
                } else {
                    WriteType::WithResponse
                };
                if let Err(e) = peripheral.write(&characteristic, &payload, write_type).await {
                    warn!("Write to {} failed: {}", address, e);
                    send(RadioEvent::WriteFailed {
                        address: address.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            LinkRequest::Disconnect => break,
        }
    }

    if let Some(task) = forwarder {
        task.abort();
    }
    if let Err(e) = peripheral.disconnect().await {
        debug!("Disconnect from {} failed: {}", address, e);
    }
}

async fn subscribe(
    peripheral: &Peripheral,
    address: &PeripheralAddress,
    uuid: Uuid,
    events: EventSender,
) -> std::result::Result<JoinHandle<()>, String> {
    let characteristic = find_characteristic(peripheral, uuid)
        .ok_or_else(|| format!("characteristic {} not found", uuid))?;
    peripheral
        .subscribe(&characteristic)
        .await
        .map_err(|e| e.to_string())?;
    let mut notifications = peripheral.notifications().await.map_err(|e| e.to_string())?;
    info!("Subscribed to notifications from {}", address);

    let address = address.clone();
    Ok(tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            let event = RadioEvent::Notification {
                address: address.clone(),
                characteristic: notification.uuid,
                value: notification.value,
            };
            if events.send(Event::Radio(event)).is_err() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SlowAdapter {
        done: Arc<Mutex<Vec<ScanRequest>>>,
        fail_start: bool,
    }

    impl ScanControl for SlowAdapter {
        fn start(&self) -> impl Future<Output = std::result::Result<(), String>> + Send {
            let done = self.done.clone();
            let fail = self.fail_start;
            async move {
                done.lock().unwrap().push(ScanRequest::Start);
                if fail {
                    Err("already scanning".to_string())
                } else {
                    Ok(())
                }
            }
        }

        fn stop(&self) -> impl Future<Output = std::result::Result<(), String>> + Send {
            let done = self.done.clone();
            async move {
                // Stopping takes longer than starting on a real stack.
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.lock().unwrap().push(ScanRequest::Stop);
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_requests_complete_in_order() {
        let adapter = SlowAdapter::default();
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let (scans, scan_rx) = mpsc::unbounded_channel();
        let queue = tokio::spawn(run_scan_queue(adapter.clone(), scan_rx, events));

        for request in [ScanRequest::Start, ScanRequest::Stop, ScanRequest::Start] {
            scans.send(request).unwrap();
        }
        drop(scans);
        queue.await.unwrap();

        assert_eq!(
            *adapter.done.lock().unwrap(),
            vec![ScanRequest::Start, ScanRequest::Stop, ScanRequest::Start]
        );
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_start_reported() {
        let adapter = SlowAdapter {
            fail_start: true,
            ..Default::default()
        };
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let (scans, scan_rx) = mpsc::unbounded_channel();
        let queue = tokio::spawn(run_scan_queue(adapter, scan_rx, events));

        scans.send(ScanRequest::Start).unwrap();
        drop(scans);
        queue.await.unwrap();

        match event_rx.try_recv() {
            Ok(Event::Radio(RadioEvent::ScanFailed { reason })) => {
                assert_eq!(reason, "already scanning")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
