// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BLE GATT client on top of BlueZ.
//!
//! Each [`Transport`] request spawns a task on the tokio runtime that performs
//! the D-Bus call and posts the completion event to the event queue.

use anyhow::{Context, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use futures::{pin_mut, Future, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ble_constants::SERVICE_UUID;
use super::transport::{Channel, DiscoveredLock, Transport, TransportError};
use crate::events::{Event, EventSender};

/// How long to wait for BlueZ to resolve services after connecting.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state shared with the spawned request tasks.
#[derive(Default)]
struct Link {
    device: Option<Device>,
    service_found: bool,
    characteristics: HashMap<Channel, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
    closing: Option<JoinHandle<()>>,
}

/// GATT client for the lock service.
pub struct GattClient {
    adapter: Adapter,
    events: EventSender,
    powered: Arc<AtomicBool>,
    link: Arc<Mutex<Link>>,
}

impl GattClient {
    /// Open the named adapter, or the default one.
    pub async fn new(events: EventSender, adapter_name: Option<&str>) -> Result<Self> {
        let adapter = open_adapter(adapter_name).await?;
        let powered = adapter.is_powered().await?;
        info!(
            "Using Bluetooth adapter: {} (powered: {})",
            adapter.name(),
            powered
        );

        Ok(Self {
            adapter,
            events,
            powered: Arc::new(AtomicBool::new(powered)),
            link: Arc::new(Mutex::new(Link::default())),
        })
    }

    fn device(&self) -> Result<Device, TransportError> {
        self.link
            .lock()
            .device
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, channel: Channel) -> Result<Characteristic, TransportError> {
        let link = self.link.lock();
        if link.device.is_none() {
            return Err(TransportError::NotConnected);
        }
        link.characteristics
            .get(&channel)
            .cloned()
            .ok_or(TransportError::ChannelUnavailable(channel))
    }

    /// Run a request in the background and keep its handle until close.
    fn spawn<F>(&self, request: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(request);
        let mut link = self.link.lock();
        link.tasks.retain(|task| !task.is_finished());
        link.tasks.push(handle);
    }

    fn start_disconnect_monitor(&self, device: Device) {
        let events = self.events.clone();

        self.spawn(async move {
            let device_events = match device.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot monitor connection state: {}", e);
                    return;
                }
            };
            pin_mut!(device_events);

            while let Some(DeviceEvent::PropertyChanged(property)) = device_events.next().await {
                if let DeviceProperty::Connected(false) = property {
                    info!("Lock {} disconnected", device.address());
                    let _ = events.send(Event::Disconnected);
                    break;
                }
            }
        });
    }
}

impl Transport for GattClient {
    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn request_enable(&mut self) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let powered = self.powered.clone();
        let events = self.events.clone();

        self.spawn(async move {
            info!("Powering on Bluetooth adapter...");
            match adapter.set_powered(true).await {
                Ok(()) => {
                    powered.store(true, Ordering::SeqCst);
                    let _ = events.send(Event::BluetoothEnabled);
                }
                Err(e) => {
                    error!("Failed to power on adapter: {}", e);
                    let _ = events.send(Event::Failure);
                }
            }
        });
        Ok(())
    }

    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        let address = parse_address(address)?;
        let device = self
            .adapter
            .device(address)
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        {
            let mut link = self.link.lock();
            link.device = Some(device.clone());
            link.service_found = false;
            link.characteristics.clear();
        }
        self.start_disconnect_monitor(device.clone());

        let events = self.events.clone();
        self.spawn(async move {
            info!("Connecting to {}...", address);
            match device.connect().await {
                Ok(()) => {
                    info!("Connected to {}", address);
                    let _ = events.send(Event::Connected);
                }
                Err(e) => {
                    error!("Connection to {} failed: {}", address, e);
                    let _ = events.send(Event::Failure);
                }
            }
        });
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        let device = self.device()?;
        let link = self.link.clone();
        let events = self.events.clone();

        self.spawn(async move {
            match resolve_lock_service(&device).await {
                Ok((service_found, characteristics)) => {
                    debug!(
                        "Service discovery done (lock service: {}, characteristics: {})",
                        service_found,
                        characteristics.len()
                    );
                    {
                        let mut link = link.lock();
                        link.service_found = service_found;
                        link.characteristics = characteristics;
                    }
                    let _ = events.send(Event::ServicesDiscovered);
                }
                Err(e) => {
                    error!("Service discovery failed: {:#}", e);
                    let _ = events.send(Event::Failure);
                }
            }
        });
        Ok(())
    }

    fn has_service(&self) -> bool {
        self.link.lock().service_found
    }

    fn has_channel(&self, channel: Channel) -> bool {
        self.link.lock().characteristics.contains_key(&channel)
    }

    fn subscribe(&mut self, channel: Channel) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?;
        let events = self.events.clone();

        self.spawn(async move {
            let notifications = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Subscribing to {} failed: {}", channel, e);
                    let _ = events.send(Event::Failure);
                    return;
                }
            };
            debug!("Subscribed to {}", channel);
            let _ = events.send(Event::SubscribeAck(channel));

            pin_mut!(notifications);
            while let Some(value) = notifications.next().await {
                debug!("Notification on {} ({} bytes)", channel, value.len());
                if events
                    .send(Event::NotificationReceived(channel, value))
                    .is_err()
                {
                    break;
                }
            }
            debug!("Notifications on {} ended", channel);
        });
        Ok(())
    }

    fn write(&mut self, channel: Channel, value: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?;
        let value = value.to_vec();
        let events = self.events.clone();

        self.spawn(async move {
            match characteristic.write(&value).await {
                Ok(()) => {
                    debug!("Wrote {} bytes to {}", value.len(), channel);
                    let _ = events.send(Event::WriteAck(channel));
                }
                Err(e) => {
                    error!("Write to {} failed: {}", channel, e);
                    let _ = events.send(Event::Failure);
                }
            }
        });
        Ok(())
    }

    fn close(&mut self) {
        let (device, tasks) = {
            let mut link = self.link.lock();
            let closing = link.closing.take();
            let link = std::mem::replace(
                &mut *link,
                Link {
                    closing,
                    ..Link::default()
                },
            );
            (link.device, link.tasks)
        };

        // Stop the monitor before disconnecting so no Disconnected is posted.
        for task in tasks {
            task.abort();
        }

        if let Some(device) = device {
            let closing = tokio::spawn(async move {
                if let Err(e) = device.disconnect().await {
                    debug!("Disconnect from {} failed: {}", device.address(), e);
                }
            });
            self.link.lock().closing = Some(closing);
        }
    }

    fn take_close_task(&mut self) -> Option<JoinHandle<()>> {
        self.link.lock().closing.take()
    }
}

fn parse_address(address: &str) -> Result<Address, TransportError> {
    address
        .parse::<Address>()
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))
}

async fn open_adapter(name: Option<&str>) -> Result<Adapter> {
    let session = bluer::Session::new()
        .await
        .context("Failed to open BlueZ session")?;
    match name {
        Some(name) => session
            .adapter(name)
            .with_context(|| format!("Bluetooth adapter {} not found", name)),
        None => session
            .default_adapter()
            .await
            .context("No Bluetooth adapter found"),
    }
}

/// Wait for BlueZ to resolve services, then collect the lock characteristics.
async fn resolve_lock_service(device: &Device) -> Result<(bool, HashMap<Channel, Characteristic>)> {
    let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
    while !device.is_services_resolved().await? {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("Services of {} not resolved in time", device.address());
        }
        tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
    }

    let mut service_found = false;
    let mut characteristics = HashMap::new();
    for service in device.services().await? {
        if service.uuid().await? != SERVICE_UUID {
            continue;
        }
        service_found = true;
        for characteristic in service.characteristics().await? {
            if let Some(channel) = Channel::from_uuid(characteristic.uuid().await?) {
                characteristics.insert(channel, characteristic);
            }
        }
    }

    Ok((service_found, characteristics))
}

/// Scan for devices advertising the lock service.
///
/// Runs for `timeout`. A device reported more than once is listed once.
/// Devices whose service UUIDs were not known yet when they showed up are
/// checked again when the scan ends.
pub async fn scan(adapter_name: Option<&str>, timeout: Duration) -> Result<Vec<DiscoveredLock>> {
    let adapter = open_adapter(adapter_name).await?;
    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        adapter.set_powered(true).await?;
    }

    info!("Scanning for locks for {:?}...", timeout);
    let discover = adapter.discover_devices().await?;
    pin_mut!(discover);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut sightings = Sightings::default();
    let mut locks = Vec::new();

    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, discover.next()).await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        if !sightings.first(address) {
            continue;
        }

        match lock_info(&adapter, address).await? {
            Some(lock) => {
                info!("Found lock {}", lock);
                locks.push(lock);
            }
            None => sightings.defer(address),
        }
    }

    for address in sightings.take_unresolved() {
        if let Some(lock) = lock_info(&adapter, address).await? {
            info!("Found lock {}", lock);
            locks.push(lock);
        }
    }

    debug!("Scan finished, {} lock(s) found", locks.len());
    Ok(locks)
}

/// Devices reported during a scan.
#[derive(Default)]
struct Sightings {
    seen: HashSet<Address>,
    unresolved: Vec<Address>,
}

impl Sightings {
    /// Whether this is the first report of `address`.
    fn first(&mut self, address: Address) -> bool {
        self.seen.insert(address)
    }

    /// Check `address` again once the scan is over.
    fn defer(&mut self, address: Address) {
        self.unresolved.push(address);
    }

    fn take_unresolved(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.unresolved)
    }
}

/// Details of a device if it advertises the lock service.
async fn lock_info(adapter: &Adapter, address: Address) -> Result<Option<DiscoveredLock>> {
    let device = adapter.device(address)?;
    let uuids = device.uuids().await?.unwrap_or_default();
    if !uuids.contains(&SERVICE_UUID) {
        return Ok(None);
    }

    Ok(Some(DiscoveredLock {
        address: address.to_string(),
        name: device.name().await?,
        rssi: device.rssi().await?,
    }))
}
