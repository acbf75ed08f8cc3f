//! Radio backend on the platform Bluetooth stack via `btleplug`
//!
//! Each request is spawned as its own task and reports back through the
//! `RadioEvent` channel. A single pump task turns the adapter's central
//! events into advertisements and link-loss notifications.

use crate::domain::models::{
    Advertisement, CharacteristicDescriptor, CharacteristicProperties, DeviceAddress, RadioState,
    ServiceDescriptor, WriteMode,
};
use crate::error::RadioError;
use crate::infrastructure::bluetooth::radio::{Radio, RadioEvent};
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct ActiveScan {
    service: Uuid,
    allow_duplicates: bool,
}

impl ActiveScan {
    /// Whether an adapter event for a peripheral should become an advertisement.
    /// Updates keep flowing until the peripheral has been reported complete.
    fn wants(&self, update: bool, complete: bool) -> bool {
        !update || !complete || self.allow_duplicates
    }
}

#[derive(Default)]
struct Shared {
    scan: Option<ActiveScan>,
    peripherals: HashMap<DeviceAddress, Peripheral>,
    ids: HashMap<PeripheralId, DeviceAddress>,
    /// Peripherals with a running notification pump
    listening: HashSet<DeviceAddress>,
    /// Peripherals reported this scan with the service and a name
    complete: HashSet<PeripheralId>,
}

/// `Radio` implementation backed by the first system adapter
pub struct BtleplugRadio {
    adapter: Adapter,
    runtime: Handle,
    events: mpsc::UnboundedSender<RadioEvent>,
    shared: Arc<Mutex<Shared>>,
}

fn platform(e: btleplug::Error) -> RadioError {
    RadioError::Platform(e.to_string())
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn address_of(peripheral: &Peripheral) -> DeviceAddress {
    let address = peripheral.address();
    // CoreBluetooth hides the MAC; fall back to the opaque identifier
    if address.into_inner() == [0u8; 6] {
        DeviceAddress::new(format!("{:?}", peripheral.id()))
    } else {
        DeviceAddress::new(address.to_string())
    }
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
    }
}

impl BtleplugRadio {
    /// Open the first adapter and start pumping its events
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new() -> anyhow::Result<(Self, mpsc::UnboundedReceiver<RadioEvent>)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        let (events, rx) = mpsc::unbounded_channel();
        let radio = Self {
            adapter,
            runtime: Handle::current(),
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
        };
        radio.spawn_event_pump().await?;
        // btleplug reports no adapter power state; an opened adapter is usable
        let _ = radio.events.send(RadioEvent::StateChanged(RadioState::PoweredOn));
        Ok((radio, rx))
    }

    async fn spawn_event_pump(&self) -> anyhow::Result<()> {
        let mut central_events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        let events = self.events.clone();

        self.runtime.spawn(async move {
            while let Some(event) = central_events.next().await {
                trace!("BLE event: {:?}", event);
                match event {
                    CentralEvent::DeviceDiscovered(id) => {
                        Self::advertisement(&adapter, &shared, &events, id, false).await;
                    }
                    CentralEvent::DeviceUpdated(id) => {
                        Self::advertisement(&adapter, &shared, &events, id, true).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let address = {
                            let mut state = lock(&shared);
                            let address = state.ids.get(&id).cloned();
                            if let Some(address) = &address {
                                state.listening.remove(address);
                            }
                            address
                        };
                        if let Some(address) = address {
                            info!("Device disconnected: {}", address);
                            let _ = events.send(RadioEvent::Disconnected(address));
                        }
                    }
                    _ => {}
                }
            }
            debug!("Adapter event stream ended");
        });
        Ok(())
    }

    async fn advertisement(
        adapter: &Adapter,
        shared: &Mutex<Shared>,
        events: &mpsc::UnboundedSender<RadioEvent>,
        id: PeripheralId,
        update: bool,
    ) {
        let (scan, complete) = {
            let state = lock(shared);
            (state.scan, state.complete.contains(&id))
        };
        let Some(scan) = scan else {
            return;
        };
        if !scan.wants(update, complete) {
            return;
        }
        let Ok(peripheral) = adapter.peripheral(&id).await else {
            return;
        };
        let Ok(Some(props)) = peripheral.properties().await else {
            return;
        };
        // not every platform honours the scan filter; services may also arrive in a later update
        if !props.services.contains(&scan.service) {
            trace!("{:?} does not advertise the service (yet)", id);
            return;
        }

        let address = address_of(&peripheral);
        {
            let mut state = lock(shared);
            if props.local_name.is_some() {
                state.complete.insert(id.clone());
            }
            state.ids.insert(id, address.clone());
            state.peripherals.insert(address.clone(), peripheral);
        }
        let adv = Advertisement::new(address, props.local_name, props.rssi.unwrap_or(0));
        let _ = events.send(RadioEvent::AdvertisementReceived(adv));
    }

    fn peripheral(&self, address: &DeviceAddress) -> Result<Peripheral, RadioError> {
        lock(&self.shared)
            .peripherals
            .get(address)
            .cloned()
            .ok_or_else(|| RadioError::UnknownPeripheral(address.clone()))
    }

    fn characteristic(
        &self,
        address: &DeviceAddress,
        descriptor: &CharacteristicDescriptor,
    ) -> Result<(Peripheral, Characteristic), RadioError> {
        let peripheral = self.peripheral(address)?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == descriptor.uuid && c.service_uuid == descriptor.service_uuid)
            .ok_or(RadioError::UnknownCharacteristic(descriptor.uuid))?;
        Ok((peripheral, characteristic))
    }

    fn spawn_notification_pump(&self, address: DeviceAddress, peripheral: Peripheral) {
        if !lock(&self.shared).listening.insert(address.clone()) {
            return;
        }
        let events = self.events.clone();
        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            match peripheral.notifications().await {
                Ok(mut stream) => {
                    while let Some(notification) = stream.next().await {
                        debug!("Notification from {}: {:02X?}", address, notification.value);
                        let _ = events.send(RadioEvent::Notification {
                            address: address.clone(),
                            characteristic: notification.uuid,
                            value: notification.value,
                        });
                    }
                }
                Err(e) => error!("Failed to open notification stream: {}", e),
            }
            lock(&shared).listening.remove(&address);
        });
    }
}

impl Radio for BtleplugRadio {
    fn state(&self) -> RadioState {
        RadioState::PoweredOn
    }

    fn start_scan(&self, service: Uuid, allow_duplicates: bool) -> Result<(), RadioError> {
        {
            let mut state = lock(&self.shared);
            state.complete.clear();
            state.scan = Some(ActiveScan {
                service,
                allow_duplicates,
            });
        }
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            let filter = ScanFilter {
                services: vec![service],
            };
            if let Err(e) = adapter.start_scan(filter).await {
                error!("Failed to start scan: {}", e);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        lock(&self.shared).scan = None;
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&self, address: &DeviceAddress) -> Result<(), RadioError> {
        let peripheral = self.peripheral(address)?;
        let address = address.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => RadioEvent::Connected(address),
                Err(e) => RadioEvent::ConnectFailed {
                    address,
                    error: platform(e),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn disconnect(&self, address: &DeviceAddress) -> Result<(), RadioError> {
        let peripheral = self.peripheral(address)?;
        let address = address.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect from {} failed: {}", address, e);
            }
            // the adapter does not report a cancelled connection attempt
            let _ = events.send(RadioEvent::Disconnected(address));
        });
        Ok(())
    }

    fn discover_services(
        &self,
        address: &DeviceAddress,
        services: &[Uuid],
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(address)?;
        let wanted = services.to_vec();
        let address = address.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let result: Result<Vec<ServiceDescriptor>, _> =
                peripheral.discover_services().await.map(|()| {
                    peripheral
                        .services()
                        .into_iter()
                        .filter(|s| wanted.is_empty() || wanted.contains(&s.uuid))
                        .map(|s| ServiceDescriptor { uuid: s.uuid })
                        .collect()
                });
            let _ = events.send(RadioEvent::ServicesDiscovered {
                address,
                result: result.map_err(platform),
            });
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        address: &DeviceAddress,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(address)?;
        // btleplug discovers characteristics together with services
        let result: Result<Vec<CharacteristicDescriptor>, RadioError> = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .filter(|c| characteristics.is_empty() || characteristics.contains(&c.uuid))
                    .map(|c| CharacteristicDescriptor {
                        uuid: c.uuid,
                        service_uuid: c.service_uuid,
                        properties: properties(c.properties),
                    })
                    .collect()
            })
            .ok_or(RadioError::UnknownService(service));
        let _ = self.events.send(RadioEvent::CharacteristicsDiscovered {
            address: address.clone(),
            service,
            result,
        });
        Ok(())
    }

    fn set_notify(
        &self,
        address: &DeviceAddress,
        descriptor: &CharacteristicDescriptor,
        enabled: bool,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self.characteristic(address, descriptor)?;
        if enabled {
            self.spawn_notification_pump(address.clone(), peripheral.clone());
        }
        let address = address.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            let _ = events.send(RadioEvent::NotifyStateUpdated {
                address,
                characteristic: characteristic.uuid,
                result: result.map(|()| enabled).map_err(platform),
            });
        });
        Ok(())
    }

    fn read_value(
        &self,
        address: &DeviceAddress,
        descriptor: &CharacteristicDescriptor,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self.characteristic(address, descriptor)?;
        let address = address.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let result = peripheral.read(&characteristic).await.map_err(platform);
            let _ = events.send(RadioEvent::ValueUpdated {
                address,
                characteristic: characteristic.uuid,
                result,
            });
        });
        Ok(())
    }

    fn write_value(
        &self,
        address: &DeviceAddress,
        descriptor: &CharacteristicDescriptor,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self.characteristic(address, descriptor)?;
        let value = value.to_vec();
        let address = address.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let write_type = match mode {
                WriteMode::WithResponse => WriteType::WithResponse,
                WriteMode::WithoutResponse => WriteType::WithoutResponse,
            };
            let result = peripheral
                .write(&characteristic, &value, write_type)
                .await
                .map_err(platform);
            match mode {
                WriteMode::WithResponse => {
                    let _ = events.send(RadioEvent::WriteCompleted {
                        address,
                        characteristic: characteristic.uuid,
                        result,
                    });
                }
                WriteMode::WithoutResponse => {
                    if let Err(e) = result {
                        warn!("Write without response to {} failed: {}", address, e);
                    }
                }
            }
        });
        Ok(())
    }
}
