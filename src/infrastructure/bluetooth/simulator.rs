//! Simulated radio
//!
//! An in-process stand-in for the platform BLE stack hosting any number of
//! Blinky-like peripherals. Every request is answered immediately by pushing
//! the matching [`RadioEvent`] into the channel, and every request is recorded
//! so callers can assert which I/O was (or was not) issued.

use crate::domain::models::{
    Advertisement, CharacteristicDescriptor, CharacteristicProperties, DeviceAddress, LedState,
    RadioState, ServiceDescriptor, WriteMode,
};
use crate::error::RadioError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::radio::{Radio, RadioEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Battery Service, used as the "wrong device" service
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// A request the simulator received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOperation {
    StartScan {
        service: Uuid,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(DeviceAddress),
    Disconnect(DeviceAddress),
    DiscoverServices(DeviceAddress),
    DiscoverCharacteristics {
        address: DeviceAddress,
        service: Uuid,
    },
    SetNotify {
        address: DeviceAddress,
        characteristic: Uuid,
        enabled: bool,
    },
    Read {
        address: DeviceAddress,
        characteristic: Uuid,
    },
    Write {
        address: DeviceAddress,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
    },
}

/// A peripheral hosted by the simulator
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    /// Service UUIDs carried in the advertisement
    pub advertised_services: Vec<Uuid>,
    /// Services found by GATT discovery
    pub services: Vec<Uuid>,
    /// LED characteristic, `None` when the firmware lacks it
    pub led_characteristic: Option<CharacteristicProperties>,
    pub led: LedState,
    pub fail_connect: bool,
    pub fail_writes: bool,
}

impl SimulatedPeripheral {
    /// Stock Blinky firmware: LED is read + write
    pub fn blinky(address: impl Into<DeviceAddress>) -> Self {
        Self {
            address: address.into(),
            name: Some(protocol::DEFAULT_DEVICE_NAME.to_string()),
            rssi: -55,
            advertised_services: vec![protocol::SERVICE],
            services: vec![protocol::SERVICE],
            led_characteristic: Some(CharacteristicProperties {
                read: true,
                write: true,
                ..Default::default()
            }),
            led: LedState::Off,
            fail_connect: false,
            fail_writes: false,
        }
    }

    pub fn with_name(mut self, name: Option<&str>) -> Self {
        self.name = name.map(str::to_string);
        self
    }

    pub fn with_properties(mut self, properties: CharacteristicProperties) -> Self {
        self.led_characteristic = Some(properties);
        self
    }

    /// GATT table only exposes an unrelated service
    pub fn without_service(mut self) -> Self {
        self.services = vec![BATTERY_SERVICE];
        self
    }

    pub fn without_led_characteristic(mut self) -> Self {
        self.led_characteristic = None;
        self
    }

    pub fn with_led(mut self, led: LedState) -> Self {
        self.led = led;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    fn led_descriptor(&self) -> Option<CharacteristicDescriptor> {
        if !self.services.contains(&protocol::SERVICE) {
            return None;
        }
        self.led_characteristic
            .map(|properties| CharacteristicDescriptor {
                uuid: protocol::LED_CHARACTERISTIC,
                service_uuid: protocol::SERVICE,
                properties,
            })
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement::new(self.address.clone(), self.name.clone(), self.rssi)
    }
}

struct SimState {
    radio_state: RadioState,
    peripherals: HashMap<DeviceAddress, SimulatedPeripheral>,
    connected: HashSet<DeviceAddress>,
    notifying: HashSet<DeviceAddress>,
    scan: Option<(Uuid, bool)>,
    operations: Vec<RadioOperation>,
}

/// In-process radio backend
pub struct SimulatedRadio {
    state: Mutex<SimState>,
    events: mpsc::UnboundedSender<RadioEvent>,
}

impl SimulatedRadio {
    /// Powered-on radio with no peripherals around
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let radio = Self {
            state: Mutex::new(SimState {
                radio_state: RadioState::PoweredOn,
                peripherals: HashMap::new(),
                connected: HashSet::new(),
                notifying: HashSet::new(),
                scan: None,
                operations: Vec::new(),
            }),
            events,
        };
        (radio, rx)
    }

    /// Radio with a single peripheral in range
    pub fn with_peripheral(
        peripheral: SimulatedPeripheral,
    ) -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        let (radio, rx) = Self::new();
        radio.add_peripheral(peripheral);
        (radio, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    /// Bring a peripheral into range, advertising immediately if a scan runs
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut state = self.lock();
        let advert = match state.scan {
            Some((service, _)) if peripheral.advertised_services.contains(&service) => {
                Some(peripheral.advertisement())
            }
            _ => None,
        };
        state
            .peripherals
            .insert(peripheral.address.clone(), peripheral);
        drop(state);
        if let Some(adv) = advert {
            self.emit(RadioEvent::AdvertisementReceived(adv));
        }
    }

    /// Change the adapter power state
    pub fn set_power(&self, radio_state: RadioState) {
        let mut state = self.lock();
        state.radio_state = radio_state;
        if radio_state != RadioState::PoweredOn {
            state.connected.clear();
            state.notifying.clear();
            state.scan = None;
        }
        drop(state);
        info!("Simulated radio is now {:?}", radio_state);
        self.emit(RadioEvent::StateChanged(radio_state));
    }

    /// Peripheral walks out of range
    pub fn drop_link(&self, address: &DeviceAddress) {
        let mut state = self.lock();
        let was_connected = state.connected.remove(address);
        state.notifying.remove(address);
        drop(state);
        if was_connected {
            self.emit(RadioEvent::Disconnected(address.clone()));
        }
    }

    /// LED changed on the board itself; subscribed centrals get a notification
    pub fn set_led_externally(&self, address: &DeviceAddress, led: LedState) {
        let mut state = self.lock();
        let notifying = state.notifying.contains(address);
        if let Some(peripheral) = state.peripherals.get_mut(address) {
            peripheral.led = led;
        }
        drop(state);
        if notifying {
            self.emit(RadioEvent::Notification {
                address: address.clone(),
                characteristic: protocol::LED_CHARACTERISTIC,
                value: protocol::encode_led(led).to_vec(),
            });
        }
    }

    pub fn led(&self, address: &DeviceAddress) -> Option<LedState> {
        self.lock().peripherals.get(address).map(|p| p.led)
    }

    pub fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.lock().connected.contains(address)
    }

    /// Requests received so far
    pub fn operations(&self) -> Vec<RadioOperation> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Record a request and check the radio may serve it
    fn begin(&self, operation: RadioOperation) -> Result<MutexGuard<'_, SimState>, RadioError> {
        let mut state = self.lock();
        debug!("Simulated radio request: {:?}", operation);
        state.operations.push(operation);
        if state.radio_state != RadioState::PoweredOn {
            return Err(RadioError::NotPoweredOn(state.radio_state));
        }
        Ok(state)
    }

    fn connected_peripheral<'a>(
        state: &'a SimState,
        address: &DeviceAddress,
    ) -> Result<&'a SimulatedPeripheral, RadioError> {
        if !state.connected.contains(address) {
            return Err(RadioError::NotConnected(address.clone()));
        }
        state
            .peripherals
            .get(address)
            .ok_or_else(|| RadioError::UnknownPeripheral(address.clone()))
    }

    fn led_of<'a>(
        state: &'a SimState,
        address: &DeviceAddress,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<(&'a SimulatedPeripheral, CharacteristicProperties), RadioError> {
        let peripheral = Self::connected_peripheral(state, address)?;
        match peripheral.led_descriptor() {
            Some(led) if led.uuid == characteristic.uuid => Ok((peripheral, led.properties)),
            _ => Err(RadioError::UnknownCharacteristic(characteristic.uuid)),
        }
    }
}

impl Radio for SimulatedRadio {
    fn state(&self) -> RadioState {
        self.lock().radio_state
    }

    fn start_scan(&self, service: Uuid, allow_duplicates: bool) -> Result<(), RadioError> {
        let mut state = self.begin(RadioOperation::StartScan {
            service,
            allow_duplicates,
        })?;
        state.scan = Some((service, allow_duplicates));
        let adverts: Vec<Advertisement> = state
            .peripherals
            .values()
            .filter(|p| p.advertised_services.contains(&service))
            .map(SimulatedPeripheral::advertisement)
            .collect();
        drop(state);
        for adv in adverts {
            self.emit(RadioEvent::AdvertisementReceived(adv));
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.operations.push(RadioOperation::StopScan);
        state.scan = None;
        Ok(())
    }

    fn connect(&self, peripheral: &DeviceAddress) -> Result<(), RadioError> {
        let mut state = self.begin(RadioOperation::Connect(peripheral.clone()))?;
        let fail = state
            .peripherals
            .get(peripheral)
            .ok_or_else(|| RadioError::UnknownPeripheral(peripheral.clone()))?
            .fail_connect;
        if fail {
            drop(state);
            self.emit(RadioEvent::ConnectFailed {
                address: peripheral.clone(),
                error: RadioError::Platform("connection attempt failed".to_string()),
            });
            return Ok(());
        }
        state.connected.insert(peripheral.clone());
        drop(state);
        self.emit(RadioEvent::Connected(peripheral.clone()));
        Ok(())
    }

    fn disconnect(&self, peripheral: &DeviceAddress) -> Result<(), RadioError> {
        let mut state = self.lock();
        state
            .operations
            .push(RadioOperation::Disconnect(peripheral.clone()));
        state.connected.remove(peripheral);
        state.notifying.remove(peripheral);
        drop(state);
        self.emit(RadioEvent::Disconnected(peripheral.clone()));
        Ok(())
    }

    fn discover_services(
        &self,
        peripheral: &DeviceAddress,
        _services: &[Uuid],
    ) -> Result<(), RadioError> {
        let state = self.begin(RadioOperation::DiscoverServices(peripheral.clone()))?;
        let result: Result<Vec<ServiceDescriptor>, RadioError> =
            Self::connected_peripheral(&state, peripheral).map(|p| {
                p.services
                    .iter()
                    .map(|uuid| ServiceDescriptor { uuid: *uuid })
                    .collect()
            });
        drop(state);
        self.emit(RadioEvent::ServicesDiscovered {
            address: peripheral.clone(),
            result,
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        peripheral: &DeviceAddress,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), RadioError> {
        let state = self.begin(RadioOperation::DiscoverCharacteristics {
            address: peripheral.clone(),
            service,
        })?;
        let result: Result<Vec<CharacteristicDescriptor>, RadioError> =
            Self::connected_peripheral(&state, peripheral).and_then(|p| {
                if !p.services.contains(&service) {
                    return Err(RadioError::UnknownService(service));
                }
                Ok(p.led_descriptor()
                    .filter(|c| c.service_uuid == service)
                    .filter(|c| characteristics.is_empty() || characteristics.contains(&c.uuid))
                    .into_iter()
                    .collect())
            });
        drop(state);
        self.emit(RadioEvent::CharacteristicsDiscovered {
            address: peripheral.clone(),
            service,
            result,
        });
        Ok(())
    }

    fn set_notify(
        &self,
        peripheral: &DeviceAddress,
        characteristic: &CharacteristicDescriptor,
        enabled: bool,
    ) -> Result<(), RadioError> {
        let mut state = self.begin(RadioOperation::SetNotify {
            address: peripheral.clone(),
            characteristic: characteristic.uuid,
            enabled,
        })?;
        let result = Self::led_of(&state, peripheral, characteristic).and_then(|(_, props)| {
            if props.notify {
                Ok(enabled)
            } else {
                Err(RadioError::Platform("notify not permitted".to_string()))
            }
        });
        if result.is_ok() {
            if enabled {
                state.notifying.insert(peripheral.clone());
            } else {
                state.notifying.remove(peripheral);
            }
        }
        drop(state);
        self.emit(RadioEvent::NotifyStateUpdated {
            address: peripheral.clone(),
            characteristic: characteristic.uuid,
            result,
        });
        Ok(())
    }

    fn read_value(
        &self,
        peripheral: &DeviceAddress,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<(), RadioError> {
        let state = self.begin(RadioOperation::Read {
            address: peripheral.clone(),
            characteristic: characteristic.uuid,
        })?;
        let result = Self::led_of(&state, peripheral, characteristic).and_then(|(p, props)| {
            if props.read {
                Ok(protocol::encode_led(p.led).to_vec())
            } else {
                Err(RadioError::Platform("read not permitted".to_string()))
            }
        });
        drop(state);
        self.emit(RadioEvent::ValueUpdated {
            address: peripheral.clone(),
            characteristic: characteristic.uuid,
            result,
        });
        Ok(())
    }

    fn write_value(
        &self,
        peripheral: &DeviceAddress,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), RadioError> {
        let mut state = self.begin(RadioOperation::Write {
            address: peripheral.clone(),
            characteristic: characteristic.uuid,
            value: value.to_vec(),
            mode,
        })?;
        let (fail_writes, props) = {
            let (p, props) = Self::led_of(&state, peripheral, characteristic)?;
            (p.fail_writes, props)
        };
        let permitted = match mode {
            WriteMode::WithResponse => props.write,
            WriteMode::WithoutResponse => props.write_without_response,
        };

        let result = if !permitted {
            Err(RadioError::Platform("write not permitted".to_string()))
        } else if fail_writes {
            Err(RadioError::Platform("write rejected by peripheral".to_string()))
        } else {
            if let Some(p) = state.peripherals.get_mut(peripheral) {
                p.led = protocol::decode_led(value);
            }
            Ok(())
        };
        drop(state);

        if mode == WriteMode::WithResponse {
            self.emit(RadioEvent::WriteCompleted {
                address: peripheral.clone(),
                characteristic: characteristic.uuid,
                result,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_reports_advertising_peripherals() {
        let (radio, mut rx) = SimulatedRadio::with_peripheral(SimulatedPeripheral::blinky("AA"));
        radio.add_peripheral(SimulatedPeripheral::blinky("BB").without_service());

        radio.start_scan(BATTERY_SERVICE, false).unwrap();
        assert!(rx.try_recv().is_err());

        radio.start_scan(protocol::SERVICE, false).unwrap();
        let mut seen = Vec::new();
        while let Ok(RadioEvent::AdvertisementReceived(adv)) = rx.try_recv() {
            seen.push(adv.address);
        }
        seen.sort();
        // BB still advertises the service even though its GATT table lacks it
        assert_eq!(seen, vec![DeviceAddress::from("AA"), DeviceAddress::from("BB")]);
    }

    #[test]
    fn test_requests_fail_when_powered_off() {
        let (radio, _rx) = SimulatedRadio::with_peripheral(SimulatedPeripheral::blinky("AA"));
        radio.set_power(RadioState::PoweredOff);
        assert_eq!(
            radio.connect(&"AA".into()),
            Err(RadioError::NotPoweredOn(RadioState::PoweredOff))
        );
    }

    #[test]
    fn test_write_without_response_emits_nothing() {
        let address = DeviceAddress::from("AA");
        let (radio, mut rx) = SimulatedRadio::with_peripheral(
            SimulatedPeripheral::blinky("AA").with_properties(CharacteristicProperties {
                write_without_response: true,
                ..Default::default()
            }),
        );
        radio.connect(&address).unwrap();
        assert_eq!(rx.try_recv().unwrap(), RadioEvent::Connected(address.clone()));

        let led = CharacteristicDescriptor {
            uuid: protocol::LED_CHARACTERISTIC,
            service_uuid: protocol::SERVICE,
            properties: CharacteristicProperties::default(),
        };
        radio
            .write_value(&address, &led, &[protocol::LED_ON], WriteMode::WithoutResponse)
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(radio.led(&address), Some(LedState::On));
    }
}
