//! Radio capability interface
//!
//! Every method only *issues* a request and returns immediately. The outcome
//! is delivered later as a [`RadioEvent`] on the channel the backend was
//! created with, so the state machine never blocks waiting for the radio.

use crate::domain::models::{
    Advertisement, CharacteristicDescriptor, DeviceAddress, RadioState, ServiceDescriptor,
    WriteMode,
};
use crate::error::RadioError;
use uuid::Uuid;

/// Events produced by a radio backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    StateChanged(RadioState),
    AdvertisementReceived(Advertisement),
    Connected(DeviceAddress),
    ConnectFailed {
        address: DeviceAddress,
        error: RadioError,
    },
    Disconnected(DeviceAddress),
    ServicesDiscovered {
        address: DeviceAddress,
        result: Result<Vec<ServiceDescriptor>, RadioError>,
    },
    CharacteristicsDiscovered {
        address: DeviceAddress,
        service: Uuid,
        result: Result<Vec<CharacteristicDescriptor>, RadioError>,
    },
    NotifyStateUpdated {
        address: DeviceAddress,
        characteristic: Uuid,
        result: Result<bool, RadioError>,
    },
    /// Response to [`Radio::read_value`]
    ValueUpdated {
        address: DeviceAddress,
        characteristic: Uuid,
        result: Result<Vec<u8>, RadioError>,
    },
    /// Value pushed by the peripheral after [`Radio::set_notify`]
    Notification {
        address: DeviceAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Only produced for [`WriteMode::WithResponse`]
    WriteCompleted {
        address: DeviceAddress,
        characteristic: Uuid,
        result: Result<(), RadioError>,
    },
}

impl RadioEvent {
    /// Peripheral the event concerns, if any
    pub fn address(&self) -> Option<&DeviceAddress> {
        match self {
            RadioEvent::StateChanged(_) => None,
            RadioEvent::AdvertisementReceived(adv) => Some(&adv.address),
            RadioEvent::Connected(address) | RadioEvent::Disconnected(address) => Some(address),
            RadioEvent::ConnectFailed { address, .. }
            | RadioEvent::ServicesDiscovered { address, .. }
            | RadioEvent::CharacteristicsDiscovered { address, .. }
            | RadioEvent::NotifyStateUpdated { address, .. }
            | RadioEvent::ValueUpdated { address, .. }
            | RadioEvent::Notification { address, .. }
            | RadioEvent::WriteCompleted { address, .. } => Some(address),
        }
    }
}

/// Central-role BLE capability the scanner and session drive
pub trait Radio: Send + Sync {
    fn state(&self) -> RadioState;

    fn start_scan(&self, service: Uuid, allow_duplicates: bool) -> Result<(), RadioError>;

    fn stop_scan(&self) -> Result<(), RadioError>;

    fn connect(&self, peripheral: &DeviceAddress) -> Result<(), RadioError>;

    /// Cancels a pending connection or tears down an active one
    fn disconnect(&self, peripheral: &DeviceAddress) -> Result<(), RadioError>;

    fn discover_services(
        &self,
        peripheral: &DeviceAddress,
        services: &[Uuid],
    ) -> Result<(), RadioError>;

    fn discover_characteristics(
        &self,
        peripheral: &DeviceAddress,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), RadioError>;

    fn set_notify(
        &self,
        peripheral: &DeviceAddress,
        characteristic: &CharacteristicDescriptor,
        enabled: bool,
    ) -> Result<(), RadioError>;

    fn read_value(
        &self,
        peripheral: &DeviceAddress,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<(), RadioError>;

    fn write_value(
        &self,
        peripheral: &DeviceAddress,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), RadioError>;
}
