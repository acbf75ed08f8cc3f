//! Error types shared by the radio backends and the session state machine.

use crate::domain::models::{DeviceAddress, RadioState, SessionState};
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a radio backend
///
/// Clonable so it can travel inside [`RadioEvent`](crate::infrastructure::bluetooth::radio::RadioEvent)s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio is not powered on ({0:?})")]
    NotPoweredOn(RadioState),

    #[error("unknown peripheral {0}")]
    UnknownPeripheral(DeviceAddress),

    #[error("service {0} not found")]
    UnknownService(Uuid),

    #[error("characteristic {0} not found")]
    UnknownCharacteristic(Uuid),

    #[error("peripheral {0} is not connected")]
    NotConnected(DeviceAddress),

    #[error("{0}")]
    Platform(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation not allowed while session is {state}")]
    InvalidState { state: SessionState },

    #[error("another LED operation is still in flight")]
    Busy,

    #[error(transparent)]
    Radio(#[from] RadioError),
}
