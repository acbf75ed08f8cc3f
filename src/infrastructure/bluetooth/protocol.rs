//! Blinky / PMOD Protocol
//!
//! This module contains the protocol definitions for the Nordic LED Button
//! Service as exposed by the Avnet PMOD board.

use crate::domain::models::LedState;
use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

/// LED Button Service UUID
pub const SERVICE_UUID: &str = "00001523-1212-EFDE-1523-785FEABCD123";

/// LED characteristic UUID - one byte, read/write (optionally notify)
pub const LED_CHAR_UUID: &str = "00001525-1212-EFDE-1523-785FEABCD123";

pub const SERVICE: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);
pub const LED_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd123);

/// Name the Blinky firmware advertises with
pub const DEFAULT_DEVICE_NAME: &str = "Nordic_Blinky";

/// Wire value for LED off
pub const LED_OFF: u8 = 0x00;
/// Wire value for LED on
pub const LED_ON: u8 = 0x01;

/// Encode an LED state as the single-byte characteristic value
pub fn encode_led(state: LedState) -> [u8; 1] {
    match state {
        LedState::On => [LED_ON],
        LedState::Off => [LED_OFF],
    }
}

/// Decode a characteristic value
///
/// Only `0x01` means on. Any other byte, or an empty payload, reads as off.
pub fn decode_led(value: &[u8]) -> LedState {
    match value.first() {
        Some(&LED_ON) => LedState::On,
        Some(&LED_OFF) => LedState::Off,
        Some(other) => {
            debug!("Unexpected LED value {:#04X}, treating as off", other);
            LedState::Off
        }
        None => {
            debug!("Empty LED value, treating as off");
            LedState::Off
        }
    }
}

/// Parse a UUID string (hyphenated or simple, any case)
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}
