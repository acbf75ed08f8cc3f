//! Scanner and connection state machine for the Avnet PMOD / Nordic Blinky
//! BLE board: discover the board, connect, and read or switch its LED.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use domain::models::{Advertisement, AppEvent, BluetoothCommand, DeviceAddress, LedState};
pub use error::{RadioError, SessionError};
pub use infrastructure::bluetooth::{BluetoothService, PeripheralSession, Radio, RadioEvent};
