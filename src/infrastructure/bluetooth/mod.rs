//! Bluetooth Module
//!
//! Provides BLE communication with the PMOD / Nordic Blinky board.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (command loop - public API for the application)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────────┐
//!         │             │                  │
//!         ▼             ▼                  ▼
//! ┌───────────┐  ┌───────────────────┐  ┌──────────┐
//! │  Scanner  │  │ PeripheralSession │  │ Protocol │
//! │           │  │                   │  │          │
//! │ - BLE     │  │ - connect/GATT    │  │ - UUIDs  │
//! │ discovery │  │ - LED read/write  │  │ - LED    │
//! │           │  │                   │  │   bytes  │
//! └─────┬─────┘  └─────────┬─────────┘  └──────────┘
//!       │   requests       │
//!       ▼                  ▼
//! ┌─────────────────────────────────┐
//! │      Radio (trait)              │──► RadioEvent channel
//! │  SimulatedRadio | BtleplugRadio │    back into the service
//! └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Blinky GATT identifiers and LED payload encoding
//! - [`radio`] - Radio capability trait and the events it produces
//! - [`scanner`] - BLE device discovery
//! - [`session`] - Per-peripheral connection state machine
//! - [`service`] - Main service coordinator
//! - [`simulator`] - In-process radio with a simulated Blinky board

#[cfg(feature = "btleplug")]
pub mod btleplug_radio;
pub mod protocol;
pub mod radio;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulator;

// Re-export main service for convenience
pub use radio::{Radio, RadioEvent};
pub use service::{BluetoothService, ServiceConfig};
pub use session::{PeripheralSession, SessionListener};
