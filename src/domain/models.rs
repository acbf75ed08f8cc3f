use std::fmt;
use uuid::Uuid;

/// Name reported for peripherals whose advertisement carries no local name.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Canonical peripheral identifier, compared by value everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One scan result as reported by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i16,
}

impl Advertisement {
    pub fn new(address: impl Into<DeviceAddress>, name: Option<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            name: name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            rssi,
        }
    }
}

/// GATT operations a characteristic supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Everything the Blinky LED characteristic can expose
    pub const fn all() -> Self {
        Self {
            read: true,
            write: true,
            write_without_response: true,
            notify: true,
        }
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.read {
            parts.push("read");
        }
        if self.write {
            parts.push("write");
        }
        if self.write_without_response {
            parts.push("write-without-response");
        }
        if self.notify {
            parts.push("notify");
        }
        if parts.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// LED on the PMOD board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedState {
    #[default]
    Off,
    On,
}

impl LedState {
    pub fn is_on(self) -> bool {
        self == LedState::On
    }
}

impl From<bool> for LedState {
    fn from(on: bool) -> Self {
        if on {
            LedState::On
        } else {
            LedState::Off
        }
    }
}

/// Power state of the central radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Lifecycle of one peripheral session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    SubscribingNotifications,
    Ready { led_supported: bool },
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::DiscoveringServices => f.write_str("discovering services"),
            SessionState::DiscoveringCharacteristics => {
                f.write_str("discovering characteristics")
            }
            SessionState::SubscribingNotifications => f.write_str("subscribing to notifications"),
            SessionState::Ready { led_supported } => {
                write!(f, "ready (led supported: {})", led_supported)
            }
            SessionState::Disconnecting => f.write_str("disconnecting"),
        }
    }
}

/// Commands accepted by the Bluetooth service loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    Connect(DeviceAddress),
    /// Promote the scanner's selected candidate into a session
    ConnectSelected,
    Disconnect,
    ReadLed,
    WriteLed(bool),
    Shutdown,
}

/// Events published to the UI (or any other consumer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    RadioStateChanged(RadioState),
    DeviceDiscovered(Advertisement),
    CandidateFound(Advertisement),
    SessionReady { led_supported: bool },
    SessionDisconnected,
    LedStateChanged(bool),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_name_defaults_to_unknown_device() {
        let adv = Advertisement::new("AA:BB", None, -60);
        assert_eq!(adv.name, UNKNOWN_DEVICE_NAME);

        let adv = Advertisement::new("AA:BB", Some(String::new()), -60);
        assert_eq!(adv.name, UNKNOWN_DEVICE_NAME);

        let adv = Advertisement::new("AA:BB", Some("Nordic_Blinky".into()), -60);
        assert_eq!(adv.name, "Nordic_Blinky");
    }

    #[test]
    fn test_addresses_compare_by_value() {
        let a = DeviceAddress::from("C0:FF:EE:00:00:01");
        let b = DeviceAddress::new(String::from("C0:FF:EE:00:00:01"));
        assert_eq!(a, b);
        assert_ne!(a, DeviceAddress::from("C0:FF:EE:00:00:02"));
    }

    #[test]
    fn test_properties_display() {
        assert_eq!(CharacteristicProperties::default().to_string(), "none");
        let props = CharacteristicProperties {
            read: true,
            notify: true,
            ..Default::default()
        };
        assert_eq!(props.to_string(), "read|notify");
    }
}
