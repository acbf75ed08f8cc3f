//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of PMOD / Blinky peripherals.

use crate::domain::models::{
    Advertisement, AppEvent, DeviceAddress, MessageSeverity, RadioState, StatusMessage,
    UNKNOWN_DEVICE_NAME,
};
use crate::infrastructure::bluetooth::{protocol, radio::Radio};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Scan parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub service_uuid: Uuid,
    /// Name the candidate must advertise. `None` accepts the first device.
    pub device_name: Option<String>,
    /// Process every advertisement so RSSI updates keep flowing
    pub allow_duplicates: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE,
            device_name: Some(protocol::DEFAULT_DEVICE_NAME.to_string()),
            allow_duplicates: false,
        }
    }
}

/// BLE Scanner for discovering PMOD boards
pub struct Scanner<R: Radio> {
    radio: Arc<R>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ScanConfig,
    scanning: bool,
    /// Peripherals seen in the current scan session
    known: HashMap<DeviceAddress, Advertisement>,
    selected: Option<Advertisement>,
}

impl<R: Radio> Scanner<R> {
    /// Create a new scanner
    pub fn new(
        radio: Arc<R>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ScanConfig,
    ) -> Self {
        Self {
            radio,
            event_sender,
            config,
            scanning: false,
            known: HashMap::new(),
            selected: None,
        }
    }

    /// Start scanning for the target service
    ///
    /// Does nothing (apart from logging) when the radio is not powered on;
    /// the caller re-invokes once it is.
    pub fn start_scan(&mut self, service_uuid: Uuid, allow_duplicates: bool) -> Result<()> {
        let state = self.radio.state();
        if state != RadioState::PoweredOn {
            warn!("Cannot start scan, radio is {:?}", state);
            self.send_log(
                "Bluetooth is not powered on, scan deferred",
                MessageSeverity::Warning,
            );
            return Ok(());
        }

        // Stop any existing scan
        self.stop_scan()?;

        self.config.service_uuid = service_uuid;
        self.config.allow_duplicates = allow_duplicates;
        self.known.clear();
        self.selected = None;

        info!(
            "Starting BLE scan for service UUID: {} (duplicates: {})",
            service_uuid, allow_duplicates
        );
        self.radio.start_scan(service_uuid, allow_duplicates)?;
        self.scanning = true;
        self.send_log("Scanning for PMOD board...", MessageSeverity::Info);
        Ok(())
    }

    /// Start scanning with the configured parameters
    pub fn start(&mut self) -> Result<()> {
        self.start_scan(self.config.service_uuid, self.config.allow_duplicates)
    }

    /// Stop scanning
    pub fn stop_scan(&mut self) -> Result<()> {
        if self.scanning {
            info!("Stopping BLE scan...");
            self.scanning = false;
            self.radio.stop_scan()?;
            self.send_log("Scan stopped.", MessageSeverity::Info);
        }
        Ok(())
    }

    /// Forget the running scan without touching the radio (it powered off)
    pub fn radio_lost(&mut self) {
        if self.scanning {
            debug!("Radio lost while scanning");
            self.scanning = false;
        }
    }

    /// Handle one advertisement
    ///
    /// Returns the advertisement when it just became the selected candidate.
    pub fn on_advertisement(&mut self, adv: Advertisement) -> Option<Advertisement> {
        if !self.scanning {
            trace!("Ignoring advertisement from {} outside of a scan", adv.address);
            return None;
        }

        let (first_sighting, name_resolved) = match self.known.get(&adv.address) {
            None => (true, false),
            Some(known) => (
                false,
                known.name == UNKNOWN_DEVICE_NAME && adv.name != UNKNOWN_DEVICE_NAME,
            ),
        };
        if !first_sighting && !name_resolved && !self.config.allow_duplicates {
            trace!("Duplicate advertisement from {}", adv.address);
            return None;
        }

        debug!(
            "Advertisement: {} ({}) RSSI {} dBm",
            adv.name, adv.address, adv.rssi
        );
        self.known.insert(adv.address.clone(), adv.clone());
        if let Some(selected) = self.selected.as_mut() {
            if selected.address == adv.address {
                selected.rssi = adv.rssi;
            }
        }
        let _ = self.event_sender.send(AppEvent::DeviceDiscovered(adv.clone()));

        if (first_sighting || name_resolved) && self.selected.is_none() && self.matches_name(&adv) {
            info!("Found PMOD board {} ({})", adv.name, adv.address);
            self.selected = Some(adv.clone());
            let _ = self.event_sender.send(AppEvent::CandidateFound(adv.clone()));
            return Some(adv);
        }
        None
    }

    fn matches_name(&self, adv: &Advertisement) -> bool {
        match self.config.device_name.as_deref() {
            Some(name) if !name.is_empty() => adv.name == name,
            _ => true,
        }
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// The peripheral chosen for promotion into a session
    pub fn selected(&self) -> Option<&Advertisement> {
        self.selected.as_ref()
    }

    /// Look up a peripheral seen in the current scan session
    pub fn known(&self, address: &DeviceAddress) -> Option<&Advertisement> {
        self.known.get(address)
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

impl<R: Radio> Drop for Scanner<R> {
    fn drop(&mut self) {
        let _ = self.stop_scan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulator::{RadioOperation, SimulatedRadio};

    fn scanner(radio: Arc<SimulatedRadio>) -> (Scanner<SimulatedRadio>, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Scanner::new(radio, tx, ScanConfig::default()), rx)
    }

    fn blinky(address: &str, rssi: i16) -> Advertisement {
        Advertisement::new(address, Some(protocol::DEFAULT_DEVICE_NAME.to_string()), rssi)
    }

    fn discovered(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> (usize, usize) {
        let mut found = 0;
        let mut candidates = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                AppEvent::DeviceDiscovered(_) => found += 1,
                AppEvent::CandidateFound(_) => candidates += 1,
                _ => {}
            }
        }
        (found, candidates)
    }

    #[test]
    fn test_start_scan_deferred_when_powered_off() {
        let (radio, _events) = SimulatedRadio::new();
        radio.set_power(RadioState::PoweredOff);
        let radio = Arc::new(radio);
        let (mut scanner, _rx) = scanner(radio.clone());

        scanner.start_scan(protocol::SERVICE, false).unwrap();
        assert!(!scanner.is_scanning());
        assert!(radio.operations().is_empty());
    }

    #[test]
    fn test_duplicate_adverts_are_ignored() {
        let (radio, _events) = SimulatedRadio::new();
        let (mut scanner, mut rx) = scanner(Arc::new(radio));
        scanner.start_scan(protocol::SERVICE, false).unwrap();

        assert!(scanner.on_advertisement(blinky("AA", -70)).is_some());
        assert!(scanner.on_advertisement(blinky("AA", -40)).is_none());

        assert_eq!(discovered(&mut rx), (1, 1));
        assert_eq!(scanner.known(&"AA".into()).unwrap().rssi, -70);
    }

    #[test]
    fn test_allow_duplicates_keeps_rssi_fresh() {
        let (radio, _events) = SimulatedRadio::new();
        let (mut scanner, mut rx) = scanner(Arc::new(radio));
        scanner.start_scan(protocol::SERVICE, true).unwrap();

        scanner.on_advertisement(blinky("AA", -70));
        scanner.on_advertisement(blinky("AA", -40));

        // both processed, but only one candidate transition
        assert_eq!(discovered(&mut rx), (2, 1));
        assert_eq!(scanner.selected().unwrap().rssi, -40);
    }

    #[test]
    fn test_only_matching_name_becomes_candidate() {
        let (radio, _events) = SimulatedRadio::new();
        let (mut scanner, _rx) = scanner(Arc::new(radio));
        scanner.start_scan(protocol::SERVICE, false).unwrap();

        assert!(scanner
            .on_advertisement(Advertisement::new("BB", None, -50))
            .is_none());
        assert!(scanner.selected().is_none());

        scanner.on_advertisement(blinky("CC", -60));
        scanner.on_advertisement(blinky("DD", -30));
        assert_eq!(scanner.selected().unwrap().address, "CC".into());
    }

    #[test]
    fn test_name_arriving_later_is_still_considered() {
        let (radio, _events) = SimulatedRadio::new();
        let (mut scanner, mut rx) = scanner(Arc::new(radio));
        scanner.start_scan(protocol::SERVICE, false).unwrap();

        // service seen before the scan response carrying the name
        assert!(scanner
            .on_advertisement(Advertisement::new("AA", None, -60))
            .is_none());
        assert!(scanner.on_advertisement(blinky("AA", -58)).is_some());
        assert!(scanner.on_advertisement(blinky("AA", -50)).is_none());

        assert_eq!(discovered(&mut rx), (2, 1));
        assert_eq!(scanner.known(&"AA".into()).unwrap().name, protocol::DEFAULT_DEVICE_NAME);
    }

    #[test]
    fn test_new_scan_session_resets_dedup() {
        let (radio, _events) = SimulatedRadio::new();
        let radio = Arc::new(radio);
        let (mut scanner, mut rx) = scanner(radio.clone());

        scanner.start_scan(protocol::SERVICE, false).unwrap();
        scanner.on_advertisement(blinky("AA", -70));
        scanner.start_scan(protocol::SERVICE, false).unwrap();
        scanner.on_advertisement(blinky("AA", -70));

        assert_eq!(discovered(&mut rx), (2, 2));
        let stops = radio
            .operations()
            .into_iter()
            .filter(|op| *op == RadioOperation::StopScan)
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_stop_scan_is_idempotent() {
        let (radio, _events) = SimulatedRadio::new();
        let radio = Arc::new(radio);
        let (mut scanner, _rx) = scanner(radio.clone());
        scanner.start_scan(protocol::SERVICE, false).unwrap();

        scanner.stop_scan().unwrap();
        scanner.stop_scan().unwrap();
        assert!(!scanner.is_scanning());
        assert!(scanner.on_advertisement(blinky("AA", -70)).is_none());
        assert_eq!(
            radio.operations(),
            vec![
                RadioOperation::StartScan {
                    service: protocol::SERVICE,
                    allow_duplicates: false
                },
                RadioOperation::StopScan
            ]
        );
    }
}
