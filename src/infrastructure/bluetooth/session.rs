//! Peripheral Session Module
//!
//! Drives one PMOD board from connect to a usable LED characteristic:
//!
//! ```text
//! Idle -> Connecting -> DiscoveringServices -> DiscoveringCharacteristics
//!      -> SubscribingNotifications -> Ready -> Disconnecting -> Idle
//! ```
//!
//! Any state falls back to `Idle` on a disconnect or when the radio stops
//! being powered on. Every step only starts once the radio event completing
//! the previous one has been handled, so discovery callbacks never race.

use crate::domain::models::{
    Advertisement, AppEvent, CharacteristicDescriptor, DeviceAddress, LedState, RadioState,
    ServiceDescriptor, SessionState, WriteMode,
};
use crate::error::{RadioError, SessionError};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::radio::{Radio, RadioEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Consumer of session events (UI or test harness)
pub trait SessionListener {
    /// Connected and discovery finished. `led_supported` is false when the
    /// peripheral lacks the LED service or characteristic.
    fn on_session_ready(&mut self, led_supported: bool);

    fn on_session_disconnected(&mut self);

    fn on_led_state_changed(&mut self, is_on: bool);
}

impl SessionListener for mpsc::UnboundedSender<AppEvent> {
    fn on_session_ready(&mut self, led_supported: bool) {
        let _ = self.send(AppEvent::SessionReady { led_supported });
    }

    fn on_session_disconnected(&mut self) {
        let _ = self.send(AppEvent::SessionDisconnected);
    }

    fn on_led_state_changed(&mut self, is_on: bool) {
        let _ = self.send(AppEvent::LedStateChanged(is_on));
    }
}

/// GATT identifiers the session looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub service_uuid: Uuid,
    pub led_char_uuid: Uuid,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE,
            led_char_uuid: protocol::LED_CHARACTERISTIC,
        }
    }
}

/// LED operation waiting for its radio event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOperation {
    Read,
    Write(LedState),
}

pub struct PeripheralSession<R: Radio, L: SessionListener> {
    radio: Arc<R>,
    listener: L,
    peripheral: Advertisement,
    config: SessionConfig,
    state: SessionState,
    /// Only valid for the connection that discovered it
    led_characteristic: Option<CharacteristicDescriptor>,
    pending: Option<PendingOperation>,
}

impl<R: Radio, L: SessionListener> PeripheralSession<R, L> {
    pub fn new(radio: Arc<R>, peripheral: Advertisement, config: SessionConfig, listener: L) -> Self {
        Self {
            radio,
            listener,
            peripheral,
            config,
            state: SessionState::Idle,
            led_characteristic: None,
            pending: None,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.peripheral.address
    }

    pub fn peripheral(&self) -> &Advertisement {
        &self.peripheral
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    pub fn led_supported(&self) -> bool {
        matches!(self.state, SessionState::Ready { led_supported: true })
    }

    pub fn led_characteristic(&self) -> Option<&CharacteristicDescriptor> {
        self.led_characteristic.as_ref()
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    /// Connect to the peripheral
    ///
    /// No timeout is applied here; `disconnect()` cancels a pending attempt.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState { state: self.state });
        }

        self.invalidate();
        self.state = SessionState::Connecting;
        info!(
            "Connecting to {} ({})...",
            self.peripheral.name, self.peripheral.address
        );

        if let Err(e) = self.radio.connect(&self.peripheral.address) {
            error!("Connection request failed: {}", e);
            self.finish_disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// Cancel a pending connection or tear down the active one
    ///
    /// The listener hears about it once the radio confirms.
    pub fn disconnect(&mut self) {
        match self.state {
            SessionState::Idle => debug!("Session already idle"),
            SessionState::Disconnecting => debug!("Disconnect already in progress"),
            previous => {
                info!("Cancelling connection ({})...", previous);
                self.state = SessionState::Disconnecting;
                self.pending = None;
                if let Err(e) = self.radio.disconnect(&self.peripheral.address) {
                    warn!("Disconnect request failed: {}. Resetting session.", e);
                    self.finish_disconnect();
                }
            }
        }
    }

    /// Read the LED characteristic
    ///
    /// When the characteristic cannot be read the listener is told the LED
    /// is off without any I/O.
    pub fn read_state(&mut self) -> Result<(), SessionError> {
        let Some(led) = self.ready_characteristic()? else {
            warn!("LED characteristic not available, nothing to read");
            return Ok(());
        };

        if !led.properties.read {
            warn!("Can't read LED state, characteristic is not readable");
            self.listener.on_led_state_changed(false);
            return Ok(());
        }

        debug!("Reading LED characteristic...");
        self.pending = Some(PendingOperation::Read);
        if let Err(e) = self.radio.read_value(&self.peripheral.address, &led) {
            warn!("LED read request failed: {}", e);
            self.pending = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Switch the LED
    pub fn write_state(&mut self, on: bool) -> Result<(), SessionError> {
        let Some(led) = self.ready_characteristic()? else {
            warn!("LED characteristic not available, nothing to write");
            return Ok(());
        };

        let value = LedState::from(on);
        let bytes = protocol::encode_led(value);

        if led.properties.write {
            info!("Writing LED value {:?} (with response)...", value);
            self.pending = Some(PendingOperation::Write(value));
            if let Err(e) =
                self.radio
                    .write_value(&self.peripheral.address, &led, &bytes, WriteMode::WithResponse)
            {
                self.pending = None;
                return Err(self.write_failed(e));
            }
        } else if led.properties.write_without_response {
            info!("Writing LED value {:?} (without response)...", value);
            if let Err(e) = self.radio.write_value(
                &self.peripheral.address,
                &led,
                &bytes,
                WriteMode::WithoutResponse,
            ) {
                return Err(self.write_failed(e));
            }
            // no confirmation will arrive for this write
            self.listener.on_led_state_changed(value.is_on());
        } else {
            warn!("LED characteristic is not writable");
        }
        Ok(())
    }

    pub fn turn_on_led(&mut self) -> Result<(), SessionError> {
        self.write_state(true)
    }

    pub fn turn_off_led(&mut self) -> Result<(), SessionError> {
        self.write_state(false)
    }

    /// Feed one radio event into the state machine
    pub fn handle_event(&mut self, event: &RadioEvent) {
        match event {
            RadioEvent::StateChanged(radio_state) => self.on_radio_state(*radio_state),
            RadioEvent::AdvertisementReceived(_) => {}
            _ => {
                if event.address() != Some(&self.peripheral.address) {
                    trace!("Ignoring event for another peripheral: {:?}", event);
                    return;
                }
                match event {
                    RadioEvent::Connected(_) => self.on_connected(),
                    RadioEvent::ConnectFailed { error, .. } => self.on_connect_failed(error),
                    RadioEvent::Disconnected(_) => self.finish_disconnect(),
                    RadioEvent::ServicesDiscovered { result, .. } => self.on_services(result),
                    RadioEvent::CharacteristicsDiscovered {
                        service, result, ..
                    } => self.on_characteristics(*service, result),
                    RadioEvent::NotifyStateUpdated {
                        characteristic,
                        result,
                        ..
                    } => self.on_notify_state(*characteristic, result),
                    RadioEvent::ValueUpdated {
                        characteristic,
                        result,
                        ..
                    } => self.on_value(*characteristic, result),
                    RadioEvent::Notification {
                        characteristic,
                        value,
                        ..
                    } => self.on_notification(*characteristic, value),
                    RadioEvent::WriteCompleted {
                        characteristic,
                        result,
                        ..
                    } => self.on_write_completed(*characteristic, result),
                    RadioEvent::StateChanged(_) | RadioEvent::AdvertisementReceived(_) => {}
                }
            }
        }
    }

    fn on_radio_state(&mut self, radio_state: RadioState) {
        if radio_state == RadioState::PoweredOn || self.is_idle() {
            return;
        }
        warn!("Central Manager state changed to {:?}", radio_state);
        // the radio is gone, nothing left to tear down
        self.finish_disconnect();
    }

    fn on_connected(&mut self) {
        match self.state {
            SessionState::Connecting => {}
            SessionState::Idle | SessionState::Disconnecting => {
                // a cancelled attempt completed anyway; nobody owns this link
                warn!(
                    "Late connection to {} after cancel, disconnecting",
                    self.peripheral.address
                );
                if let Err(e) = self.radio.disconnect(&self.peripheral.address) {
                    warn!("Disconnect request failed: {}", e);
                }
                return;
            }
            _ => {
                trace!("Ignoring connected event while {}", self.state);
                return;
            }
        }

        info!("Connected to {}", self.peripheral.address);
        self.state = SessionState::DiscoveringServices;
        debug!("Discovering LED Button service...");
        if let Err(e) = self
            .radio
            .discover_services(&self.peripheral.address, &[self.config.service_uuid])
        {
            warn!("Service discovery request failed: {}", e);
            self.become_ready(false);
        }
    }

    fn on_connect_failed(&mut self, error: &RadioError) {
        if self.state != SessionState::Connecting {
            trace!("Ignoring connect failure while {}", self.state);
            return;
        }
        error!("Failed to connect to {}: {}", self.peripheral.address, error);
        self.finish_disconnect();
    }

    fn on_services(&mut self, result: &Result<Vec<ServiceDescriptor>, RadioError>) {
        if self.state != SessionState::DiscoveringServices {
            trace!("Ignoring service list while {}", self.state);
            return;
        }

        let found = match result {
            Ok(services) => {
                debug!("Discovered {} services", services.len());
                services.iter().any(|s| s.uuid == self.config.service_uuid)
            }
            Err(e) => {
                warn!("Service discovery failed: {}", e);
                false
            }
        };

        if !found {
            warn!("LED Button service not found");
            self.become_ready(false);
            return;
        }

        info!("LED Button service found");
        self.state = SessionState::DiscoveringCharacteristics;
        debug!("Discovering LED characteristics...");
        if let Err(e) = self.radio.discover_characteristics(
            &self.peripheral.address,
            self.config.service_uuid,
            &[self.config.led_char_uuid],
        ) {
            warn!("Characteristic discovery request failed: {}", e);
            self.become_ready(false);
        }
    }

    fn on_characteristics(
        &mut self,
        service: Uuid,
        result: &Result<Vec<CharacteristicDescriptor>, RadioError>,
    ) {
        if self.state != SessionState::DiscoveringCharacteristics
            || service != self.config.service_uuid
        {
            trace!("Ignoring characteristics of {} while {}", service, self.state);
            return;
        }

        let led = match result {
            Ok(characteristics) => characteristics
                .iter()
                .find(|c| c.uuid == self.config.led_char_uuid)
                .copied(),
            Err(e) => {
                warn!("Characteristic discovery failed: {}", e);
                None
            }
        };

        let Some(led) = led else {
            warn!("LED characteristic not found");
            self.become_ready(false);
            return;
        };

        info!("LED characteristic found ({})", led.properties);
        self.led_characteristic = Some(led);
        self.state = SessionState::SubscribingNotifications;

        if !led.properties.notify {
            debug!("LED characteristic has no notify property, polling instead");
            self.finish_setup();
            return;
        }

        debug!("Enabling notifications for characteristic...");
        if let Err(e) = self
            .radio
            .set_notify(&self.peripheral.address, &led, true)
        {
            warn!("Notification request failed: {}. Falling back to reads.", e);
            self.finish_setup();
        }
    }

    fn on_notify_state(&mut self, characteristic: Uuid, result: &Result<bool, RadioError>) {
        if self.state != SessionState::SubscribingNotifications
            || Some(characteristic) != self.led_characteristic.map(|c| c.uuid)
        {
            trace!("Ignoring notify state of {} while {}", characteristic, self.state);
            return;
        }

        match result {
            Ok(enabled) => info!("Notifications enabled: {}", enabled),
            Err(e) => warn!("Could not enable notifications: {}. Falling back to reads.", e),
        }
        self.finish_setup();
    }

    fn owns_led_value(&self, characteristic: Uuid) -> bool {
        matches!(self.state, SessionState::Ready { .. })
            && Some(characteristic) == self.led_characteristic.map(|c| c.uuid)
    }

    fn on_value(&mut self, characteristic: Uuid, result: &Result<Vec<u8>, RadioError>) {
        if !self.owns_led_value(characteristic) {
            trace!("Ignoring value of {} while {}", characteristic, self.state);
            return;
        }

        if self.pending == Some(PendingOperation::Read) {
            self.pending = None;
        }

        match result {
            Ok(bytes) => self.report_led(bytes),
            Err(e) => warn!("LED read failed: {}", e),
        }
    }

    /// Notify push; an outstanding read stays outstanding
    fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        if !self.owns_led_value(characteristic) {
            trace!("Ignoring notification of {} while {}", characteristic, self.state);
            return;
        }
        self.report_led(value);
    }

    fn report_led(&mut self, bytes: &[u8]) {
        let led = protocol::decode_led(bytes);
        debug!("LED value {:02X?} -> {:?}", bytes, led);
        self.listener.on_led_state_changed(led.is_on());
    }

    fn on_write_completed(&mut self, characteristic: Uuid, result: &Result<(), RadioError>) {
        let Some(PendingOperation::Write(value)) = self.pending else {
            trace!("Ignoring unexpected write confirmation while {}", self.state);
            return;
        };
        if Some(characteristic) != self.led_characteristic.map(|c| c.uuid) {
            trace!("Ignoring write confirmation for {}", characteristic);
            return;
        }
        self.pending = None;

        if let Err(e) = result {
            self.write_failed(e.clone());
            return;
        }

        info!("LED value written: {:?}", value);
        let readable = self
            .led_characteristic
            .map(|c| c.properties.read)
            .unwrap_or(false);
        if readable {
            // reconcile with what the board actually did
            if let Err(e) = self.read_state() {
                warn!("Confirmation read failed: {}", e);
            }
        } else {
            self.listener.on_led_state_changed(value.is_on());
        }
    }

    /// A failed write is a transient radio failure: drop the link
    fn write_failed(&mut self, e: RadioError) -> SessionError {
        error!("LED write failed: {}. Disconnecting.", e);
        self.disconnect();
        e.into()
    }

    /// Characteristic found and notifications settled
    fn finish_setup(&mut self) {
        self.become_ready(true);
        if let Err(e) = self.read_state() {
            warn!("Initial LED read failed: {}", e);
        }
    }

    fn become_ready(&mut self, led_supported: bool) {
        self.state = SessionState::Ready { led_supported };
        info!("Session ready (LED supported: {})", led_supported);
        self.listener.on_session_ready(led_supported);
    }

    fn finish_disconnect(&mut self) {
        if self.is_idle() {
            trace!("Disconnect for an idle session ignored");
            return;
        }
        info!("PMOD board {} disconnected", self.peripheral.address);
        self.invalidate();
        self.state = SessionState::Idle;
        self.listener.on_session_disconnected();
    }

    /// Drop everything tied to the current connection
    fn invalidate(&mut self) {
        self.led_characteristic = None;
        self.pending = None;
    }

    /// The LED characteristic, provided the session may issue an operation now
    fn ready_characteristic(&self) -> Result<Option<CharacteristicDescriptor>, SessionError> {
        if !matches!(self.state, SessionState::Ready { .. }) {
            return Err(SessionError::InvalidState { state: self.state });
        }
        if self.pending.is_some() {
            return Err(SessionError::Busy);
        }
        Ok(self.led_characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::CharacteristicProperties;
    use crate::infrastructure::bluetooth::simulator::{
        RadioOperation, SimulatedPeripheral, SimulatedRadio,
    };

    const ADDRESS: &str = "C0:FF:EE:00:15:23";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Ready(bool),
        Disconnected,
        Led(bool),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl SessionListener for Recorder {
        fn on_session_ready(&mut self, led_supported: bool) {
            self.calls.push(Call::Ready(led_supported));
        }

        fn on_session_disconnected(&mut self) {
            self.calls.push(Call::Disconnected);
        }

        fn on_led_state_changed(&mut self, is_on: bool) {
            self.calls.push(Call::Led(is_on));
        }
    }

    type TestSession = PeripheralSession<SimulatedRadio, Recorder>;

    struct Harness {
        radio: Arc<SimulatedRadio>,
        events: mpsc::UnboundedReceiver<RadioEvent>,
        session: TestSession,
    }

    impl Harness {
        fn new(peripheral: SimulatedPeripheral) -> Self {
            let (radio, events) = SimulatedRadio::with_peripheral(peripheral);
            let radio = Arc::new(radio);
            let adv = Advertisement::new(ADDRESS, Some("Nordic_Blinky".into()), -50);
            let session = PeripheralSession::new(
                radio.clone(),
                adv,
                SessionConfig::default(),
                Recorder::default(),
            );
            Self {
                radio,
                events,
                session,
            }
        }

        fn with_properties(properties: CharacteristicProperties) -> Self {
            Self::new(SimulatedPeripheral::blinky(ADDRESS).with_properties(properties))
        }

        /// Deliver every queued radio event
        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.session.handle_event(&event);
            }
        }

        /// Deliver events one at a time until the session reaches `target`
        fn step_until(&mut self, target: SessionState) {
            while self.session.state() != target {
                let event = self.events.try_recv().expect("ran out of radio events");
                self.session.handle_event(&event);
            }
        }

        fn connect(&mut self) {
            self.session.connect().unwrap();
            self.pump();
        }

        fn calls(&self) -> &[Call] {
            &self.session.listener().calls
        }

        fn clear(&mut self) {
            self.session.listener_mut().calls.clear();
            self.radio.clear_operations();
        }

        fn count(&self, call: Call) -> usize {
            self.calls().iter().filter(|c| **c == call).count()
        }

        fn reads(&self) -> usize {
            self.radio
                .operations()
                .iter()
                .filter(|op| matches!(op, RadioOperation::Read { .. }))
                .count()
        }
    }

    fn props(read: bool, write: bool, write_without_response: bool, notify: bool) -> CharacteristicProperties {
        CharacteristicProperties {
            read,
            write,
            write_without_response,
            notify,
        }
    }

    #[test]
    fn test_connect_reaches_ready_and_reads_initial_state() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS).with_led(LedState::On));
        h.connect();

        assert_eq!(h.session.state(), SessionState::Ready { led_supported: true });
        assert!(h.session.led_supported());
        assert_eq!(h.calls(), &[Call::Ready(true), Call::Led(true)]);
    }

    #[test]
    fn test_led_supported_iff_service_and_characteristic_found() {
        let cases = [
            (SimulatedPeripheral::blinky(ADDRESS), true),
            (SimulatedPeripheral::blinky(ADDRESS).with_properties(CharacteristicProperties::all()), true),
            (SimulatedPeripheral::blinky(ADDRESS).without_led_characteristic(), false),
            (SimulatedPeripheral::blinky(ADDRESS).without_service(), false),
            (
                SimulatedPeripheral::blinky(ADDRESS)
                    .without_service()
                    .without_led_characteristic(),
                false,
            ),
        ];

        for (peripheral, expected) in cases {
            let mut h = Harness::new(peripheral);
            h.connect();
            assert_eq!(
                h.session.state(),
                SessionState::Ready {
                    led_supported: expected
                }
            );
            assert_eq!(h.count(Call::Ready(expected)), 1);
            assert_eq!(h.count(Call::Ready(!expected)), 0);
        }
    }

    #[test]
    fn test_unrelated_service_skips_characteristic_discovery() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS).without_service());
        h.connect();

        assert_eq!(h.calls(), &[Call::Ready(false)]);
        assert!(h.session.led_characteristic().is_none());
        assert!(!h
            .radio
            .operations()
            .iter()
            .any(|op| matches!(op, RadioOperation::DiscoverCharacteristics { .. })));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut h = Harness::with_properties(props(true, true, false, false));
        h.connect();
        h.clear();

        h.session.write_state(true).unwrap();
        h.pump();
        h.session.read_state().unwrap();
        h.pump();

        assert_eq!(h.calls(), &[Call::Led(true), Call::Led(true)]);
        let address = DeviceAddress::from(ADDRESS);
        assert_eq!(h.radio.led(&address), Some(LedState::On));
        // write, confirmation read, explicit read
        let ops = h.radio.operations();
        assert!(matches!(
            ops[0],
            RadioOperation::Write {
                mode: WriteMode::WithResponse,
                ..
            }
        ));
        assert!(matches!(ops[1], RadioOperation::Read { .. }));
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_write_without_response_synthesizes_state() {
        let mut h = Harness::with_properties(props(true, false, true, false));
        h.connect();
        h.clear();

        h.session.turn_on_led().unwrap();
        // reported before any radio event is delivered
        assert_eq!(h.calls(), &[Call::Led(true)]);
        h.pump();

        assert_eq!(h.calls(), &[Call::Led(true)]);
        assert_eq!(h.reads(), 0);
        assert_eq!(
            h.radio.operations(),
            vec![RadioOperation::Write {
                address: ADDRESS.into(),
                characteristic: protocol::LED_CHARACTERISTIC,
                value: vec![protocol::LED_ON],
                mode: WriteMode::WithoutResponse,
            }]
        );
    }

    #[test]
    fn test_unreadable_characteristic_reports_off_without_io() {
        let mut h = Harness::with_properties(props(false, true, false, false));
        h.connect();
        h.clear();

        h.session.read_state().unwrap();
        h.pump();

        assert_eq!(h.calls(), &[Call::Led(false)]);
        assert!(h.radio.operations().is_empty());
    }

    #[test]
    fn test_unreadable_characteristic_reports_written_value() {
        let mut h = Harness::with_properties(props(false, true, false, false));
        h.connect();
        h.clear();

        h.session.write_state(true).unwrap();
        h.pump();

        assert_eq!(h.calls(), &[Call::Led(true)]);
        assert_eq!(h.reads(), 0);
    }

    #[test]
    fn test_unwritable_characteristic_does_nothing() {
        let mut h = Harness::with_properties(props(true, false, false, false));
        h.connect();
        h.clear();

        h.session.write_state(true).unwrap();
        h.pump();

        assert!(h.calls().is_empty());
        assert!(h.radio.operations().is_empty());
    }

    #[test]
    fn test_notify_waits_for_ack_then_forwards_updates() {
        let mut h = Harness::with_properties(props(true, true, false, true));
        h.session.connect().unwrap();
        h.step_until(SessionState::SubscribingNotifications);
        assert!(h.calls().is_empty());

        h.pump();
        assert_eq!(h.session.state(), SessionState::Ready { led_supported: true });
        assert_eq!(h.calls(), &[Call::Ready(true), Call::Led(false)]);
        assert!(h.radio.operations().contains(&RadioOperation::SetNotify {
            address: ADDRESS.into(),
            characteristic: protocol::LED_CHARACTERISTIC,
            enabled: true,
        }));

        h.clear();
        h.radio
            .set_led_externally(&ADDRESS.into(), LedState::On);
        h.pump();
        assert_eq!(h.calls(), &[Call::Led(true)]);
    }

    #[test]
    fn test_notify_rejected_falls_back_to_reads() {
        let mut h = Harness::with_properties(props(true, true, false, true));
        h.session.connect().unwrap();
        h.step_until(SessionState::SubscribingNotifications);

        h.session.handle_event(&RadioEvent::NotifyStateUpdated {
            address: ADDRESS.into(),
            characteristic: protocol::LED_CHARACTERISTIC,
            result: Err(RadioError::Platform("insufficient authentication".into())),
        });
        assert_eq!(h.session.state(), SessionState::Ready { led_supported: true });
        assert_eq!(h.calls(), &[Call::Ready(true)]);
    }

    #[test]
    fn test_disconnect_in_every_state_notifies_once() {
        let targets = [
            SessionState::Connecting,
            SessionState::DiscoveringServices,
            SessionState::DiscoveringCharacteristics,
            SessionState::SubscribingNotifications,
            SessionState::Ready {
                led_supported: true,
            },
        ];

        for target in targets {
            let mut h = Harness::with_properties(CharacteristicProperties::all());
            h.session.connect().unwrap();
            h.step_until(target);

            h.session.disconnect();
            assert_eq!(h.session.state(), SessionState::Disconnecting);
            h.pump();

            assert_eq!(h.session.state(), SessionState::Idle, "from {}", target);
            assert_eq!(h.count(Call::Disconnected), 1, "from {}", target);
            assert!(h.session.led_characteristic().is_none());
        }
    }

    #[test]
    fn test_link_loss_in_every_state_notifies_once() {
        let targets = [
            SessionState::DiscoveringServices,
            SessionState::DiscoveringCharacteristics,
            SessionState::SubscribingNotifications,
            SessionState::Ready {
                led_supported: true,
            },
        ];

        for target in targets {
            let mut h = Harness::with_properties(CharacteristicProperties::all());
            h.session.connect().unwrap();
            h.step_until(target);

            h.radio.drop_link(&ADDRESS.into());
            h.pump();
            // a late duplicate changes nothing
            h.session
                .handle_event(&RadioEvent::Disconnected(ADDRESS.into()));

            assert_eq!(h.session.state(), SessionState::Idle, "from {}", target);
            assert_eq!(h.count(Call::Disconnected), 1, "from {}", target);
        }
    }

    #[test]
    fn test_power_loss_in_every_state_notifies_once() {
        let targets = [
            SessionState::Connecting,
            SessionState::DiscoveringServices,
            SessionState::DiscoveringCharacteristics,
            SessionState::SubscribingNotifications,
            SessionState::Ready {
                led_supported: true,
            },
        ];

        for target in targets {
            let mut h = Harness::with_properties(CharacteristicProperties::all());
            h.session.connect().unwrap();
            h.step_until(target);

            h.radio.set_power(RadioState::PoweredOff);
            h.pump();

            assert_eq!(h.session.state(), SessionState::Idle, "from {}", target);
            assert_eq!(h.count(Call::Disconnected), 1, "from {}", target);
            assert!(h.session.led_characteristic().is_none());

            // power loss while idle is not reported again
            h.session
                .handle_event(&RadioEvent::StateChanged(RadioState::Unauthorized));
            assert_eq!(h.count(Call::Disconnected), 1, "from {}", target);
        }
    }

    #[test]
    fn test_events_for_other_peripherals_are_ignored() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS));
        h.session.connect().unwrap();

        h.session
            .handle_event(&RadioEvent::Connected("11:22:33:44:55:66".into()));
        assert_eq!(h.session.state(), SessionState::Connecting);
        h.session
            .handle_event(&RadioEvent::Disconnected("11:22:33:44:55:66".into()));
        assert_eq!(h.session.state(), SessionState::Connecting);
        assert!(h.calls().is_empty());

        h.pump();
        assert_eq!(h.session.state(), SessionState::Ready { led_supported: true });
    }

    #[test]
    fn test_connect_failure_resets_to_idle() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS).failing_connect());
        h.connect();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.calls(), &[Call::Disconnected]);
        // no automatic retry
        let connects = h
            .radio
            .operations()
            .iter()
            .filter(|op| matches!(op, RadioOperation::Connect(_)))
            .count();
        assert_eq!(connects, 1);
    }

    #[test]
    fn test_connect_request_rejected_by_radio() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS));
        h.radio.set_power(RadioState::PoweredOff);
        h.pump();

        assert!(matches!(h.session.connect(), Err(SessionError::Radio(_))));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.calls(), &[Call::Disconnected]);
    }

    #[test]
    fn test_write_failure_tears_down_session() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS).failing_writes());
        h.connect();
        h.clear();

        h.session.write_state(true).unwrap();
        h.pump();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.calls(), &[Call::Disconnected]);
        assert_eq!(h.reads(), 0);
        assert!(h
            .radio
            .operations()
            .contains(&RadioOperation::Disconnect(ADDRESS.into())));
    }

    #[test]
    fn test_overlapping_operations_are_rejected() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS));
        h.connect();

        h.session.write_state(true).unwrap();
        assert!(matches!(h.session.write_state(false), Err(SessionError::Busy)));
        assert!(matches!(h.session.read_state(), Err(SessionError::Busy)));

        h.pump();
        assert!(h.session.read_state().is_ok());
    }

    #[test]
    fn test_operations_require_ready_session() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS));
        assert!(matches!(
            h.session.read_state(),
            Err(SessionError::InvalidState {
                state: SessionState::Idle
            })
        ));

        h.session.connect().unwrap();
        assert!(matches!(
            h.session.write_state(true),
            Err(SessionError::InvalidState {
                state: SessionState::Connecting
            })
        ));
        assert!(matches!(
            h.session.connect(),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_led_unsupported_session_ignores_led_requests() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS).without_led_characteristic());
        h.connect();
        h.clear();

        h.session.read_state().unwrap();
        h.session.write_state(true).unwrap();
        assert!(h.calls().is_empty());
        assert!(h.radio.operations().is_empty());
    }

    #[test]
    fn test_reconnect_rediscovers_characteristic() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS));
        h.connect();
        h.session.disconnect();
        h.pump();
        assert!(h.session.led_characteristic().is_none());

        h.clear();
        h.connect();
        assert_eq!(h.session.state(), SessionState::Ready { led_supported: true });
        assert!(h.session.led_characteristic().is_some());
        assert!(h
            .radio
            .operations()
            .iter()
            .any(|op| matches!(op, RadioOperation::DiscoverCharacteristics { .. })));
    }

    #[test]
    fn test_stale_write_confirmation_after_disconnect_is_dropped() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS));
        h.connect();
        h.clear();

        h.session.write_state(true).unwrap();
        h.session.disconnect();
        h.pump();

        // WriteCompleted was queued before Disconnected and must not trigger a read
        assert_eq!(h.calls(), &[Call::Disconnected]);
        assert_eq!(h.reads(), 0);
    }

    #[test]
    fn test_notification_does_not_complete_outstanding_read() {
        let mut h = Harness::with_properties(CharacteristicProperties::all());
        h.connect();
        h.clear();

        h.session.read_state().unwrap();
        // board pushes a value before the read response arrives
        h.session.handle_event(&RadioEvent::Notification {
            address: ADDRESS.into(),
            characteristic: protocol::LED_CHARACTERISTIC,
            value: vec![protocol::LED_ON],
        });
        assert_eq!(h.calls(), &[Call::Led(true)]);
        assert!(matches!(h.session.read_state(), Err(SessionError::Busy)));
        assert_eq!(h.reads(), 1);

        h.pump();
        assert_eq!(h.calls(), &[Call::Led(true), Call::Led(false)]);
        assert!(h.session.read_state().is_ok());
        assert_eq!(h.reads(), 2);
    }

    #[test]
    fn test_notification_does_not_complete_confirmation_read() {
        let mut h = Harness::with_properties(CharacteristicProperties::all());
        h.connect();
        h.pump();
        h.clear();

        h.session.write_state(true).unwrap();
        // WriteCompleted only; the confirmation read it issues stays queued
        let confirmed = h.events.try_recv().unwrap();
        h.session.handle_event(&confirmed);
        assert_eq!(h.reads(), 1);

        h.session.handle_event(&RadioEvent::Notification {
            address: ADDRESS.into(),
            characteristic: protocol::LED_CHARACTERISTIC,
            value: vec![protocol::LED_ON],
        });
        assert!(matches!(h.session.read_state(), Err(SessionError::Busy)));

        h.pump();
        assert!(h.session.read_state().is_ok());
        assert_eq!(h.reads(), 2);
    }

    #[test]
    fn test_late_connection_after_cancel_is_torn_down() {
        let mut h = Harness::new(SimulatedPeripheral::blinky(ADDRESS));
        h.session.connect().unwrap();
        // cancel before the radio reports the connection
        h.session.disconnect();
        h.pump();
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.calls(), &[Call::Disconnected]);
        h.clear();

        // the platform finishes the cancelled attempt anyway
        h.session
            .handle_event(&RadioEvent::Connected(ADDRESS.into()));
        h.pump();

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.radio.operations(),
            vec![RadioOperation::Disconnect(ADDRESS.into())]
        );
        assert!(!h.radio.is_connected(&ADDRESS.into()));
        assert!(h.calls().is_empty());
    }
}
