//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, the peripheral session and the
//! command/event plumbing for the PMOD board. All radio events and user
//! commands are funnelled through [`BluetoothService::run`], so the scanner
//! and the session only ever see one event at a time.

use crate::domain::models::{
    Advertisement, AppEvent, BluetoothCommand, DeviceAddress, MessageSeverity, RadioState,
    StatusMessage,
};
use crate::infrastructure::bluetooth::{
    radio::{Radio, RadioEvent},
    scanner::{ScanConfig, Scanner},
    session::{PeripheralSession, SessionConfig},
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

/// How long shutdown waits for the radio to confirm the final disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the service
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub scan: ScanConfig,
    pub session: SessionConfig,
    /// Connect as soon as the scanner selects a candidate
    pub auto_connect: bool,
}

type Session<R> = PeripheralSession<R, mpsc::UnboundedSender<AppEvent>>;

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<R: Radio> {
    radio: Arc<R>,
    scanner: Scanner<R>,
    session: Option<Session<R>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ServiceConfig,
    /// A scan was asked for and should run whenever the radio is powered on
    scan_requested: bool,
}

impl<R: Radio + 'static> BluetoothService<R> {
    /// Create a new Bluetooth service
    pub fn new(
        radio: Arc<R>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            scanner: Scanner::new(radio.clone(), event_sender.clone(), config.scan.clone()),
            radio,
            session: None,
            event_sender,
            config,
            scan_requested: false,
        }
    }

    /// Run the service on its own task
    pub fn spawn(
        self,
        commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(commands, radio_events))
    }

    /// Process commands and radio events until shutdown
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        mut radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> Result<()> {
        info!("Bluetooth service started (radio: {:?})", self.radio.state());

        loop {
            tokio::select! {
                // radio events already queued describe the past; handle them first
                biased;
                Some(event) = radio_events.recv() => self.handle_radio_event(event),
                command = commands.recv() => match command {
                    None | Some(BluetoothCommand::Shutdown) => break,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command) {
                            error!("Bluetooth command failed: {}", e);
                            self.send_log(&format!("{}", e), MessageSeverity::Error);
                        }
                    }
                },
            }
        }

        self.shutdown();
        self.drain(&mut radio_events).await;
        info!("Bluetooth service stopped");
        Ok(())
    }

    /// Deliver radio events until the session has seen its disconnect
    async fn drain(&mut self, radio_events: &mut mpsc::UnboundedReceiver<RadioEvent>) {
        while !self.session_idle() {
            match tokio::time::timeout(SHUTDOWN_GRACE, radio_events.recv()).await {
                Ok(Some(event)) => self.handle_radio_event(event),
                Ok(None) | Err(_) => {
                    warn!("Radio did not confirm the disconnect before shutdown");
                    break;
                }
            }
        }
    }

    /// Handle one user command
    pub fn handle_command(&mut self, command: BluetoothCommand) -> Result<()> {
        match command {
            BluetoothCommand::StartScan => {
                self.scan_requested = true;
                self.scanner.start()
            }
            BluetoothCommand::StopScan => {
                self.scan_requested = false;
                self.scanner.stop_scan()
            }
            BluetoothCommand::Connect(address) => {
                let peripheral = self
                    .scanner
                    .known(&address)
                    .cloned()
                    .unwrap_or_else(|| Advertisement::new(address, None, 0));
                self.connect(peripheral)
            }
            BluetoothCommand::ConnectSelected => {
                let peripheral = self
                    .scanner
                    .selected()
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("No PMOD board found yet"))?;
                self.connect(peripheral)
            }
            BluetoothCommand::Disconnect => {
                if let Some(session) = self.session.as_mut() {
                    session.disconnect();
                }
                Ok(())
            }
            BluetoothCommand::ReadLed => {
                self.active_session()?.read_state()?;
                Ok(())
            }
            BluetoothCommand::WriteLed(on) => {
                self.active_session()?.write_state(on)?;
                Ok(())
            }
            BluetoothCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    /// Route one radio event to the scanner or the session
    pub fn handle_radio_event(&mut self, event: RadioEvent) {
        match &event {
            RadioEvent::StateChanged(state) => {
                info!("Radio state: {:?}", state);
                let _ = self.event_sender.send(AppEvent::RadioStateChanged(*state));
                if *state == RadioState::PoweredOn {
                    if self.scan_requested && !self.scanner.is_scanning() {
                        if let Err(e) = self.scanner.start() {
                            error!("Failed to start scan: {}", e);
                        }
                    }
                } else {
                    self.scanner.radio_lost();
                }
                if let Some(session) = self.session.as_mut() {
                    session.handle_event(&event);
                }
            }
            RadioEvent::AdvertisementReceived(adv) => {
                let candidate = self.scanner.on_advertisement(adv.clone());
                if let Some(candidate) = candidate {
                    if self.config.auto_connect && self.session_idle() {
                        if let Err(e) = self.connect(candidate) {
                            error!("Auto-connect failed: {}", e);
                        }
                    }
                }
            }
            _ => match self.session.as_mut() {
                Some(session) => session.handle_event(&event),
                None => trace!("No session for radio event {:?}", event),
            },
        }
    }

    /// Promote a discovered peripheral into the (single) session
    fn connect(&mut self, peripheral: Advertisement) -> Result<()> {
        if let Some(session) = self.session.as_ref() {
            if !session.is_idle() {
                anyhow::bail!(
                    "Already {} with {}",
                    session.state(),
                    session.peripheral().address
                );
            }
        }

        self.scan_requested = false;
        self.scanner.stop_scan()?;

        self.send_log(
            &format!("Connecting to {} ({})...", peripheral.name, peripheral.address),
            MessageSeverity::Info,
        );
        let mut session = PeripheralSession::new(
            self.radio.clone(),
            peripheral,
            self.config.session,
            self.event_sender.clone(),
        );
        // a refused request has already been reported as a disconnection
        let result = session.connect();
        self.session = Some(session);
        result?;
        Ok(())
    }

    fn active_session(&mut self) -> Result<&mut Session<R>> {
        self.session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected to a PMOD board"))
    }

    fn session_idle(&self) -> bool {
        self.session.as_ref().map(|s| s.is_idle()).unwrap_or(true)
    }

    pub fn session(&self) -> Option<&Session<R>> {
        self.session.as_ref()
    }

    pub fn scanner(&self) -> &Scanner<R> {
        &self.scanner
    }

    pub fn connected_address(&self) -> Option<&DeviceAddress> {
        self.session
            .as_ref()
            .filter(|s| !s.is_idle())
            .map(|s| s.address())
    }

    fn shutdown(&mut self) {
        self.scan_requested = false;
        let _ = self.scanner.stop_scan();
        if let Some(session) = self.session.as_mut() {
            session.disconnect();
        }
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}
