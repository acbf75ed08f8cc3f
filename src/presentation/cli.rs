//! Command line front end
//!
//! Spawns the [`BluetoothService`] on a radio backend and drives it with
//! commands until the requested action is done.

use crate::domain::models::{Advertisement, AppEvent, BluetoothCommand, DeviceAddress};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::simulator::{SimulatedPeripheral, SimulatedRadio};
use crate::infrastructure::bluetooth::{BluetoothService, Radio, RadioEvent, ServiceConfig};
use crate::infrastructure::logging;
use crate::presentation::console;
use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Address of the board the simulator advertises
pub const SIMULATED_ADDRESS: &str = "C0:FF:EE:00:15:23";

#[derive(Parser, Debug)]
#[command(name = "pmod-blinky")]
#[command(about = "Control the LED of an Avnet PMOD / Nordic Blinky board over BLE")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Talk to an in-process simulated board instead of the system adapter
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Settings file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Advertised name to connect to ("" accepts any board)
    #[arg(short, long, global = true)]
    pub device_name: Option<String>,

    /// Seconds to wait for the board
    #[arg(short, long, global = true, default_value = "10")]
    pub timeout: u64,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// List boards advertising the Blinky service
    Scan,
    /// Connect and print the LED state
    Status,
    /// Switch the LED
    Led {
        #[arg(value_enum)]
        action: LedAction,
    },
    /// Connect and print LED changes until interrupted
    Watch,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedAction {
    On,
    Off,
    Toggle,
}

impl LedAction {
    pub fn target(self, current: bool) -> bool {
        match self {
            LedAction::On => true,
            LedAction::Off => false,
            LedAction::Toggle => !current,
        }
    }
}

/// What the event loop concluded
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Continue,
    Done,
}

/// Progress of one CLI command, fed with service events
#[derive(Debug)]
struct Job {
    command: Command,
    seen: BTreeMap<DeviceAddress, Advertisement>,
    ready: bool,
    requested: Option<bool>,
    /// The service leaves connecting to us
    connect_on_candidate: bool,
}

impl Job {
    fn new(command: Command, auto_connect: bool) -> Self {
        Self {
            command,
            seen: BTreeMap::new(),
            ready: false,
            requested: None,
            connect_on_candidate: command != Command::Scan && !auto_connect,
        }
    }

    fn on_event(
        &mut self,
        event: &AppEvent,
        commands: &mpsc::UnboundedSender<BluetoothCommand>,
    ) -> Result<Outcome> {
        match event {
            AppEvent::DeviceDiscovered(adv) => {
                self.seen.insert(adv.address.clone(), adv.clone());
            }
            AppEvent::CandidateFound(_) if self.connect_on_candidate => {
                commands.send(BluetoothCommand::ConnectSelected)?;
            }
            AppEvent::SessionReady { led_supported } => {
                if !led_supported && self.command != Command::Watch {
                    bail!("The board does not expose the LED characteristic");
                }
                self.ready = true;
            }
            AppEvent::SessionDisconnected if self.ready => {
                if self.command == Command::Watch {
                    return Ok(Outcome::Done);
                }
                bail!("Lost connection to the board");
            }
            AppEvent::SessionDisconnected => bail!("Could not connect to the board"),
            AppEvent::LedStateChanged(on) => {
                match self.command {
                    Command::Status => {
                        println!("LED: {}", console::led_label(*on));
                        return Ok(Outcome::Done);
                    }
                    Command::Led { action } => match self.requested {
                        None => {
                            let target = action.target(*on);
                            self.requested = Some(target);
                            commands.send(BluetoothCommand::WriteLed(target))?;
                        }
                        Some(target) if target == *on => {
                            println!("LED: {}", console::led_label(*on));
                            return Ok(Outcome::Done);
                        }
                        Some(_) => {}
                    },
                    Command::Scan | Command::Watch => {}
                }
            }
            _ => {}
        }
        Ok(Outcome::Continue)
    }

    fn print_summary(&self) {
        if self.seen.is_empty() {
            println!("No boards found.");
            return;
        }
        println!("{:<24} {:<20} {:>8}", "ADDRESS", "NAME", "RSSI");
        for adv in self.seen.values() {
            println!("{}", console::format_device(adv));
        }
    }
}

/// Entry point used by `main`
pub async fn run(cli: Cli) -> Result<()> {
    let mut settings = match &cli.config {
        Some(path) => SettingsService::from_path(path),
        None => SettingsService::new()?,
    };
    if let Some(name) = &cli.device_name {
        settings.get_mut().device_name = name.clone();
    }

    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    debug!("Settings loaded from {}", settings.path().display());

    let mut config = settings.get().to_service_config()?;
    if cli.command == Command::Scan {
        config.auto_connect = false;
    }
    let timeout = Duration::from_secs(cli.timeout);

    if cli.simulate {
        info!("Using simulated radio");
        let (radio, radio_events) =
            SimulatedRadio::with_peripheral(SimulatedPeripheral::blinky(SIMULATED_ADDRESS));
        return drive(Arc::new(radio), radio_events, config, cli.command, timeout).await;
    }

    #[cfg(feature = "btleplug")]
    {
        let (radio, radio_events) =
            crate::infrastructure::bluetooth::btleplug_radio::BtleplugRadio::new().await?;
        drive(Arc::new(radio), radio_events, config, cli.command, timeout).await
    }
    #[cfg(not(feature = "btleplug"))]
    {
        bail!("Built without the `btleplug` feature; use --simulate or rebuild with --features btleplug")
    }
}

/// Run one command against a radio backend
pub async fn drive<R: Radio + 'static>(
    radio: Arc<R>,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    config: ServiceConfig,
    command: Command,
    timeout: Duration,
) -> Result<()> {
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (commands, command_rx) = mpsc::unbounded_channel();
    let mut job = Job::new(command, config.auto_connect);
    let service = BluetoothService::new(radio, event_tx, config).spawn(command_rx, radio_events);

    commands.send(BluetoothCommand::StartScan)?;

    let deadline = Instant::now() + timeout;
    let result = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break Err(anyhow::anyhow!("Bluetooth service stopped unexpectedly"));
                };
                console::print_event(&event);
                match job.on_event(&event, &commands) {
                    Ok(Outcome::Continue) => {}
                    Ok(Outcome::Done) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            _ = tokio::time::sleep_until(deadline), if command != Command::Watch || !job.ready => {
                break match command {
                    Command::Scan => Ok(()),
                    _ => Err(anyhow::anyhow!("Timed out waiting for the board")),
                };
            }
            _ = tokio::signal::ctrl_c(), if command == Command::Watch => break Ok(()),
        }
    };

    if command == Command::Scan {
        job.print_summary();
    }

    // leave the board disconnected; the service disconnects on shutdown
    let _ = commands.send(BluetoothCommand::Shutdown);
    service.await??;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::LedState;
    use crate::infrastructure::bluetooth::simulator::{RadioOperation, SimulatedPeripheral};

    fn simulated(
        peripheral: SimulatedPeripheral,
    ) -> (Arc<SimulatedRadio>, mpsc::UnboundedReceiver<RadioEvent>) {
        let (radio, rx) = SimulatedRadio::with_peripheral(peripheral);
        (Arc::new(radio), rx)
    }

    fn connect_config() -> ServiceConfig {
        ServiceConfig {
            auto_connect: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_cli_parses_global_options() {
        let cli = Cli::parse_from([
            "pmod-blinky",
            "led",
            "toggle",
            "--simulate",
            "--timeout",
            "3",
            "-d",
            "",
        ]);
        assert_eq!(
            cli.command,
            Command::Led {
                action: LedAction::Toggle
            }
        );
        assert!(cli.simulate);
        assert_eq!(cli.timeout, 3);
        assert_eq!(cli.device_name.as_deref(), Some(""));
    }

    #[test]
    fn test_led_action_target() {
        assert!(LedAction::On.target(true));
        assert!(!LedAction::Off.target(true));
        assert!(LedAction::Toggle.target(false));
        assert!(!LedAction::Toggle.target(true));
    }

    #[tokio::test]
    async fn test_toggle_led_on_simulated_board() {
        let (radio, rx) = simulated(SimulatedPeripheral::blinky(SIMULATED_ADDRESS));
        let command = Command::Led {
            action: LedAction::Toggle,
        };
        drive(radio.clone(), rx, connect_config(), command, Duration::from_secs(2))
            .await
            .unwrap();

        let address = DeviceAddress::from(SIMULATED_ADDRESS);
        assert_eq!(radio.led(&address), Some(LedState::On));
        assert!(!radio.is_connected(&address));
    }

    #[tokio::test]
    async fn test_status_connects_without_auto_connect() {
        let (radio, rx) = simulated(SimulatedPeripheral::blinky(SIMULATED_ADDRESS));
        let config = ServiceConfig {
            auto_connect: false,
            ..Default::default()
        };
        drive(radio.clone(), rx, config, Command::Status, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(radio
            .operations()
            .contains(&RadioOperation::Connect(SIMULATED_ADDRESS.into())));
    }

    #[tokio::test]
    async fn test_status_without_led_characteristic_fails() {
        let (radio, rx) = simulated(
            SimulatedPeripheral::blinky(SIMULATED_ADDRESS).without_led_characteristic(),
        );
        let result = drive(radio, rx, connect_config(), Command::Status, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_status_times_out_without_board() {
        let (radio, rx) = SimulatedRadio::new();
        let result = drive(
            Arc::new(radio),
            rx,
            connect_config(),
            Command::Status,
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(result.unwrap_err().to_string(), "Timed out waiting for the board");
    }

    #[tokio::test]
    async fn test_scan_lists_boards() {
        let (radio, rx) = simulated(SimulatedPeripheral::blinky(SIMULATED_ADDRESS));
        radio.add_peripheral(SimulatedPeripheral::blinky("C0:FF:EE:00:00:02").with_name(None));
        drive(
            radio.clone(),
            rx,
            ServiceConfig::default(),
            Command::Scan,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(!radio.is_connected(&SIMULATED_ADDRESS.into()));
    }
}
