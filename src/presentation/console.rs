//! Console rendering of service events

use crate::domain::models::{Advertisement, AppEvent, MessageSeverity, StatusMessage};

fn tag(severity: MessageSeverity) -> &'static str {
    match severity {
        MessageSeverity::Info => "INFO",
        MessageSeverity::Success => " OK ",
        MessageSeverity::Warning => "WARN",
        MessageSeverity::Error => "FAIL",
    }
}

pub fn format_status(status: &StatusMessage) -> String {
    format!("[{}] {}", tag(status.severity), status.message)
}

pub fn format_device(adv: &Advertisement) -> String {
    format!("{:<24} {:<20} {:>4} dBm", adv.address, adv.name, adv.rssi)
}

pub fn led_label(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Status line for an event, `None` for events that stay silent
pub fn describe(event: &AppEvent) -> Option<String> {
    let status = match event {
        AppEvent::LogMessage(status) => return Some(format_status(status)),
        AppEvent::RadioStateChanged(state) => {
            StatusMessage::new(format!("Bluetooth radio is {:?}", state), MessageSeverity::Info)
        }
        AppEvent::DeviceDiscovered(_) => return None,
        AppEvent::CandidateFound(adv) => StatusMessage::new(
            format!("Found {} ({}, {} dBm)", adv.name, adv.address, adv.rssi),
            MessageSeverity::Info,
        ),
        AppEvent::SessionReady { led_supported: true } => {
            StatusMessage::new("Connected, LED ready", MessageSeverity::Success)
        }
        AppEvent::SessionReady {
            led_supported: false,
        } => StatusMessage::new(
            "Connected, but the board has no LED characteristic",
            MessageSeverity::Warning,
        ),
        AppEvent::SessionDisconnected => {
            StatusMessage::new("Disconnected", MessageSeverity::Info)
        }
        AppEvent::LedStateChanged(on) => {
            StatusMessage::new(format!("LED is {}", led_label(*on)), MessageSeverity::Info)
        }
    };
    Some(format_status(&status))
}

pub fn print_event(event: &AppEvent) {
    if let Some(line) = describe(event) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines() {
        assert_eq!(
            describe(&AppEvent::LedStateChanged(true)).unwrap(),
            "[INFO] LED is ON"
        );
        assert_eq!(
            describe(&AppEvent::LogMessage(StatusMessage::new(
                "boom",
                MessageSeverity::Error
            )))
            .unwrap(),
            "[FAIL] boom"
        );
        assert!(describe(&AppEvent::DeviceDiscovered(Advertisement::new("AA", None, -40))).is_none());
    }

    #[test]
    fn test_device_row() {
        let row = format_device(&Advertisement::new("AA:BB", Some("Nordic_Blinky".into()), -61));
        assert!(row.starts_with("AA:BB"));
        assert!(row.contains("Nordic_Blinky"));
        assert!(row.ends_with("-61 dBm"));
    }
}
