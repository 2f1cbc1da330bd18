//! Serial port selection.
//!
//! The port comes from, in order: `--port` / `BOOTBRIDGE_PORT`, the `[port]`
//! section of the configuration, or the only serial port present on the
//! host. Anything else is a usage error so scripts never block on a prompt.

use std::cmp::Ordering;

use anyhow::Result;
use bootbridge::{NativePortEnumerator, PortEnumerator, PortInfo};
use log::{debug, warn};

use crate::CliError;
use crate::config::Config;

/// Every serial port on the host. Enumeration failures yield an empty list.
pub fn available_ports() -> Vec<PortInfo> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Pick the port to open.
pub fn select_port(explicit: Option<&str>, config: &Config) -> Result<String> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    if let Some(name) = &config.port.serial {
        debug!("Using port {name} from configuration");
        return Ok(name.clone());
    }
    pick_single(available_ports())
}

fn pick_single(ports: Vec<PortInfo>) -> Result<String> {
    match ports.len().cmp(&1) {
        Ordering::Equal => {
            let name = ports.into_iter().next().map(|p| p.name).unwrap_or_default();
            debug!("Auto-selected port {name}");
            Ok(name)
        },
        Ordering::Greater => Err(CliError::Usage(format!(
            "Multiple serial ports found ({}); choose one with --port",
            ports
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .into()),
        Ordering::Less => Err(CliError::Usage(
            "No serial port found; connect the target or pass --port".to_string(),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = Config::default();
        config.port.serial = Some("/dev/ttyACM1".to_string());
        assert_eq!(
            select_port(Some("/dev/ttyACM0"), &config).unwrap(),
            "/dev/ttyACM0"
        );
    }

    #[test]
    fn test_config_port_used() {
        let mut config = Config::default();
        config.port.serial = Some("/dev/ttyACM1".to_string());
        assert_eq!(select_port(None, &config).unwrap(), "/dev/ttyACM1");
    }

    #[test]
    fn test_single_port_auto_selected() {
        assert_eq!(pick_single(vec![port("COM7")]).unwrap(), "COM7");
    }

    #[test]
    fn test_ambiguous_ports_are_usage_errors() {
        let err = pick_single(vec![port("COM3"), port("COM7")]).unwrap_err();
        let cli = err.downcast_ref::<CliError>().unwrap();
        assert!(matches!(cli, CliError::Usage(msg) if msg.contains("COM3, COM7")));

        let err = pick_single(Vec::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }
}
