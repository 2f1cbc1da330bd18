//! List ports command implementation.

use console::style;

use crate::serial::available_ports;

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) {
    let ports = available_ports();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_else(|_| "[]".to_string())
        );
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &ports {
        let product = port.product.as_deref().unwrap_or("");
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            if !product.is_empty() {
                format!(" - {}", style(product).dim())
            } else {
                String::new()
            }
        );
    }
}
