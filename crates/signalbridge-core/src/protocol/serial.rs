//! Serial port handling
//!
//! Port discovery and low-level access for the signal controller link.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use super::{ConnectError, TransportError, DEFAULT_BAUD_RATE};

/// USB vendor/product substrings that identify a likely controller board.
/// Covers genuine Arduinos as well as the CH340/FTDI clones.
const CANDIDATE_MARKERS: &[&str] = &["arduino", "ch340", "wch", "ftdi", "usb serial", "usb-serial"];

/// Conventional device names tried when no described USB port matches
const CONVENTIONAL_NAMES: &[&str] = &["COM3", "COM4", "COM5", "/dev/ttyUSB0", "/dev/ttyACM0"];

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
            ),
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
        }
    }
}

impl PortInfo {
    /// Whether this port's USB descriptors look like a controller board
    pub fn is_candidate(&self) -> bool {
        let description = format!(
            "{} {}",
            self.manufacturer.as_deref().unwrap_or(""),
            self.product.as_deref().unwrap_or("")
        )
        .to_lowercase();
        CANDIDATE_MARKERS.iter().any(|m| description.contains(m))
    }

    /// Human-readable annotation used for logs and status reports
    pub fn describe(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(mfr), Some(product)) => format!("{} ({} {})", self.name, mfr, product),
            (None, Some(product)) | (Some(product), None) => {
                format!("{} ({})", self.name, product)
            }
            (None, None) => self.name.clone(),
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    // Collect from serialport API
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
    {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: add /dev/ttyACM* and /dev/ttyUSB* entries if present but not found by API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Select candidate controller ports from an enumerated list.
///
/// Described USB-serial devices win; if none match, fall back to the
/// platform-conventional names that are actually present.
pub fn select_candidates(ports: &[PortInfo]) -> Vec<PortInfo> {
    let described: Vec<PortInfo> = ports.iter().filter(|p| p.is_candidate()).cloned().collect();
    if !described.is_empty() {
        return described;
    }

    ports
        .iter()
        .filter(|p| {
            let basename = p.name.rsplit('/').next().unwrap_or(&p.name);
            CONVENTIONAL_NAMES.contains(&p.name.as_str())
                || basename.starts_with("ttyACM")
                || basename.starts_with("ttyUSB")
                || basename.starts_with("COM")
        })
        .cloned()
        .collect()
}

/// List candidate controller ports visible on this host
pub fn candidate_ports() -> Vec<PortInfo> {
    select_candidates(&list_ports())
}

/// Open a serial port with a short read timeout for polled, non-blocking reads
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ConnectError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    serialport::new(name, baud)
        .timeout(Duration::from_millis(50))
        .open()
        .map_err(|e| ConnectError::AddressUnavailable(format!("{}: {}", name, e)))
}

/// Configure a serial port for controller communication (standard 8N1)
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| TransportError::Port(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| TransportError::Port(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| TransportError::Port(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| TransportError::Port(e.to_string()))?;
    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| TransportError::Port(e.to_string()))
}
