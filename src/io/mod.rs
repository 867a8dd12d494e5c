// src/io/mod.rs
//
// Device-facing layer: the serial transport abstraction, port enumeration,
// and the per-port reader threads that feed the session reactor.

pub mod mock;
pub mod serial;
mod types;

pub use serial::{LineFramer, PendingTransmit, SerialLine, SerialReader};
pub use types::{PortEvent, PortEventSender, StreamEndReason, TransmitRequest, TransmitSender};

use serde::Serialize;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, SessionError};

// ============================================================================
// Shared Types
// ============================================================================

/// A port as reported to the presentation layer
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortInfo {
    /// Display name (the OS port name)
    pub name: String,
    /// Path to pass back to `open`
    pub path: String,
    /// "USB", "Bluetooth", "PCI", "Unknown" or "Virtual"
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PortInfo {
    pub fn new(path: impl Into<String>, port_type: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: path.clone(),
            path,
            port_type: port_type.into(),
            manufacturer: None,
            product: None,
        }
    }
}

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Transport Traits
// ============================================================================

/// An open byte pipe to one device.
///
/// Reads are expected to time out quickly (`ErrorKind::TimedOut` or
/// `WouldBlock`) when no data is waiting; `Ok(0)` means the device is gone.
pub trait SerialLink: Read + Write + Send {}
impl<T: Read + Write + Send> SerialLink for T {}

/// Provider of serial connections (physical ports, or a mock in tests)
pub trait SerialTransport: Send + Sync {
    /// Enumerate ports that can be opened
    fn available_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open `path` at `baud_rate` (8 data bits, no parity, 1 stop bit)
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>>;
}

// ============================================================================
// System Transport (serialport crate)
// ============================================================================

/// Transport backed by the operating system's serial ports
#[derive(Clone, Debug)]
pub struct SystemTransport {
    read_timeout: Duration,
}

impl SystemTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SystemTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl SerialTransport for SystemTransport {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(|e| {
            tlog!("[io] Failed to enumerate serial ports: {}", e);
            SessionError::from(e)
        })?;

        Ok(ports
            .into_iter()
            // On macOS, filter out /dev/tty.* devices - only show /dev/cu.* (calling unit)
            .filter(|_p| {
                #[cfg(target_os = "macos")]
                {
                    !_p.port_name.starts_with("/dev/tty.")
                }
                #[cfg(not(target_os = "macos"))]
                {
                    true
                }
            })
            .map(|p| {
                let (port_type, manufacturer, product) = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        ("USB", info.manufacturer, info.product)
                    }
                    serialport::SerialPortType::BluetoothPort => ("Bluetooth", None, None),
                    serialport::SerialPortType::PciPort => ("PCI", None, None),
                    serialport::SerialPortType::Unknown => ("Unknown", None, None),
                };
                PortInfo {
                    manufacturer,
                    product,
                    ..PortInfo::new(p.port_name, port_type)
                }
            })
            .collect())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| SessionError::PortUnavailable {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(port))
    }
}
