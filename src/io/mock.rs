// src/io/mock.rs
//
// In-memory transport used by tests and demos.
// Each mock device has an inbound queue (bytes the "device" sends) and an
// outbound log (bytes written by the host).

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{PortInfo, SerialLink, SerialTransport};
use crate::error::{Result, SessionError};

/// Shared state of one mock device
#[derive(Clone, Default)]
pub struct MockDevice {
    inbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
    written: Arc<Mutex<Vec<u8>>>,
    disconnected: Arc<AtomicBool>,
}

impl MockDevice {
    /// Queue bytes for the host to read, as one chunk
    pub fn push(&self, bytes: &[u8]) {
        if let Ok(mut q) = self.inbound.lock() {
            q.push_back(bytes.to_vec());
        }
    }

    /// Everything the host has written so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Make subsequent reads report EOF once the queue is drained
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Read/write end handed out by `MockTransport::open`
pub struct MockLink {
    device: MockDevice,
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self
            .device
            .inbound
            .lock()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            .pop_front();

        match chunk {
            Some(mut bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    if let Ok(mut q) = self.device.inbound.lock() {
                        q.push_front(rest);
                    }
                }
                Ok(n)
            }
            None if self.device.disconnected.load(Ordering::SeqCst) => Ok(0),
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            }
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device
            .written
            .lock()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transport over a fixed set of mock devices
#[derive(Clone, Default)]
pub struct MockTransport {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
    opens: Arc<Mutex<Vec<(String, u32)>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device at `path` and return a handle to drive it
    pub fn add_device(&self, path: &str) -> MockDevice {
        let device = MockDevice::default();
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(path.to_string(), device.clone());
        }
        device
    }

    /// Every `(path, baud_rate)` passed to `open`, in call order
    pub fn opens(&self) -> Vec<(String, u32)> {
        self.opens.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

impl SerialTransport for MockTransport {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| SessionError::LockPoisoned("mock devices"))?;
        let mut ports: Vec<PortInfo> = devices
            .keys()
            .map(|path| PortInfo::new(path.clone(), "Virtual"))
            .collect();
        ports.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(ports)
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>> {
        if let Ok(mut opens) = self.opens.lock() {
            opens.push((path.to_string(), baud_rate));
        }
        let device = self
            .devices
            .lock()
            .ok()
            .and_then(|devices| devices.get(path).cloned())
            .ok_or_else(|| SessionError::PortUnavailable {
                path: path.to_string(),
                reason: "no such device".to_string(),
            })?;
        Ok(Box::new(MockLink { device }))
    }
}
