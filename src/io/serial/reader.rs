// src/io/serial/reader.rs
//
// Per-port reader thread.
// Owns the open link, forwards every chunk it reads to the session reactor in
// arrival order, and services queued transmit requests between reads.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::io::types::{PortEvent, PortEventSender, StreamEndReason, TransmitRequest, TransmitSender};
use crate::io::SerialLink;

/// Bytes requested per read call
const READ_CHUNK_SIZE: usize = 256;

/// How long a caller waits for the reader thread to perform a write
const TRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to a running port reader
pub struct SerialReader {
    path: String,
    generation: u64,
    cancel_flag: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
    /// Channel sender for transmit requests
    transmit_tx: Arc<Mutex<Option<TransmitSender>>>,
}

impl SerialReader {
    /// Start reading `link` on a blocking worker thread.
    /// Must be called from within a tokio runtime.
    pub fn start(
        path: String,
        generation: u64,
        link: Box<dyn SerialLink>,
        port_tx: PortEventSender,
    ) -> Self {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let (transmit_tx, transmit_rx) = std_mpsc::sync_channel::<TransmitRequest>(32);

        let thread_path = path.clone();
        let thread_cancel = cancel_flag.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_serial_stream_blocking(
                thread_path,
                generation,
                link,
                thread_cancel,
                transmit_rx,
                port_tx,
            )
        });

        Self {
            path,
            generation,
            cancel_flag,
            task_handle: Some(handle),
            transmit_tx: Arc::new(Mutex::new(Some(transmit_tx))),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue bytes for the reader thread to write and wait for the result
    pub fn transmit(&self, bytes: &[u8]) -> Result<(), String> {
        self.queue_transmit(bytes)?.wait()
    }

    /// Queue bytes for the reader thread without waiting.
    /// Writes queued from one caller are performed in queue order.
    pub fn queue_transmit(&self, bytes: &[u8]) -> Result<PendingTransmit, String> {
        let tx = {
            let guard = self
                .transmit_tx
                .lock()
                .map_err(|e| format!("Failed to lock transmit channel: {}", e))?;
            guard.clone().ok_or("Not connected (no transmit channel)")?
        };

        let (result_tx, result_rx) = std_mpsc::sync_channel(1);

        tx.try_send(TransmitRequest {
            data: bytes.to_vec(),
            result_tx,
        })
        .map_err(|e| format!("Failed to queue transmit request: {}", e))?;

        Ok(PendingTransmit { result_rx })
    }

    /// Ask the reader thread to stop and wait until it has released the port
    pub async fn stop(&mut self) {
        self.cancel_flag.store(true, Ordering::Relaxed);

        if let Ok(mut guard) = self.transmit_tx.lock() {
            *guard = None;
        }

        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                port_log!(self.path, "Reader task panicked: {:?}", e);
            }
        }
    }
}

/// A queued write whose outcome has not been collected yet
pub struct PendingTransmit {
    result_rx: std_mpsc::Receiver<Result<(), String>>,
}

impl PendingTransmit {
    /// Block until the reader thread has performed the write (bounded wait)
    pub fn wait(self) -> Result<(), String> {
        self.result_rx
            .recv_timeout(TRANSMIT_TIMEOUT)
            .map_err(|e| format!("Transmit timeout or channel closed: {}", e))?
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        // Reader threads must never outlive their session
        self.cancel_flag.store(true, Ordering::Relaxed);
    }
}

/// Blocking read loop. Ends on cancel, EOF, read error, or when the reactor
/// has gone away.
fn run_serial_stream_blocking(
    path: String,
    generation: u64,
    mut link: Box<dyn SerialLink>,
    cancel_flag: Arc<AtomicBool>,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    port_tx: PortEventSender,
) {
    port_log!(path, "Reader started (generation {})", generation);

    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut total_bytes_read: u64 = 0;
    let reason;

    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            reason = StreamEndReason::Stopped;
            break;
        }

        // Process pending transmit requests (non-blocking)
        while let Ok(req) = transmit_rx.try_recv() {
            let result = link
                .write_all(&req.data)
                .and_then(|_| link.flush())
                .map_err(|e| format!("Serial write error: {}", e));
            let _ = req.result_tx.try_send(result);
        }

        match link.read(&mut buf) {
            Ok(n) if n > 0 => {
                total_bytes_read += n as u64;
                let event = PortEvent::Data {
                    path: path.clone(),
                    generation,
                    bytes: buf[..n].to_vec(),
                };
                if port_tx.send(event).is_err() {
                    // Reactor is gone, nobody left to consume bytes
                    reason = StreamEndReason::Stopped;
                    break;
                }
            }
            Ok(_) => {
                reason = StreamEndReason::Disconnected;
                break;
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                // Timeout is expected for serial reads
            }
            Err(e) => {
                reason = StreamEndReason::Error(e.to_string());
                break;
            }
        }
    }

    port_log!(
        path,
        "Reader ended ({}) after {} bytes",
        reason,
        total_bytes_read
    );

    let _ = port_tx.send(PortEvent::Ended {
        path,
        generation,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::MockTransport;
    use crate::io::SerialTransport;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_reader_forwards_chunks_in_order() {
        let transport = MockTransport::new();
        let device = transport.add_device("/dev/mock0");
        device.push(b"abc");
        device.push(b"def");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = transport.open("/dev/mock0", 9600).unwrap();
        let mut reader = SerialReader::start("/dev/mock0".into(), 7, link, tx);

        let mut collected = Vec::new();
        while collected.len() < 6 {
            match rx.recv().await.unwrap() {
                PortEvent::Data { generation, bytes, .. } => {
                    assert_eq!(generation, 7);
                    collected.extend(bytes);
                }
                PortEvent::Ended { .. } => panic!("reader ended early"),
            }
        }
        assert_eq!(collected, b"abcdef");

        reader.stop().await;
        match rx.recv().await.unwrap() {
            PortEvent::Ended { reason, .. } => assert_eq!(reason, StreamEndReason::Stopped),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reader_reports_disconnect() {
        let transport = MockTransport::new();
        let device = transport.add_device("/dev/mock0");
        device.disconnect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = transport.open("/dev/mock0", 9600).unwrap();
        let _reader = SerialReader::start("/dev/mock0".into(), 1, link, tx);

        match rx.recv().await.unwrap() {
            PortEvent::Ended { reason, .. } => assert_eq!(reason, StreamEndReason::Disconnected),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transmit_goes_through_reader_thread() {
        let transport = MockTransport::new();
        let device = transport.add_device("/dev/mock0");

        let (tx, _rx) = mpsc::unbounded_channel();
        let link = transport.open("/dev/mock0", 9600).unwrap();
        let mut reader = SerialReader::start("/dev/mock0".into(), 1, link, tx);

        reader.transmit(b"ping\n").unwrap();
        assert_eq!(device.written(), b"ping\n");

        reader.stop().await;
        assert!(reader.transmit(b"late").is_err());
    }
}
