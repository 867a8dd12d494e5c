// src/io/types.rs
//
// Messages passed between port reader threads and the session reactor.

use std::sync::mpsc as std_mpsc;

// ============================================================================
// Reader Messages
// ============================================================================

/// Message from a port reader thread to the session reactor
#[derive(Debug)]
pub enum PortEvent {
    /// Bytes read from the port, in arrival order (path, reader generation, bytes)
    Data {
        path: String,
        generation: u64,
        bytes: Vec<u8>,
    },
    /// Reader stopped on its own or by request (path, reader generation, reason)
    Ended {
        path: String,
        generation: u64,
        reason: StreamEndReason,
    },
}

/// Why a port reader stopped
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEndReason {
    /// Stop was requested (port closed by the caller)
    Stopped,
    /// Device went away (EOF on read)
    Disconnected,
    /// Read failed
    Error(String),
}

impl std::fmt::Display for StreamEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamEndReason::Stopped => write!(f, "stopped"),
            StreamEndReason::Disconnected => write!(f, "disconnected"),
            StreamEndReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Sender half the reactor hands to each reader
pub type PortEventSender = tokio::sync::mpsc::UnboundedSender<PortEvent>;

// ============================================================================
// Transmit Types
// ============================================================================

/// Transmit request sent through the channel
pub struct TransmitRequest {
    /// Bytes to write as-is
    pub data: Vec<u8>,
    /// Sync oneshot channel to send the result back
    pub result_tx: std_mpsc::SyncSender<Result<(), String>>,
}

/// Sender type for transmit requests (sync-safe)
pub type TransmitSender = std_mpsc::SyncSender<TransmitRequest>;
