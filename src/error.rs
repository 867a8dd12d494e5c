// src/error.rs
//
// Error type shared by the session registry, recorder, flasher and service.
// Decode problems never surface here: malformed fields and tokens are skipped
// where they are found.

use thiserror::Error;

/// Errors surfaced to callers of the serial core.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The device could not be opened (missing, busy, permission denied, ...)
    #[error("port {path} unavailable: {reason}")]
    PortUnavailable { path: String, reason: String },

    /// Operation needs an open session on this path
    #[error("port {0} is not open")]
    NotOpen(String),

    /// Default-port write with no session open at all
    #[error("no open serial port")]
    NoOpenPort,

    #[error("transmit failed: {0}")]
    Transmit(String),

    /// A flash job already owns the single job slot
    #[error("a flash job is already running")]
    FlashBusy,

    /// The flash tool could not be started or waited on
    #[error("failed to spawn {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    /// A blocking helper task panicked or was cancelled
    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    /// The reactor task has exited and can no longer take requests
    #[error("serial service is not running")]
    ServiceStopped,

    #[error("settings error: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for SessionError {
    fn from(e: serialport::Error) -> Self {
        SessionError::Io(std::io::Error::from(e))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Settings(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
