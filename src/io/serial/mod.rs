// src/io/serial/mod.rs
//
// Serial port driver with end-of-line framing.
//
// Features:
// - Line framing with a configurable, escape-aware end-of-line token
// - Per-port blocking reader thread feeding the session reactor
// - Bidirectional communication (read + transmit)

pub mod framer;
pub mod reader;
pub mod utils;

pub use framer::{LineFramer, SerialLine};
pub use reader::{PendingTransmit, SerialReader};
pub use utils::{separator_or_default, unescape_eol, DEFAULT_EOL, DEFAULT_SEPARATOR};
