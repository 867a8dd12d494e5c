// src/lib.rs
//
// Serial session core: port sessions, line framing, numeric and fast-frame
// decoding, rolling buffers, CSV recording and firmware flashing.

#[macro_use]
pub mod logging;

pub mod buffer_store;
pub mod decode;
pub mod error;
pub mod flasher;
pub mod io;
pub mod recorder;
pub mod service;
pub mod sessions;
pub mod settings;

pub use buffer_store::{RollingBuffer, SessionBuffers};
pub use decode::{parse_numeric_row, FastFrameDecoder, FastFrameResult};
pub use error::{Result, SessionError};
pub use flasher::{FlashConfig, FlashOrchestrator, FlashOutcome, FlashRequest, FlashStep};
pub use io::{LineFramer, PortInfo, SerialTransport, SystemTransport};
pub use recorder::{CsvRecording, RecordOrder, RecordStartStatus, RecordStopStatus, RecordingOptions, TimestampMode};
pub use service::{FirmwarePicker, SerialService, SerialServiceHandle, ServiceEvent};
pub use sessions::{CloseStatus, FlushStatus, OpenOutcome, PortOptions, SessionManager, WriteStatus};
pub use settings::Settings;

#[cfg(feature = "dialog")]
pub use service::DialogPicker;
