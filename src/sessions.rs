// src/sessions.rs
//
// Session registry.
// One `Session` per open port path: its reader thread, line framer, decoders
// and buffers. Recordings are kept next to the sessions and keyed the same way.
// The registry is owned by the service reactor; nothing here is global.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::buffer_store::{BufferStats, SessionBuffers, DEFAULT_ROW_CAPACITY, DEFAULT_TERMINAL_CAPACITY};
use crate::decode::{parse_numeric_row, FastFrameDecoder, FastFrameResult};
use crate::error::{Result, SessionError};
use crate::io::serial::{separator_or_default, unescape_eol};
use crate::io::{now_us, LineFramer, PendingTransmit, PortEventSender, SerialLink, SerialReader, SerialTransport, StreamEndReason};
use crate::recorder::{CsvRecording, RecordStartStatus, RecordStopStatus, RecordingOptions};

// ============================================================================
// Types
// ============================================================================

/// Parameters of an open request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortOptions {
    pub baud_rate: u32,
    /// Field separator; empty means `":"`
    #[serde(default)]
    pub separator: String,
    /// End-of-line token, escaped form accepted (`"\\r\\n"`); empty means `"\n"`
    #[serde(default)]
    pub eol: String,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            separator: String::new(),
            eol: String::new(),
        }
    }
}

/// Result of an open request. Opening twice is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenOutcome {
    Opened,
    AlreadyOpen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "not open")]
    NotOpen,
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseStatus::Closed => "closed",
            CloseStatus::NotOpen => "not open",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteStatus {
    #[serde(rename = "written")]
    Written,
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("written")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushStatus {
    #[serde(rename = "flushed")]
    Flushed,
}

impl fmt::Display for FlushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("flushed")
    }
}

/// Snapshot of an open session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub path: String,
    pub baud_rate: u32,
    pub separator: String,
    /// Unescaped end-of-line token
    pub eol: String,
    pub opened_at_us: u64,
    pub recording: bool,
    pub buffers: BufferStats,
}

/// Buffer capacities applied to new sessions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLimits {
    pub rows: usize,
    pub terminal_lines: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROW_CAPACITY,
            terminal_lines: DEFAULT_TERMINAL_CAPACITY,
        }
    }
}

/// A queued write on a specific port
pub struct PendingWrite {
    path: String,
    pending: PendingTransmit,
}

impl PendingWrite {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Block until the reader thread reports the write outcome
    pub fn wait(self) -> Result<WriteStatus> {
        self.pending
            .wait()
            .map(|_| WriteStatus::Written)
            .map_err(SessionError::Transmit)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Live state of one open port
struct Session {
    baud_rate: u32,
    separator: String,
    eol: String,
    opened_at_us: u64,
    framer: LineFramer,
    fast_frame: FastFrameDecoder,
    buffers: SessionBuffers,
    reader: SerialReader,
}

impl Session {
    /// Frame a chunk and run the decoders over every completed line.
    /// Returns the fast frames completed by this chunk.
    fn ingest(&mut self, bytes: &[u8]) -> Vec<FastFrameResult> {
        let mut completed = Vec::new();
        for line in self.framer.feed(bytes) {
            let text = line.text;
            if !text.is_empty() {
                self.buffers.push_terminal_line(text.clone());
            }

            let outcome = self.fast_frame.process_line(&text);
            if let Some(frame) = outcome.completed {
                self.buffers.set_fast_frame(frame.clone());
                completed.push(frame);
            }
            if !outcome.consumed {
                self.buffers.push_row(parse_numeric_row(&text, &self.separator));
            }
        }
        completed
    }
}

// ============================================================================
// Session Manager
// ============================================================================

pub struct SessionManager {
    transport: Arc<dyn SerialTransport>,
    port_tx: PortEventSender,
    limits: BufferLimits,
    /// Ordered so that the default-port write target is stable
    sessions: BTreeMap<String, Session>,
    recordings: HashMap<String, CsvRecording>,
    next_generation: u64,
}

impl SessionManager {
    /// `port_tx` receives every reader's chunks and end notices
    pub fn new(transport: Arc<dyn SerialTransport>, port_tx: PortEventSender, limits: BufferLimits) -> Self {
        Self {
            transport,
            port_tx,
            limits,
            sessions: BTreeMap::new(),
            recordings: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn transport(&self) -> &Arc<dyn SerialTransport> {
        &self.transport
    }

    /// Open `path` and start streaming. Must be called within a tokio runtime.
    ///
    /// The device is opened on the calling thread; the service opens it on a
    /// blocking thread instead and hands the link to [`Self::attach`].
    pub fn open(&mut self, path: &str, options: &PortOptions) -> Result<OpenOutcome> {
        if self.sessions.contains_key(path) {
            tlog!("[session] Port {} already open, ignoring open request", path);
            return Ok(OpenOutcome::AlreadyOpen);
        }
        let link = open_link(self.transport.as_ref(), path, options.baud_rate)?;
        Ok(self.attach(path, options, link))
    }

    /// Start a session on an already opened device. If `path` gained a
    /// session in the meantime the link is dropped and nothing changes.
    pub fn attach(&mut self, path: &str, options: &PortOptions, link: Box<dyn SerialLink>) -> OpenOutcome {
        if self.sessions.contains_key(path) {
            tlog!("[session] Port {} already open, ignoring open request", path);
            return OpenOutcome::AlreadyOpen;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let eol = unescape_eol(&options.eol);
        let separator = separator_or_default(&options.separator);
        let reader = SerialReader::start(path.to_string(), generation, link, self.port_tx.clone());

        self.sessions.insert(
            path.to_string(),
            Session {
                baud_rate: options.baud_rate,
                framer: LineFramer::new(&eol),
                separator,
                eol,
                opened_at_us: now_us(),
                fast_frame: FastFrameDecoder::new(),
                buffers: SessionBuffers::new(self.limits.rows, self.limits.terminal_lines),
                reader,
            },
        );

        tlog!(
            "[session] Opened {} at {} baud (generation {})",
            path,
            options.baud_rate,
            generation
        );
        OpenOutcome::Opened
    }

    /// Close `path`, finalizing any recording on it, and wait for the reader
    /// thread to release the device.
    pub async fn close(&mut self, path: &str) -> CloseStatus {
        let Some(mut session) = self.sessions.remove(path) else {
            return CloseStatus::NotOpen;
        };
        self.finish_recording(path);
        session.reader.stop().await;
        tlog!("[session] Closed {}", path);
        CloseStatus::Closed
    }

    /// Close every session
    pub async fn close_all(&mut self) {
        let paths: Vec<String> = self.sessions.keys().cloned().collect();
        for path in paths {
            self.close(&path).await;
        }
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.sessions.contains_key(path)
    }

    pub fn open_paths(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn session_info(&self, path: &str) -> Option<SessionInfo> {
        self.sessions.get(path).map(|s| SessionInfo {
            path: path.to_string(),
            baud_rate: s.baud_rate,
            separator: s.separator.clone(),
            eol: s.eol.clone(),
            opened_at_us: s.opened_at_us,
            recording: self.recordings.contains_key(path),
            buffers: s.buffers.stats(),
        })
    }

    /// Queue `data` for `path`, or for any open port when `path` is `None`
    pub fn write(&self, path: Option<&str>, data: &[u8]) -> Result<PendingWrite> {
        let (path, session) = match path {
            Some(p) => self
                .sessions
                .get_key_value(p)
                .ok_or_else(|| SessionError::NotOpen(p.to_string()))?,
            None => self.sessions.iter().next().ok_or(SessionError::NoOpenPort)?,
        };

        let pending = session
            .reader
            .queue_transmit(data)
            .map_err(SessionError::Transmit)?;
        Ok(PendingWrite {
            path: path.clone(),
            pending,
        })
    }

    /// Feed a chunk from a reader. Chunks from a stale reader generation are
    /// dropped. Returns the fast frames completed by this chunk.
    pub fn ingest(&mut self, path: &str, generation: u64, bytes: &[u8]) -> Vec<FastFrameResult> {
        let Some(session) = self.sessions.get_mut(path) else {
            return Vec::new();
        };
        if session.reader.generation() != generation {
            return Vec::new();
        }

        if let Some(recording) = self.recordings.get_mut(path) {
            if let Err(e) = recording.ingest(bytes, session.buffers.headers()) {
                tlog!("[recorder] Write to {} failed: {}", recording.file_path().display(), e);
                if let Some(recording) = self.recordings.remove(path) {
                    finalize_recording(recording);
                }
            }
        }

        session.ingest(bytes)
    }

    /// A reader stopped on its own. Purges the session if it is still the
    /// current one for `path`; returns whether anything was purged.
    pub async fn handle_reader_ended(&mut self, path: &str, generation: u64, reason: &StreamEndReason) -> bool {
        match self.sessions.get(path) {
            Some(s) if s.reader.generation() == generation => {}
            _ => return false,
        }
        tlog!("[session] Port {} ended ({}), purging session", path, reason);
        self.close(path).await;
        true
    }

    // ------------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------------

    /// Latest decoded row, empty when none or not open
    pub fn latest_row(&self, path: &str) -> Vec<f64> {
        self.sessions
            .get(path)
            .map(|s| s.buffers.latest_row())
            .unwrap_or_default()
    }

    pub fn fast_frame(&self, path: &str) -> FastFrameResult {
        self.sessions
            .get(path)
            .map(|s| s.buffers.fast_frame())
            .unwrap_or_default()
    }

    pub fn terminal_lines(&self, path: &str, max: usize) -> Vec<String> {
        self.sessions
            .get(path)
            .map(|s| s.buffers.terminal_lines(max))
            .unwrap_or_default()
    }

    pub fn headers(&self, path: &str) -> Vec<String> {
        self.sessions
            .get(path)
            .map(|s| s.buffers.headers().to_vec())
            .unwrap_or_default()
    }

    pub fn set_headers(&mut self, path: &str, headers: Vec<String>) -> Result<()> {
        self.session_mut(path)?.buffers.set_headers(headers);
        Ok(())
    }

    pub fn colors(&self, path: &str) -> Vec<String> {
        self.sessions
            .get(path)
            .map(|s| s.buffers.colors().to_vec())
            .unwrap_or_default()
    }

    pub fn set_colors(&mut self, path: &str, colors: Vec<String>) -> Result<()> {
        self.session_mut(path)?.buffers.set_colors(colors);
        Ok(())
    }

    /// Clear rolling state for `path` without closing it. Always succeeds.
    pub fn flush_buffers(&mut self, path: &str) -> FlushStatus {
        if let Some(session) = self.sessions.get_mut(path) {
            session.buffers.flush();
            session.fast_frame.reset();
        }
        FlushStatus::Flushed
    }

    fn session_mut(&mut self, path: &str) -> Result<&mut Session> {
        self.sessions
            .get_mut(path)
            .ok_or_else(|| SessionError::NotOpen(path.to_string()))
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    pub fn start_recording(&mut self, path: &str, options: RecordingOptions) -> Result<RecordStartStatus> {
        if !self.sessions.contains_key(path) {
            return Err(SessionError::NotOpen(path.to_string()));
        }
        if self.recordings.contains_key(path) {
            tlog!("[recorder] {} already recording", path);
            return Ok(RecordStartStatus::AlreadyRecording);
        }
        let mut recording = CsvRecording::start(options)?;
        if let Some(session) = self.sessions.get(path) {
            recording.seed(session.framer.pending_bytes());
        }
        self.recordings.insert(path.to_string(), recording);
        Ok(RecordStartStatus::Started)
    }

    pub fn stop_recording(&mut self, path: &str) -> Result<RecordStopStatus> {
        match self.recordings.remove(path) {
            Some(recording) => {
                recording.finish()?;
                Ok(RecordStopStatus::Stopped)
            }
            None => Ok(RecordStopStatus::NotRecording),
        }
    }

    pub fn is_recording(&self, path: &str) -> bool {
        self.recordings.contains_key(path)
    }

    /// Finalize a recording when its source goes away; errors are only logged
    fn finish_recording(&mut self, path: &str) {
        if let Some(recording) = self.recordings.remove(path) {
            finalize_recording(recording);
        }
    }
}

/// Open a device, logging the failure
pub fn open_link(transport: &dyn SerialTransport, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>> {
    transport.open(path, baud_rate).map_err(|e| {
        tlog!("[session] Failed to open {}: {}", path, e);
        e
    })
}

fn finalize_recording(recording: CsvRecording) {
    let file = recording.file_path().to_path_buf();
    if let Err(e) = recording.finish() {
        tlog!("[recorder] Failed to finalize {}: {}", file.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::{MockDevice, MockTransport};
    use crate::io::PortEvent;
    use crate::recorder::RecordOrder;
    use tokio::sync::mpsc;

    const PORT: &str = "/dev/mock0";

    fn manager() -> (SessionManager, MockTransport, mpsc::UnboundedReceiver<PortEvent>) {
        let transport = MockTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(Arc::new(transport.clone()), tx, BufferLimits::default());
        (manager, transport, rx)
    }

    /// Push bytes through the device and pump reader events into the manager
    /// until `expected` bytes have been ingested.
    async fn pump(
        manager: &mut SessionManager,
        rx: &mut mpsc::UnboundedReceiver<PortEvent>,
        device: &MockDevice,
        bytes: &[u8],
    ) -> Vec<FastFrameResult> {
        device.push(bytes);
        let mut seen = 0;
        let mut frames = Vec::new();
        while seen < bytes.len() {
            match rx.recv().await.unwrap() {
                PortEvent::Data { path, generation, bytes } => {
                    seen += bytes.len();
                    frames.extend(manager.ingest(&path, generation, &bytes));
                }
                PortEvent::Ended { reason, .. } => panic!("reader ended: {}", reason),
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_open_twice_is_noop() {
        let (mut manager, transport, _rx) = manager();
        transport.add_device(PORT);

        let opts = PortOptions::default();
        assert_eq!(manager.open(PORT, &opts).unwrap(), OpenOutcome::Opened);
        assert_eq!(manager.open(PORT, &opts).unwrap(), OpenOutcome::AlreadyOpen);
        assert_eq!(transport.opens().len(), 1);
        assert!(manager.is_open(PORT));

        assert_eq!(manager.close(PORT).await, CloseStatus::Closed);
        assert_eq!(manager.close(PORT).await, CloseStatus::NotOpen);
        assert!(!manager.is_open(PORT));
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let (mut manager, _transport, _rx) = manager();
        let err = manager.open("/dev/none", &PortOptions::default()).unwrap_err();
        assert!(matches!(err, SessionError::PortUnavailable { .. }));
        assert!(!manager.is_open("/dev/none"));
    }

    #[tokio::test]
    async fn test_numeric_rows_and_terminal() {
        let (mut manager, transport, mut rx) = manager();
        let device = transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();

        pump(&mut manager, &mut rx, &device, b"1:2:x:3\nhello\n4:").await;
        assert_eq!(manager.latest_row(PORT), vec![1.0, 2.0, 3.0]);
        pump(&mut manager, &mut rx, &device, b"5\n").await;
        assert_eq!(manager.latest_row(PORT), vec![4.0, 5.0]);
        assert_eq!(manager.terminal_lines(PORT, 200), vec!["1:2:x:3", "hello", "4:5"]);

        assert_eq!(manager.flush_buffers(PORT), FlushStatus::Flushed);
        assert!(manager.latest_row(PORT).is_empty());
        assert!(manager.terminal_lines(PORT, 200).is_empty());
        assert!(manager.is_open(PORT));
    }

    #[tokio::test]
    async fn test_custom_separator_and_escaped_eol() {
        let (mut manager, transport, mut rx) = manager();
        let device = transport.add_device(PORT);
        let opts = PortOptions {
            baud_rate: 9600,
            separator: ",".into(),
            eol: "\\r\\n".into(),
        };
        manager.open(PORT, &opts).unwrap();
        assert_eq!(transport.opens(), vec![(PORT.to_string(), 9600)]);

        pump(&mut manager, &mut rx, &device, b"7,8\r").await;
        assert!(manager.latest_row(PORT).is_empty());
        pump(&mut manager, &mut rx, &device, b"\n").await;
        assert_eq!(manager.latest_row(PORT), vec![7.0, 8.0]);
        assert_eq!(manager.session_info(PORT).unwrap().eol, "\r\n");
    }

    #[tokio::test]
    async fn test_fast_frame_suppresses_numeric_rows() {
        let (mut manager, transport, mut rx) = manager();
        let device = transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();

        pump(&mut manager, &mut rx, &device, b"9:9\n").await;
        let frames = pump(
            &mut manager,
            &mut rx,
            &device,
            b"begin record\n#a,b,\n3f800000 40000000\n40400000 40800000\nend record\n",
        )
        .await;

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].columns, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        assert_eq!(manager.fast_frame(PORT), frames[0]);
        assert_eq!(manager.headers(PORT), vec!["a", "b"]);
        // Numeric decoder never saw the frame lines
        assert_eq!(manager.latest_row(PORT), vec![9.0, 9.0]);
    }

    #[tokio::test]
    async fn test_write_targets() {
        let (mut manager, transport, _rx) = manager();
        assert!(matches!(manager.write(None, b"x"), Err(SessionError::NoOpenPort)));
        assert!(matches!(manager.write(Some(PORT), b"x"), Err(SessionError::NotOpen(_))));

        let device = transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();

        let pending = manager.write(None, b"ping\n").unwrap();
        assert_eq!(pending.path(), PORT);
        assert_eq!(pending.wait().unwrap(), WriteStatus::Written);
        manager.write(Some(PORT), b"pong\n").unwrap().wait().unwrap();
        assert_eq!(device.written(), b"ping\npong\n");

        manager.close(PORT).await;
    }

    #[tokio::test]
    async fn test_headers_colors_need_open_port() {
        let (mut manager, transport, _rx) = manager();
        assert!(manager.set_headers(PORT, vec!["a".into()]).is_err());
        assert!(manager.headers(PORT).is_empty());

        transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();
        manager.set_headers(PORT, vec!["a".into()]).unwrap();
        manager.set_colors(PORT, vec!["red".into()]).unwrap();
        assert_eq!(manager.headers(PORT), vec!["a"]);
        assert_eq!(manager.colors(PORT), vec!["red"]);

        manager.close(PORT).await;
        manager.open(PORT, &PortOptions::default()).unwrap();
        assert!(manager.headers(PORT).is_empty());
        assert!(manager.colors(PORT).is_empty());
    }

    #[tokio::test]
    async fn test_recording_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("rec.csv");
        let (mut manager, transport, mut rx) = manager();
        let device = transport.add_device(PORT);

        let opts = RecordingOptions::new(&file);
        assert!(matches!(
            manager.start_recording(PORT, opts.clone()),
            Err(SessionError::NotOpen(_))
        ));

        manager.open(PORT, &PortOptions::default()).unwrap();
        assert_eq!(manager.start_recording(PORT, opts.clone()).unwrap(), RecordStartStatus::Started);
        assert_eq!(
            manager.start_recording(PORT, opts).unwrap(),
            RecordStartStatus::AlreadyRecording
        );
        assert!(manager.session_info(PORT).unwrap().recording);

        pump(&mut manager, &mut rx, &device, b"1:2\n3:4\n").await;
        assert_eq!(manager.stop_recording(PORT).unwrap(), RecordStopStatus::Stopped);
        assert_eq!(manager.stop_recording(PORT).unwrap(), RecordStopStatus::NotRecording);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "1,2\n3,4\n");
    }

    #[tokio::test]
    async fn test_close_finalizes_recording() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("rec.csv");
        let (mut manager, transport, mut rx) = manager();
        let device = transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();

        let opts = RecordingOptions {
            order: RecordOrder::NewestFirst,
            ..RecordingOptions::new(&file)
        };
        manager.start_recording(PORT, opts).unwrap();
        pump(&mut manager, &mut rx, &device, b"A\nB\n").await;

        manager.close(PORT).await;
        assert!(!manager.is_recording(PORT));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "B\nA\n");
    }

    #[tokio::test]
    async fn test_recording_started_mid_line_records_whole_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("rec.csv");
        let (mut manager, transport, mut rx) = manager();
        let device = transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();

        pump(&mut manager, &mut rx, &device, b"9:9\n12:3").await;
        manager.start_recording(PORT, RecordingOptions::new(&file)).unwrap();
        pump(&mut manager, &mut rx, &device, b"4\n5:6\n").await;
        manager.stop_recording(PORT).unwrap();

        assert_eq!(manager.latest_row(PORT), vec![5.0, 6.0]);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "12,34\n5,6\n");
    }

    #[tokio::test]
    async fn test_attach_after_open_drops_link() {
        let (mut manager, transport, _rx) = manager();
        transport.add_device(PORT);
        let opts = PortOptions::default();

        let link = open_link(&transport, PORT, opts.baud_rate).unwrap();
        assert_eq!(manager.open(PORT, &opts).unwrap(), OpenOutcome::Opened);
        assert_eq!(manager.attach(PORT, &opts, link), OpenOutcome::AlreadyOpen);
        assert_eq!(manager.open_paths(), vec![PORT.to_string()]);
        manager.close(PORT).await;
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let (mut manager, transport, _rx) = manager();
        transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();
        let old = 1;
        manager.close(PORT).await;
        manager.open(PORT, &PortOptions::default()).unwrap();

        manager.ingest(PORT, old, b"1:2\n");
        assert!(manager.latest_row(PORT).is_empty());
        assert!(!manager.handle_reader_ended(PORT, old, &StreamEndReason::Disconnected).await);
        assert!(manager.is_open(PORT));

        manager.ingest(PORT, 2, b"1:2\n");
        assert_eq!(manager.latest_row(PORT), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_disconnect_purges_session() {
        let (mut manager, transport, mut rx) = manager();
        let device = transport.add_device(PORT);
        manager.open(PORT, &PortOptions::default()).unwrap();
        device.disconnect();

        match rx.recv().await.unwrap() {
            PortEvent::Ended { path, generation, reason } => {
                assert!(manager.handle_reader_ended(&path, generation, &reason).await);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!manager.is_open(PORT));
    }
}
