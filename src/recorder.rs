// src/recorder.rs
//
// CSV recording of a session's raw stream.
// Each recording frames the raw chunks itself with its own end-of-line token
// and keeps fields as text (no numeric parsing).
//
// OldestFirst streams rows to the file as they arrive.
// NewestFirst keeps everything in memory and writes the file once, newest
// row first, when the recording stops.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::decode::split_fields;
use crate::error::Result;
use crate::io::serial::{separator_or_default, unescape_eol};
use crate::io::LineFramer;

// ============================================================================
// Options
// ============================================================================

/// Row order in the output file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrder {
    /// Arrival order, streamed to disk
    #[default]
    OldestFirst,
    /// Reverse arrival order, written on stop
    NewestFirst,
}

/// Optional leading time column
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    #[default]
    None,
    /// Milliseconds since the recording started (`time_ms`)
    Relative,
    /// UTC wall clock in ISO-8601 (`timestamp`)
    Absolute,
}

impl TimestampMode {
    fn column_name(self) -> Option<&'static str> {
        match self {
            TimestampMode::None => None,
            TimestampMode::Relative => Some("time_ms"),
            TimestampMode::Absolute => Some("timestamp"),
        }
    }
}

/// Parameters of a start-recording request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordingOptions {
    pub file_path: PathBuf,
    #[serde(default)]
    pub separator: String,
    #[serde(default)]
    pub eol: String,
    #[serde(default)]
    pub order: RecordOrder,
    #[serde(default)]
    pub add_header: bool,
    #[serde(default)]
    pub timestamp: TimestampMode,
}

impl RecordingOptions {
    /// OldestFirst, no header, no timestamp, default separator and EOL
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            separator: String::new(),
            eol: String::new(),
            order: RecordOrder::OldestFirst,
            add_header: false,
            timestamp: TimestampMode::None,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStartStatus {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "already recording")]
    AlreadyRecording,
}

impl fmt::Display for RecordStartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordStartStatus::Started => "started",
            RecordStartStatus::AlreadyRecording => "already recording",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStopStatus {
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "not recording")]
    NotRecording,
}

impl fmt::Display for RecordStopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordStopStatus::Stopped => "stopped",
            RecordStopStatus::NotRecording => "not recording",
        })
    }
}

// ============================================================================
// Recording
// ============================================================================

/// An in-progress CSV export for one port
pub struct CsvRecording {
    file_path: PathBuf,
    separator: String,
    order: RecordOrder,
    add_header: bool,
    timestamp: TimestampMode,
    framer: LineFramer,
    started: Instant,
    header_done: bool,
    /// NewestFirst only: encoded header held until finish
    held_header: Option<Vec<u8>>,
    /// NewestFirst only: encoded rows, newest at the front
    held_rows: VecDeque<Vec<u8>>,
    /// OldestFirst only
    writer: Option<csv::Writer<File>>,
    rows: usize,
}

impl CsvRecording {
    /// Begin a recording. OldestFirst creates (truncates) the file now.
    pub fn start(options: RecordingOptions) -> Result<Self> {
        let writer = match options.order {
            RecordOrder::OldestFirst => Some(csv_writer(File::create(&options.file_path)?)),
            RecordOrder::NewestFirst => None,
        };

        tlog!(
            "[recorder] Recording to {} ({:?}, header: {}, timestamp: {:?})",
            options.file_path.display(),
            options.order,
            options.add_header,
            options.timestamp
        );

        Ok(Self {
            file_path: options.file_path,
            separator: separator_or_default(&options.separator),
            order: options.order,
            add_header: options.add_header,
            timestamp: options.timestamp,
            framer: LineFramer::new(&unescape_eol(&options.eol)),
            started: Instant::now(),
            header_done: false,
            held_header: None,
            held_rows: VecDeque::new(),
            writer,
            rows: 0,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn order(&self) -> RecordOrder {
        self.order
    }

    /// Rows recorded so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Prime the framer with bytes that arrived before the recording started,
    /// so a line already in progress is recorded whole. Lines completed by
    /// `pending` itself predate the recording and are dropped.
    pub fn seed(&mut self, pending: &[u8]) {
        let dropped = self.framer.feed(pending);
        if !dropped.is_empty() {
            tlog!("[recorder] Dropped {} line(s) received before start", dropped.len());
        }
    }

    /// Frame a raw chunk and record every complete line.
    /// `labels` are the session's current channel labels, used for the header.
    pub fn ingest(&mut self, bytes: &[u8], labels: &[String]) -> Result<()> {
        for line in self.framer.feed(bytes) {
            self.record_line(&line.text, labels)?;
        }
        Ok(())
    }

    /// Record one already framed line. Lines without fields are skipped.
    pub fn record_line(&mut self, line: &str, labels: &[String]) -> Result<()> {
        let fields = split_fields(line, &self.separator);
        if fields.is_empty() {
            return Ok(());
        }

        if self.add_header && !self.header_done {
            let header = self.header_row(labels, fields.len());
            self.header_done = true;
            self.emit(header, true)?;
        }

        let mut row: Vec<String> = Vec::with_capacity(fields.len() + 1);
        match self.timestamp {
            TimestampMode::None => {}
            TimestampMode::Relative => row.push(self.started.elapsed().as_millis().to_string()),
            TimestampMode::Absolute => {
                row.push(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        }
        row.extend(fields.iter().map(|f| f.to_string()));
        self.emit(row, false)?;
        self.rows += 1;
        Ok(())
    }

    /// Known labels first, then `chN` for every field without one
    fn header_row(&self, labels: &[String], field_count: usize) -> Vec<String> {
        let mut header: Vec<String> = Vec::with_capacity(field_count.max(labels.len()) + 1);
        if let Some(name) = self.timestamp.column_name() {
            header.push(name.to_string());
        }
        header.extend(labels.iter().cloned());
        header.extend((labels.len() + 1..=field_count).map(|n| format!("ch{}", n)));
        header
    }

    fn emit(&mut self, record: Vec<String>, is_header: bool) -> Result<()> {
        match self.order {
            RecordOrder::OldestFirst => {
                if let Some(writer) = self.writer.as_mut() {
                    writer.write_record(&record)?;
                }
            }
            RecordOrder::NewestFirst => {
                let encoded = encode_record(&record)?;
                if is_header {
                    self.held_header = Some(encoded);
                } else {
                    self.held_rows.push_front(encoded);
                }
            }
        }
        Ok(())
    }

    /// Stop recording and finalize the file. Returns the number of rows.
    ///
    /// A trailing partial line still in the framer is not recorded.
    pub fn finish(mut self) -> Result<usize> {
        match self.order {
            RecordOrder::OldestFirst => {
                if let Some(mut writer) = self.writer.take() {
                    writer.flush()?;
                }
            }
            RecordOrder::NewestFirst => {
                let mut content = self.held_header.take().unwrap_or_default();
                for row in &self.held_rows {
                    content.extend_from_slice(row);
                }
                std::fs::write(&self.file_path, content)?;
            }
        }

        tlog!(
            "[recorder] Finished {} ({} rows)",
            self.file_path.display(),
            self.rows
        );
        Ok(self.rows)
    }
}

/// Comma delimited, `\n` terminated, rows of any width
fn csv_writer<W: Write>(inner: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(inner)
}

/// One record as CSV bytes, terminator included
fn encode_record(record: &[String]) -> Result<Vec<u8>> {
    let mut writer = csv_writer(Vec::new());
    writer.write_record(record)?;
    writer.into_inner().map_err(|e| e.into_error().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir, order: RecordOrder) -> RecordingOptions {
        RecordingOptions {
            order,
            ..RecordingOptions::new(dir.path().join("out.csv"))
        }
    }

    #[test]
    fn test_oldest_first_streams_in_order() {
        let dir = TempDir::new().unwrap();
        let mut rec = CsvRecording::start(options(&dir, RecordOrder::OldestFirst)).unwrap();
        rec.ingest(b"1:A\n2:B\n3:", &[]).unwrap();
        rec.ingest(b"C\n", &[]).unwrap();
        let path = rec.file_path().to_path_buf();
        assert_eq!(rec.finish().unwrap(), 3);

        assert_eq!(std::fs::read_to_string(path).unwrap(), "1,A\n2,B\n3,C\n");
    }

    #[test]
    fn test_newest_first_reverses_and_holds_header() {
        let dir = TempDir::new().unwrap();
        let opts = RecordingOptions {
            add_header: true,
            ..options(&dir, RecordOrder::NewestFirst)
        };
        let path = opts.file_path.clone();
        let mut rec = CsvRecording::start(opts).unwrap();
        rec.ingest(b"A\nB\nC\n", &[]).unwrap();

        // Nothing touches the disk before stop
        assert!(!path.exists());
        rec.finish().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "ch1\nC\nB\nA\n");
    }

    #[test]
    fn test_header_uses_labels_and_timestamp_column() {
        let dir = TempDir::new().unwrap();
        let opts = RecordingOptions {
            add_header: true,
            timestamp: TimestampMode::Relative,
            ..options(&dir, RecordOrder::OldestFirst)
        };
        let path = opts.file_path.clone();
        let mut rec = CsvRecording::start(opts).unwrap();
        let labels = vec!["volts".to_string(), "amps".to_string()];
        rec.record_line("1:2", &labels).unwrap();
        rec.record_line("3:4", &labels).unwrap();
        rec.finish().unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "time_ms,volts,amps");
        let first: Vec<&str> = lines[1].split(',').collect();
        assert!(first[0].parse::<u128>().is_ok());
        assert_eq!(&first[1..], ["1", "2"]);
    }

    #[test]
    fn test_absolute_timestamp_is_iso() {
        let dir = TempDir::new().unwrap();
        let opts = RecordingOptions {
            add_header: true,
            timestamp: TimestampMode::Absolute,
            ..options(&dir, RecordOrder::OldestFirst)
        };
        let path = opts.file_path.clone();
        let mut rec = CsvRecording::start(opts).unwrap();
        rec.record_line("5", &[]).unwrap();
        rec.finish().unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("timestamp,ch1"));
        let row = lines.next().unwrap();
        let (stamp, value) = row.split_once(',').unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert_eq!(value, "5");
    }

    #[test]
    fn test_custom_eol_and_separator_and_blank_lines() {
        let dir = TempDir::new().unwrap();
        let opts = RecordingOptions {
            separator: ";".into(),
            eol: "\\r\\n".into(),
            ..options(&dir, RecordOrder::OldestFirst)
        };
        let path = opts.file_path.clone();
        let mut rec = CsvRecording::start(opts).unwrap();
        rec.ingest(b"1;2\r\n\r\n ;; \r\nx,y;3\r\n", &[]).unwrap();
        assert_eq!(rec.rows(), 2);
        rec.finish().unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "1,2\n\"x,y\",3\n");
    }

    #[test]
    fn test_header_pads_missing_labels() {
        let dir = TempDir::new().unwrap();
        let opts = RecordingOptions {
            add_header: true,
            ..options(&dir, RecordOrder::OldestFirst)
        };
        let path = opts.file_path.clone();
        let mut rec = CsvRecording::start(opts).unwrap();
        rec.record_line("1:2:3", &["a".to_string()]).unwrap();
        rec.finish().unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "a,ch2,ch3\n1,2,3\n");
    }

    #[test]
    fn test_newest_first_quotes_fields() {
        let dir = TempDir::new().unwrap();
        let opts = RecordingOptions {
            add_header: true,
            ..options(&dir, RecordOrder::NewestFirst)
        };
        let path = opts.file_path.clone();
        let mut rec = CsvRecording::start(opts).unwrap();
        let labels = vec!["say \"hi\"".to_string()];
        rec.ingest(b"1:a,b\n2\n", &labels).unwrap();
        rec.finish().unwrap();

        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "\"say \"\"hi\"\"\",ch2\n2\n1,\"a,b\"\n"
        );
    }

    #[test]
    fn test_seed_completes_line_in_progress() {
        let dir = TempDir::new().unwrap();
        let mut rec = CsvRecording::start(options(&dir, RecordOrder::OldestFirst)).unwrap();
        rec.seed(b"0:0\n12:3");
        rec.ingest(b"4\n5:6\n", &[]).unwrap();
        let path = rec.file_path().to_path_buf();
        assert_eq!(rec.finish().unwrap(), 2);

        assert_eq!(std::fs::read_to_string(path).unwrap(), "12,34\n5,6\n");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(RecordStartStatus::AlreadyRecording.to_string(), "already recording");
        assert_eq!(
            serde_json::to_string(&RecordStopStatus::NotRecording).unwrap(),
            "\"not recording\""
        );
    }
}
