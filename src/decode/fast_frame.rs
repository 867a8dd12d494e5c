// src/decode/fast_frame.rs
//
// Fast-frame block decoder.
//
// A frame is bounded by the literal markers `begin record` and `end record`.
// Inside a frame:
//   #h1,h2,,      first `#` line: comma separated column labels
//   #17           second `#` line: device ring-buffer write index
//   3f800000 ...  whitespace separated big-endian f32 values as 8 hex digits
//
// Column count is `labels - 1`: the device emits a trailing separator on the
// label line and that empty field is not a column.

use serde::{Deserialize, Serialize};

use super::numeric::parse_int_prefix;

pub const BEGIN_MARKER: &str = "begin record";
pub const END_MARKER: &str = "end record";

/// A completed frame: one value sequence per column, all of equal length
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FastFrameResult {
    pub headers: Vec<String>,
    #[serde(rename = "data")]
    pub columns: Vec<Vec<f32>>,
}

impl FastFrameResult {
    /// The result reported before any frame has completed
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }
}

/// Decoder mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameMode {
    Idle,
    Recording,
}

/// Where a marker sits on a line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sentinel<'a> {
    /// `begin record`, with whatever followed it on the line
    Begin { trailing: &'a str },
    /// `end record`, with whatever preceded it on the line
    End { leading: &'a str },
}

/// Classification of a line seen while a frame is open
#[derive(Clone, Debug, PartialEq)]
pub enum FrameLine<'a> {
    Sentinel(Sentinel<'a>),
    HeaderLine(Vec<String>),
    IndexLine(Option<i64>),
    DataTokens(Vec<f32>),
    Blank,
}

/// Find a frame marker on `line`, if any.
/// When both markers appear the earlier one wins.
pub fn find_sentinel(line: &str) -> Option<Sentinel<'_>> {
    let begin = line.find(BEGIN_MARKER);
    let end = line.find(END_MARKER);
    match (begin, end) {
        (Some(b), Some(e)) if e < b => Some(Sentinel::End { leading: &line[..e] }),
        (Some(b), _) => Some(Sentinel::Begin {
            trailing: &line[b + BEGIN_MARKER.len()..],
        }),
        (None, Some(e)) => Some(Sentinel::End { leading: &line[..e] }),
        (None, None) => None,
    }
}

/// Classify one line of frame content.
///
/// `labels_known` decides whether a `#` line carries labels or the rotation
/// index. Pure: no decoder state is touched.
pub fn classify_line(line: &str, labels_known: bool) -> FrameLine<'_> {
    if let Some(sentinel) = find_sentinel(line) {
        return FrameLine::Sentinel(sentinel);
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return FrameLine::Blank;
    }

    if let Some(meta) = trimmed.strip_prefix('#') {
        if labels_known {
            return FrameLine::IndexLine(parse_int_prefix(meta));
        }
        return FrameLine::HeaderLine(meta.split(',').map(|s| s.trim().to_string()).collect());
    }

    FrameLine::DataTokens(trimmed.split_whitespace().filter_map(decode_hex_f32).collect())
}

/// Decode an 8-hex-digit big-endian IEEE-754 single.
/// Anything else yields `None`.
pub fn decode_hex_f32(token: &str) -> Option<f32> {
    let mut bytes = [0u8; 4];
    hex::decode_to_slice(token, &mut bytes).ok()?;
    Some(f32::from_be_bytes(bytes))
}

/// Per-session fast-frame state machine
#[derive(Debug)]
pub struct FastFrameDecoder {
    mode: FrameMode,
    labels: Option<Vec<String>>,
    rotation_index: Option<i64>,
    raw: Vec<f32>,
}

impl Default for FastFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// What the decoder did with one line
#[derive(Debug, Default, PartialEq)]
pub struct FrameOutcome {
    /// The line belonged to the fast-frame protocol; other decoders skip it
    pub consumed: bool,
    /// A frame finished on this line
    pub completed: Option<FastFrameResult>,
}

impl FastFrameDecoder {
    pub fn new() -> Self {
        Self {
            mode: FrameMode::Idle,
            labels: None,
            rotation_index: None,
            raw: Vec::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Values accumulated for the frame in progress
    pub fn pending_values(&self) -> usize {
        self.raw.len()
    }

    /// Drop any partial frame and return to Idle
    pub fn reset(&mut self) {
        self.mode = FrameMode::Idle;
        self.clear_frame();
    }

    fn clear_frame(&mut self) {
        self.labels = None;
        self.rotation_index = None;
        self.raw.clear();
    }

    /// Feed one framed line
    pub fn process_line(&mut self, line: &str) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        self.step(line, &mut outcome);
        outcome
    }

    fn step(&mut self, line: &str, outcome: &mut FrameOutcome) {
        match self.mode {
            FrameMode::Idle => {
                if let Some(Sentinel::Begin { trailing }) = find_sentinel(line) {
                    outcome.consumed = true;
                    self.begin_frame();
                    if !trailing.trim().is_empty() {
                        self.step(trailing, outcome);
                    }
                }
            }
            FrameMode::Recording => {
                outcome.consumed = true;
                match classify_line(line, self.labels.is_some()) {
                    FrameLine::Sentinel(Sentinel::Begin { trailing }) => {
                        tlog!(
                            "[fast-frame] Frame restarted, discarding {} values",
                            self.raw.len()
                        );
                        self.begin_frame();
                        if !trailing.trim().is_empty() {
                            self.step(trailing, outcome);
                        }
                    }
                    FrameLine::Sentinel(Sentinel::End { leading }) => {
                        if !leading.trim().is_empty() {
                            self.step(leading, outcome);
                        }
                        outcome.completed = Some(self.finish_frame());
                    }
                    FrameLine::HeaderLine(labels) => self.labels = Some(labels),
                    FrameLine::IndexLine(index) => {
                        if self.rotation_index.is_none() {
                            self.rotation_index = index;
                        }
                    }
                    FrameLine::DataTokens(values) => self.raw.extend(values),
                    FrameLine::Blank => {}
                }
            }
        }
    }

    fn begin_frame(&mut self) {
        self.clear_frame();
        self.mode = FrameMode::Recording;
    }

    fn finish_frame(&mut self) -> FastFrameResult {
        let labels = self.labels.take().unwrap_or_default();
        let raw = std::mem::take(&mut self.raw);
        let rotation = self.rotation_index.take();
        self.mode = FrameMode::Idle;

        let result = reshape_frame(labels, &raw, rotation);
        tlog!(
            "[fast-frame] Frame complete: {} columns x {} rows",
            result.column_count(),
            result.row_count()
        );
        result
    }
}

/// Reshape row-major `raw` values into columns and undo the device's ring
/// buffer offset. Remainder values that do not fill a row are dropped.
pub fn reshape_frame(labels: Vec<String>, raw: &[f32], rotation: Option<i64>) -> FastFrameResult {
    let column_count = labels.len().saturating_sub(1);
    if column_count == 0 {
        return FastFrameResult::empty();
    }

    let row_count = raw.len() / column_count;
    let mut columns: Vec<Vec<f32>> = (0..column_count)
        .map(|c| (0..row_count).map(|r| raw[r * column_count + c]).collect())
        .collect();

    if let Some(index) = rotation {
        if row_count > 0 {
            let shift = (index + 1).rem_euclid(row_count as i64) as usize;
            for column in &mut columns {
                column.rotate_left(shift);
            }
        }
    }

    let mut headers = labels;
    headers.truncate(column_count);
    FastFrameResult { headers, columns }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_token(v: f32) -> String {
        hex::encode(v.to_be_bytes())
    }

    fn encode_rows(rows: &[Vec<f32>]) -> Vec<String> {
        rows.iter()
            .map(|row| row.iter().map(|v| hex_token(*v)).collect::<Vec<_>>().join(" "))
            .collect()
    }

    fn feed_all(decoder: &mut FastFrameDecoder, lines: &[String]) -> Option<FastFrameResult> {
        let mut last = None;
        for line in lines {
            let outcome = decoder.process_line(line);
            assert!(outcome.consumed, "line not consumed: {:?}", line);
            if outcome.completed.is_some() {
                last = outcome.completed;
            }
        }
        last
    }

    #[test]
    fn test_decode_hex_f32() {
        assert_eq!(decode_hex_f32("3f800000"), Some(1.0));
        assert_eq!(decode_hex_f32("C0490FDB"), Some(-std::f32::consts::PI));
        assert_eq!(decode_hex_f32("3f8000"), None);
        assert_eq!(decode_hex_f32("3f80000000"), None);
        assert_eq!(decode_hex_f32("zz800000"), None);
    }

    #[test]
    fn test_classify_line() {
        assert_eq!(
            classify_line("#a, b,", false),
            FrameLine::HeaderLine(vec!["a".into(), "b".into(), "".into()])
        );
        assert_eq!(classify_line("# 12 ", true), FrameLine::IndexLine(Some(12)));
        assert_eq!(classify_line("#oops", true), FrameLine::IndexLine(None));
        assert_eq!(classify_line("#7 of 64", true), FrameLine::IndexLine(Some(7)));
        assert_eq!(classify_line("   ", true), FrameLine::Blank);
        assert_eq!(
            classify_line("3f800000 bad 40000000", true),
            FrameLine::DataTokens(vec![1.0, 2.0])
        );
        assert_eq!(
            classify_line("xx end record", true),
            FrameLine::Sentinel(Sentinel::End { leading: "xx " })
        );
    }

    #[test]
    fn test_round_trip_with_rotation() {
        // 4 rows x 3 columns; labels "h1,h2,," give three columns
        let rows: Vec<Vec<f32>> = (0..4)
            .map(|r| (0..3).map(|c| (r * 10 + c) as f32).collect())
            .collect();

        let mut lines = vec!["begin record".to_string(), "#h1,h2,,".to_string(), "#2".to_string()];
        lines.extend(encode_rows(&rows));
        lines.push("end record".to_string());

        let mut decoder = FastFrameDecoder::new();
        let result = feed_all(&mut decoder, &lines).unwrap();

        assert_eq!(result.headers, vec!["h1", "h2", ""]);
        assert_eq!(result.column_count(), 3);
        assert_eq!(result.row_count(), 4);

        // Rotated left by (2 + 1) mod 4 = 3
        for c in 0..3 {
            let mut expected: Vec<f32> = rows.iter().map(|row| row[c]).collect();
            expected.rotate_left(3);
            assert_eq!(result.columns[c], expected);
        }
        assert_eq!(decoder.mode(), FrameMode::Idle);
    }

    #[test]
    fn test_without_index_keeps_order() {
        let mut lines = vec!["begin record".to_string(), "#x,y,".to_string()];
        lines.extend(encode_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]));
        lines.push("end record".to_string());

        let result = feed_all(&mut FastFrameDecoder::new(), &lines).unwrap();
        assert_eq!(result.headers, vec!["x", "y"]);
        assert_eq!(result.columns, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn test_markers_share_lines_with_content() {
        let one = hex_token(1.0);
        let two = hex_token(2.0);
        let three = hex_token(3.0);
        let lines = vec![
            "begin record #a,".to_string(),
            one,
            format!("{} {} end record", two, three),
        ];

        let result = feed_all(&mut FastFrameDecoder::new(), &lines).unwrap();
        assert_eq!(result.headers, vec!["a"]);
        assert_eq!(result.columns, vec![vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_remainder_values_dropped() {
        let mut lines = vec!["begin record".to_string(), "#a,b,".to_string()];
        lines.extend(encode_rows(&[vec![1.0, 2.0, 3.0]]));
        lines.push("end record".to_string());

        let result = feed_all(&mut FastFrameDecoder::new(), &lines).unwrap();
        assert_eq!(result.columns, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_no_labels_yields_empty_result() {
        let lines = vec![
            "begin record".to_string(),
            hex_token(1.0),
            "end record".to_string(),
        ];
        let result = feed_all(&mut FastFrameDecoder::new(), &lines).unwrap();
        assert_eq!(result, FastFrameResult::empty());
    }

    #[test]
    fn test_idle_lines_fall_through() {
        let mut decoder = FastFrameDecoder::new();
        assert_eq!(decoder.process_line("1:2:3"), FrameOutcome::default());
        assert_eq!(decoder.process_line("end record"), FrameOutcome::default());
        assert!(decoder.process_line("begin record").consumed);
        assert!(decoder.process_line("1:2:3").consumed);
    }

    #[test]
    fn test_second_begin_restarts_frame() {
        let mut decoder = FastFrameDecoder::new();
        decoder.process_line("begin record");
        decoder.process_line("#a,");
        decoder.process_line(&hex_token(9.0));
        assert_eq!(decoder.pending_values(), 1);

        decoder.process_line("begin record");
        assert_eq!(decoder.pending_values(), 0);
        decoder.process_line("#b,");
        decoder.process_line(&hex_token(5.0));
        let result = decoder.process_line("end record").completed.unwrap();
        assert_eq!(result.headers, vec!["b"]);
        assert_eq!(result.columns, vec![vec![5.0]]);
    }

    #[test]
    fn test_negative_index_wraps() {
        let result = reshape_frame(
            vec!["a".into(), "".into()],
            &[0.0, 1.0, 2.0],
            Some(-2),
        );
        // (-2 + 1) mod 3 = 2
        assert_eq!(result.columns, vec![vec![2.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_serializes_with_data_key() {
        let json = serde_json::to_value(FastFrameResult::empty()).unwrap();
        assert_eq!(json, serde_json::json!({"headers": [], "data": []}));
    }
}
