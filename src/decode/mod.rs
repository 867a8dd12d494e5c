// src/decode/mod.rs
//
// Line decoders. Both observe the same framed line sequence; the fast-frame
// decoder claims lines while a frame is open, everything else falls through
// to the numeric row decoder.

pub mod fast_frame;
pub mod numeric;

pub use fast_frame::{FastFrameDecoder, FastFrameResult, FrameLine, FrameMode, FrameOutcome};
pub use numeric::{parse_numeric_row, split_fields};
