//! Shared wire-format types for the MLPD binary profiling trace: LEB128
//! codec, event tag taxonomy, and the fixed-size POD headers/slots both the
//! writer pipeline (`profilerd`) and the decoder (`mlpd-report`) build on.

pub mod header;
pub mod leb128;
pub mod sample;
pub mod tags;

pub use header::{BufferFrameHeader, FileHeader, BUF_ID, LOG_HEADER_ID};
pub use leb128::{decode_sleb128, decode_uleb128, encode_sleb128, encode_uleb128, Leb128Error};
pub use sample::{SampleFrame, SampleKind, SampleSlot, MAX_SAMPLE_FRAMES};
