//! Decoder error taxonomy (§7): `Malformed` is per-buffer and recoverable
//! — the reader logs it and moves to the next frame; `Fatal` is
//! header-level and aborts the whole decode. Mirrors the writer side's
//! split between silent `DropReason`s and the one propagating
//! `WriterIoError`.

use std::fmt;

#[derive(Debug)]
pub enum DecodeError {
    /// A single buffer frame had a bad tag byte or a truncated LEB128
    /// field. The frame is abandoned; decoding continues with the next
    /// frame header in the file.
    Malformed(String),
    /// Bad file magic or an unsupported data version. Nothing in the file
    /// can be trusted after this; decoding stops immediately.
    Fatal(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(msg) => write!(f, "malformed buffer: {msg}"),
            DecodeError::Fatal(msg) => write!(f, "fatal format error: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}
