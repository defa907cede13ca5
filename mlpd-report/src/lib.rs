//! Offline decoder and report generator for the MLPD trace format (§4.J,
//! §6). Reads the same binary stream `profilerd::writer::WriterThread`
//! produces and turns it into aggregate text or JSON reports.

pub mod cli;
pub mod decoder;
pub mod error;
pub mod model;
pub mod report;

pub use decoder::{decode_trace, DecodedEvent, DecodedTrace};
pub use error::DecodeError;
