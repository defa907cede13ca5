//! Error taxonomy for the writer pipeline. Only genuinely fatal,
//! operator-visible conditions are routed through `anyhow`; the
//! always-recoverable `DropEvent`/shutdown conditions are plain enums that
//! never propagate to a probe caller, per the error-handling design.

use std::fmt;

/// Reasons an encoder silently drops an event rather than emitting it.
/// Never surfaced to the probe caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The buffer arena could not map a fresh page.
    AllocFailed,
    /// The encoder found its own buffer's reentrancy guard already held.
    Reentrant,
    /// The runtime has not finished initializing; only safe-point dispatch
    /// is deferred, not the accumulation itself.
    RuntimeNotInit,
    /// `call_depth` exceeded `max_call_depth`.
    DepthLimited,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::AllocFailed => "arena allocation failed",
            DropReason::Reentrant => "encoder reentrancy guard held",
            DropReason::RuntimeNotInit => "runtime not yet initialized",
            DropReason::DepthLimited => "call depth limit reached",
        };
        f.write_str(s)
    }
}

/// Fatal, writer-thread-side I/O failure. The writer detaches and stops
/// consuming; producers are unaffected and keep accumulating into TLS
/// buffers until shutdown.
#[derive(Debug)]
pub struct WriterIoError {
    pub source: std::io::Error,
}

impl fmt::Display for WriterIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writer sink I/O error: {}", self.source)
    }
}

impl std::error::Error for WriterIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<std::io::Error> for WriterIoError {
    fn from(source: std::io::Error) -> Self {
        WriterIoError { source }
    }
}
