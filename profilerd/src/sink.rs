//! Writer output backends (§2b, §3 "Sink"): plain file, named pipe, or a
//! gzip-wrapped file, selected by `SinkConfig`. Modeled as a trait object
//! the writer thread owns exclusively.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub trait Sink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

pub struct FileSink {
    inner: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(FileSink {
            inner: BufWriter::new(file),
        })
    }
}

impl Sink for FileSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A named-pipe (FIFO) sink. The pipe itself must already exist (created
/// via `mkfifo` by the embedding host, outside this crate's scope per
/// §1's "thin wrappers" exclusion); this just opens it for writing.
pub struct PipeSink {
    inner: BufWriter<File>,
}

impl PipeSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(PipeSink {
            inner: BufWriter::new(file),
        })
    }
}

impl Sink for PipeSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Gzip-wrapped file sink. Per the Open Questions decision in §9, the
/// entire file — including the 32-byte file header — is written through
/// the gzip stream; there is no plaintext preamble.
pub struct GzipSink {
    inner: GzEncoder<File>,
}

impl GzipSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(GzipSink {
            inner: GzEncoder::new(file, Compression::default()),
        })
    }
}

impl Sink for GzipSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Builds the configured sink from `SinkConfig`.
pub fn open_configured_sink(config: &crate::config::SinkConfig) -> io::Result<Box<dyn Sink>> {
    let path = Path::new(&config.path);
    if config.use_gzip {
        Ok(Box::new(GzipSink::create(path)?))
    } else if config.use_pipe {
        Ok(Box::new(PipeSink::open(path)?))
    } else {
        Ok(Box::new(FileSink::create(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn file_sink_writes_bytes_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.mlpd");
        {
            let mut sink = FileSink::create(&path).unwrap();
            sink.write_all(b"hello").unwrap();
            sink.flush().unwrap();
        }
        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello");
    }

    #[test]
    fn gzip_sink_produces_a_valid_gzip_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.mlpd.gz");
        {
            let mut sink = GzipSink::create(&path).unwrap();
            sink.write_all(b"payload").unwrap();
            sink.flush().unwrap();
        }
        let file = File::open(&path).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "payload");
    }
}
