//! The writer thread (§4.G): the single consumer of the writer queue. Owns
//! the sink exclusively; emits JIT-method metadata before the payload
//! buffer that references it, enforcing the registry-before-reference
//! invariant (Testable Property #4).

use crate::buffer::LogBuffer;
use crate::pipeline::Pipeline;
use crate::producer::PendingMethod;
use crate::sink::Sink;
use crate::writer_queue::WriterQueueEntry;
use mlpd_common::header::{BufferFrameHeader, FileHeader};
use mlpd_common::tags::{TYPE_JIT, TYPE_METHOD};
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct WriterThread {
    pipeline: Arc<Pipeline>,
    sink: Box<dyn Sink>,
}

impl WriterThread {
    pub fn new(pipeline: Arc<Pipeline>, sink: Box<dyn Sink>) -> Self {
        WriterThread { pipeline, sink }
    }

    /// Writes the 32-byte file header once, before any buffer frame.
    /// Calibrates `timer_overhead_ns` by sampling the clock source
    /// back-to-back and taking the minimum observed delta, per §2b.
    pub fn write_file_header(&mut self) -> io::Result<()> {
        let startup_time_ms_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let timer_overhead_ns = measure_timer_overhead_ns();
        let pid = std::process::id();
        let port = self.pipeline.config.control.command_port.unwrap_or(0);
        let header = FileHeader::new(startup_time_ms_epoch, timer_overhead_ns, pid, port);
        self.sink.write_all(&header.to_le_bytes())?;
        self.sink.flush()
    }

    /// Writes `buf`'s chain oldest-first: recurses into `next` before
    /// writing the current frame, matching `dump_buffer`'s traversal order
    /// so a buffer produced by an earlier overflow reaches the sink before
    /// its successor.
    fn dump_buffer(&mut self, buf: &LogBuffer) -> io::Result<()> {
        if let Some(next) = buf.next() {
            self.dump_buffer(next)?;
        }
        let header = BufferFrameHeader::new(
            buf.payload().len() as u32,
            buf.time_base(),
            buf.ptr_base(),
            buf.obj_base(),
            buf.thread_id(),
            buf.method_base(),
        );
        self.sink.write_all(&header.to_le_bytes())?;
        self.sink.write_all(buf.payload())?;
        Ok(())
    }

    /// Builds a throwaway method buffer containing a full `TYPE_METHOD|JIT`
    /// record for every pending method not already in the registry.
    /// Returns `None` if every method was already published (nothing new
    /// to write), matching step 1 of §4.G.
    fn build_method_buffer(
        &self,
        methods: &[PendingMethod],
        thread_id: u64,
    ) -> Option<LogBuffer> {
        let mut method_buf = LogBuffer::new(&self.pipeline.arena, thread_id, 0)?;
        let mut any_new = false;
        for m in methods {
            if !self.pipeline.registry.publish(m.method) {
                continue;
            }
            any_new = true;
            let bytes_needed = 1 + 10 * 3 + m.jit.as_ref().map_or(1, |j| j.full_name.len() + 1);
            if !method_buf.ensure_capacity(bytes_needed, &self.pipeline.arena) {
                continue;
            }
            let Some(mut guard) = method_buf.try_enter() else {
                continue;
            };
            guard.emit_byte(TYPE_METHOD | TYPE_JIT);
            guard.emit_time(m.observed_time_ns);
            guard.emit_method(m.method);
            match &m.jit {
                Some(jit) => {
                    guard.emit_ptr(jit.code_start);
                    guard.emit_uleb(jit.code_size);
                    guard.emit_string(&jit.full_name);
                }
                None => {
                    guard.emit_ptr(0);
                    guard.emit_uleb(0);
                    guard.emit_string("");
                }
            }
        }
        if any_new {
            Some(method_buf)
        } else {
            None
        }
    }

    /// Processes one drained entry: method buffer first (if any new
    /// methods), then the payload buffer chain.
    pub fn process_entry(&mut self, entry: WriterQueueEntry) -> io::Result<()> {
        if let Some(method_buf) = self.build_method_buffer(&entry.methods, entry.buffer.thread_id()) {
            self.dump_buffer(&method_buf)?;
        }
        self.dump_buffer(&entry.buffer)
    }

    /// Runs until the queue is empty and shutdown has been requested.
    /// Fatal I/O errors are logged and stop the writer; producers continue
    /// to accumulate into TLS buffers until the process exits (§7 IOError).
    pub fn run(&mut self) {
        if let Err(e) = self.write_file_header() {
            log::error!("writer thread: failed to write file header: {e}");
            return;
        }
        loop {
            match self.pipeline.writer_queue.pop() {
                Some(entry) => {
                    if let Err(e) = self.process_entry(entry) {
                        log::error!("writer thread: sink I/O error, stopping: {e}");
                        return;
                    }
                }
                None => {
                    if self.pipeline.is_in_shutdown() && self.pipeline.writer_queue.is_empty() {
                        break;
                    }
                    self.pipeline
                        .writer_queue
                        .wait_for_entry(Duration::from_millis(200));
                }
            }
        }
        if let Err(e) = self.sink.flush() {
            log::warn!("writer thread: final flush failed: {e}");
        }
    }
}

fn measure_timer_overhead_ns() -> u32 {
    let mut min_delta = u64::MAX;
    for _ in 0..8 {
        let a = now_ns();
        let b = now_ns();
        min_delta = min_delta.min(b.saturating_sub(a));
    }
    min_delta.min(u32::MAX as u64) as u32
}

fn now_ns() -> u64 {
    nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::producer::JitInfo;
    use mlpd_common::header::BUF_ID;
    use std::io::Write;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    #[derive(Clone)]
    struct SharedVecSink(StdArc<StdMutex<Vec<u8>>>);

    impl Sink for SharedVecSink {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            Write::write_all(&mut *self.0.lock().unwrap(), bytes)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn file_header_is_written_once_at_start() {
        let pipeline = Pipeline::for_test(Config::default());
        let sink = SharedVecSink(StdArc::new(StdMutex::new(Vec::new())));
        let mut writer = WriterThread::new(pipeline, Box::new(sink));
        writer.write_file_header().unwrap();
    }

    #[test]
    fn method_metadata_is_written_before_the_payload_buffer() {
        let pipeline = Pipeline::for_test(Config::default());
        let mut payload = LogBuffer::new(&pipeline.arena, 1, 0).unwrap();
        payload.emit_time(5);
        let entry = WriterQueueEntry {
            methods: vec![PendingMethod {
                method: 0xA,
                jit: Some(JitInfo {
                    code_start: 0x4000,
                    code_size: 0x100,
                    full_name: "Foo::Bar".to_string(),
                }),
                observed_time_ns: 1,
            }],
            buffer: Box::new(payload),
        };
        let recorded = StdArc::new(StdMutex::new(Vec::new()));
        let mut writer = WriterThread::new(
            pipeline.clone(),
            Box::new(SharedVecSink(recorded.clone())),
        );
        writer.write_file_header().unwrap();
        writer.process_entry(entry).unwrap();

        // Verify two frames were emitted, in order: method frame first,
        // then the payload frame.
        let bytes = recorded.lock().unwrap();
        let mut header_bytes = [0u8; 48];
        header_bytes.copy_from_slice(&bytes[32..80]); // skip the 32-byte file header
        let first = BufferFrameHeader::from_le_bytes(header_bytes);
        assert_eq!(first.buf_id, BUF_ID);
        assert!(first.len > 0, "method buffer should carry the JIT record");
    }

    #[test]
    fn republishing_an_already_known_method_writes_no_method_buffer() {
        let pipeline = Pipeline::for_test(Config::default());
        pipeline.registry.publish(0xA);
        let sink = SharedVecSink(StdArc::new(StdMutex::new(Vec::new())));
        let writer = WriterThread::new(pipeline.clone(), Box::new(sink));
        let buf = writer.build_method_buffer(
            &[PendingMethod {
                method: 0xA,
                jit: None,
                observed_time_ns: 1,
            }],
            1,
        );
        assert!(buf.is_none());
    }
}
