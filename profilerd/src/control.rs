//! The helper thread (§4.E, §5): drains the stat-sample ring, funnels
//! drained samples through the ordinary encoder path on its own buffer,
//! and polls the optional loopback command socket for `heapshot`/`quit`
//! lines. Everything here runs on a single dedicated OS thread, never on
//! a producer thread.

use crate::encoders;
use crate::pipeline::Pipeline;
use crate::producer;
use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Commands accepted on the loopback control socket, one per line, no
/// framing beyond a newline (§5 "deliberately tiny — no HTTP, no JSON").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Request an on-demand heap walk. Only meaningful when
    /// `HeapShotConfig::Ondemand` is active; otherwise ignored by the
    /// caller wiring this into the embedding host's GC callback.
    HeapShot,
    Quit,
}

impl ControlCommand {
    fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "heapshot" => Some(ControlCommand::HeapShot),
            "quit" => Some(ControlCommand::Quit),
            _ => None,
        }
    }
}

/// Drives the poll loop. `on_command` is invoked on the helper thread for
/// every recognized command read off the control socket; the caller wires
/// `HeapShot` to its GC heap-walk entry point and may ignore `Quit` (the
/// loop already calls `pipeline.begin_shutdown()` for it).
pub struct HelperThread {
    pipeline: Arc<Pipeline>,
    listener: Option<TcpListener>,
}

impl HelperThread {
    pub fn new(pipeline: Arc<Pipeline>) -> std::io::Result<Self> {
        let listener = match pipeline.config.control.command_port {
            Some(port) => {
                let listener = TcpListener::bind(("127.0.0.1", port))?;
                listener.set_nonblocking(true)?;
                Some(listener)
            }
            None => None,
        };
        Ok(HelperThread { pipeline, listener })
    }

    /// Runs until `pipeline.begin_shutdown()` has been observed and the
    /// ring has been drained one final time. Intended to be spawned as its
    /// own thread by the embedding host alongside the writer thread.
    pub fn run(&mut self, on_command: impl Fn(ControlCommand) + Send + Sync) {
        loop {
            self.drain_and_encode();
            self.pipeline.sample_ring.ensure_spare();
            self.poll_commands(&on_command);

            if self.pipeline.is_in_shutdown() {
                // Final drain after shutdown was observed, so any sample
                // recorded right before the flag flipped still reaches
                // the trace.
                self.drain_and_encode();
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Lifts every completed page off the sample ring and emits a
    /// `TYPE_SAMPLE_HIT` record for each sample through the helper
    /// thread's own thread-local buffer.
    fn drain_and_encode(&self) {
        let drained = self.pipeline.sample_ring.drain_old_pages();
        if drained.is_empty() {
            return;
        }
        producer::with_thread_state(&self.pipeline.arena, |buf, _pending| {
            for sample in &drained {
                encoders::encode_drained_sample(
                    &self.pipeline,
                    buf,
                    sample.kind,
                    sample.thread_id,
                    sample.elapsed_10us,
                    sample.ip,
                    &sample.frames,
                );
            }
        });
        producer::safe_send(&self.pipeline);
    }

    fn poll_commands(&mut self, on_command: &(impl Fn(ControlCommand) + Send + Sync)) {
        let Some(listener) = &self.listener else {
            return;
        };
        match listener.accept() {
            Ok((stream, _addr)) => self.handle_connection(stream, on_command),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("control socket accept failed: {e}"),
        }
    }

    fn handle_connection(&self, stream: TcpStream, on_command: &(impl Fn(ControlCommand) + Send + Sync)) {
        if stream.set_nonblocking(false).is_err() {
            return;
        }
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() {
            return;
        }
        let Some(cmd) = ControlCommand::parse(&line) else {
            log::debug!("control socket: ignoring unrecognized command {line:?}");
            return;
        };
        if cmd == ControlCommand::Quit {
            self.pipeline.begin_shutdown();
        }
        on_command(cmd);
    }
}

/// A shared flag the embedding host can poll/set to hand shutdown
/// coordination to an external signal handler (e.g. SIGINT) instead of
/// only the control socket's `quit` command.
pub fn install_shutdown_flag(pipeline: Arc<Pipeline>) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let watcher_flag = flag.clone();
    std::thread::spawn(move || loop {
        if watcher_flag.load(Ordering::Acquire) {
            pipeline.begin_shutdown();
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    });
    flag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mlpd_common::SampleFrame;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn command_parsing_recognizes_heapshot_and_quit_and_rejects_garbage() {
        assert_eq!(ControlCommand::parse("heapshot\n"), Some(ControlCommand::HeapShot));
        assert_eq!(ControlCommand::parse("quit"), Some(ControlCommand::Quit));
        assert_eq!(ControlCommand::parse("frobnicate"), None);
    }

    #[test]
    fn drain_and_encode_is_a_noop_on_an_empty_ring() {
        let pipeline = Pipeline::for_test(Config::default());
        let helper = HelperThread {
            pipeline: pipeline.clone(),
            listener: None,
        };
        helper.drain_and_encode();
        let len = producer::with_thread_state(&pipeline.arena, |buf, _| buf.payload().len());
        assert_eq!(len, Some(0));
    }

    #[test]
    fn drain_and_encode_flushes_samples_lifted_from_the_ring() {
        let pipeline = Pipeline::for_test(Config::default());
        let frame = SampleFrame {
            method: 0xAB,
            domain: 0,
            base_addr: 0,
            native_offset: 0,
        };
        // Fill and overflow the head page so drain_old_pages finds work.
        for i in 0..513u64 {
            pipeline.sample_ring.record_sample(7, 1, i, 0xDEAD, &[frame]);
        }
        let helper = HelperThread {
            pipeline: pipeline.clone(),
            listener: None,
        };
        helper.drain_and_encode();
        let hits = pipeline
            .metrics
            .sample_hits_total
            .load(std::sync::atomic::Ordering::Relaxed);
        assert!(hits > 0);
    }

    #[test]
    fn command_socket_quit_begins_shutdown() {
        let mut cfg = Config::default();
        cfg.control.command_port = Some(0);
        let pipeline = Pipeline::for_test(cfg);
        let mut helper = HelperThread::new(pipeline.clone()).unwrap();
        let port = helper.listener.as_ref().unwrap().local_addr().unwrap().port();

        let client = std::thread::spawn(move || {
            // Give the acceptor a moment to be polled.
            std::thread::sleep(Duration::from_millis(20));
            let mut stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"quit\n").unwrap();
        });
        // Poll a few times since accept() is nonblocking.
        for _ in 0..20 {
            helper.poll_commands(&|_| {});
            if pipeline.is_in_shutdown() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        client.join().unwrap();
        assert!(pipeline.is_in_shutdown());
    }
}
