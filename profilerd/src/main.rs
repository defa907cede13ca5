//! `profilerd-demo`: a self-contained harness that drives a synthetic
//! probe sequence through the full pipeline (encoders → writer queue →
//! writer thread → sink) and the stat-sample ring through the helper
//! thread, producing a real `.mlpd` trace file end to end. Embedding
//! hosts wire their own runtime's probe callsites to the functions in
//! [`profilerd::encoders`] instead of this synthetic driver.

use anyhow::{Context, Result};
use clap::Parser;
use profilerd::config::Config;
use profilerd::control::HelperThread;
use profilerd::encoders::{self, MetadataKind};
use profilerd::pipeline::Pipeline;
use profilerd::sink;
use profilerd::writer::WriterThread;
use profilerd::{encoders::CoverageKind, producer};
use mlpd_common::tags::{ClauseKind, GcHandleKind, MonitorOp};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "profilerd-demo", about = "Drives a synthetic MLPD trace end to end")]
struct Args {
    /// Overrides the configured sink path for this run.
    #[arg(long)]
    out: Option<String>,

    /// Number of synthetic method-call iterations to emit.
    #[arg(long, default_value_t = 1000)]
    events: u64,

    /// Enables the stat-sampling ring for this run regardless of config.
    #[arg(long)]
    sample: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load();
    if let Some(out) = &args.out {
        config.sink.path = out.clone();
    }
    if args.sample {
        config.sampling.enabled = true;
    }

    let pipeline = Pipeline::new(config);
    let sink = sink::open_configured_sink(&pipeline.config.sink)
        .with_context(|| format!("opening sink at {}", pipeline.config.sink.path))?;

    let writer_pipeline = pipeline.clone();
    let writer_handle = std::thread::spawn(move || {
        let mut writer = WriterThread::new(writer_pipeline, sink);
        writer.run();
    });

    let helper_pipeline = pipeline.clone();
    let helper_handle = std::thread::spawn(move || {
        let mut helper = match HelperThread::new(helper_pipeline) {
            Ok(h) => h,
            Err(e) => {
                log::error!("helper thread: failed to bind control socket: {e}");
                return;
            }
        };
        helper.run(|cmd| log::info!("control command received: {cmd:?}"));
    });

    let ctrlc_pipeline = pipeline.clone();
    ctrlc::set_handler(move || {
        log::info!("received interrupt, beginning shutdown");
        ctrlc_pipeline.begin_shutdown();
    })
    .context("installing SIGINT handler")?;

    run_synthetic_workload(&pipeline, args.events);

    pipeline.begin_shutdown();
    writer_handle.join().expect("writer thread panicked");
    helper_handle.join().expect("helper thread panicked");

    let encoded = pipeline
        .metrics
        .events_encoded_total
        .load(std::sync::atomic::Ordering::Relaxed);
    log::info!("profilerd-demo: encoded {encoded} events, wrote to {}", pipeline.config.sink.path);
    Ok(())
}

/// Drives a plausible probe sequence: image/assembly/class loads, JIT
/// registration, method enter/leave pairs with allocations inside them,
/// a GC cycle, a monitor acquisition, and a handled exception. Mirrors
/// the shape of a real managed-runtime startup without needing one.
fn run_synthetic_workload(pipeline: &Arc<Pipeline>, iterations: u64) {
    const THREAD_ID: u64 = 1;
    const IMAGE: u64 = 0x1000;
    const ASSEMBLY: u64 = 0x1010;
    const CLASS_A: u64 = 0x2000;
    const CLASS_B: u64 = 0x2040;
    const METHOD_MAIN: u64 = 0x4000;
    const METHOD_HELPER: u64 = 0x4100;
    const DOMAIN: u64 = 0x8000;

    encoders::on_thread_start(pipeline, THREAD_ID);
    encoders::on_thread_name(pipeline, THREAD_ID, "main");
    encoders::on_metadata_loaded(pipeline, MetadataKind::Domain, DOMAIN, "AppDomain", true);
    encoders::on_metadata_loaded(pipeline, MetadataKind::Image, IMAGE, "App.dll", true);
    encoders::on_metadata_loaded(pipeline, MetadataKind::Assembly, ASSEMBLY, "App", true);
    encoders::on_metadata_loaded(pipeline, MetadataKind::Class, CLASS_A, "App.Worker", true);
    encoders::on_metadata_loaded(pipeline, MetadataKind::Class, CLASS_B, "App.Buffer", true);

    encoders::on_method_jitted(pipeline, METHOD_MAIN, 0x100000, 0x80, "App.Worker::Main", true);
    encoders::on_method_jitted(pipeline, METHOD_HELPER, 0x100100, 0x40, "App.Worker::Helper", true);
    encoders::on_coverage(pipeline, CoverageKind::Method, METHOD_MAIN, Some("App.Worker::Main"));

    let mut obj_cursor: u64 = 0x200000;
    for i in 0..iterations {
        encoders::on_method_enter(pipeline, METHOD_MAIN);
        encoders::on_method_enter(pipeline, METHOD_HELPER);

        encoders::on_alloc(pipeline, obj_cursor, CLASS_B, 64, None);
        obj_cursor += 64;

        if i % 97 == 0 {
            encoders::on_monitor(pipeline, obj_cursor, MonitorOp::Contention, None);
            encoders::on_monitor(pipeline, obj_cursor, MonitorOp::Done, None);
        }

        if i % 211 == 0 {
            encoders::on_throw(pipeline, obj_cursor, None);
            encoders::on_clause(pipeline, METHOD_HELPER, 0, ClauseKind::Catch);
        }

        encoders::on_method_leave(pipeline, METHOD_HELPER);
        encoders::on_method_leave(pipeline, METHOD_MAIN);

        if i % 500 == 0 && i > 0 {
            encoders::on_gc_event(pipeline, 0, 0);
            encoders::on_gc_handle_created(pipeline, GcHandleKind::Weak, 0xF000 + i, obj_cursor, None);
            encoders::on_gc_event(pipeline, 1, 0);
            producer::safe_send(pipeline);
        }
    }

    encoders::on_thread_end(pipeline, THREAD_ID);
    // Give the helper/writer threads a moment to drain before shutdown is
    // requested by the caller, so the demo's own run doesn't race its own
    // final flush.
    std::thread::sleep(Duration::from_millis(50));
}
