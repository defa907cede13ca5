//! Throughput micro-benchmark for the hot encode path: no sink I/O, no
//! writer/helper threads — just `on_method_enter`/`on_alloc`/
//! `on_method_leave` hammering a single thread's `LogBuffer` through
//! `ensure_capacity`'s overflow-chaining path. Plain `Instant`-based
//! timing rather than a criterion harness, matching the rest of this
//! crate's "no extra dependency for a one-off tool" posture.

use profilerd::config::Config;
use profilerd::encoders;
use profilerd::pipeline::Pipeline;
use std::time::Instant;

const METHOD: u64 = 0x4000;
const CLASS: u64 = 0x2000;

fn main() {
    env_logger::init();
    let iterations: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1_000_000);

    let pipeline = Pipeline::new(Config::default());
    encoders::on_method_jitted(&pipeline, METHOD, 0x100000, 0x80, "Bench::Method", true);

    let start = Instant::now();
    let mut obj = 0x200000u64;
    for _ in 0..iterations {
        encoders::on_method_enter(&pipeline, METHOD);
        encoders::on_alloc(&pipeline, obj, CLASS, 32, None);
        obj += 32;
        encoders::on_method_leave(&pipeline, METHOD);
    }
    let elapsed = start.elapsed();

    let encoded = pipeline
        .metrics
        .events_encoded_total
        .load(std::sync::atomic::Ordering::Relaxed);
    let drops = pipeline.metrics.drops.total();
    let per_event_ns = elapsed.as_nanos() as f64 / encoded.max(1) as f64;

    println!("iterations:     {iterations}");
    println!("events encoded: {encoded}");
    println!("events dropped: {drops}");
    println!("elapsed:        {elapsed:?}");
    println!("per-event:      {per_event_ns:.1} ns");
}
