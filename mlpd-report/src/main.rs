//! `mlpd-report`: offline CLI that decodes an `.mlpd` trace and renders
//! aggregate reports (§6 "CLI surface"). The writer side (`profilerd`)
//! has no CLI of its own; this binary is the only argv surface in this
//! workspace.

use clap::Parser;
use mlpd_report::cli::{Args, FindQuery};
use mlpd_report::decoder::{decode_trace, DecodedEvent, DecodedTrace};
use mlpd_report::report::{render_json, render_text, ReportOptions};
use std::io::{Read, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("mlpd-report: {err}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let input = match args.require_input() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("mlpd-report: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    let reports = match validate_args(args) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("mlpd-report: {e}");
            return Ok(ExitCode::from(1));
        }
    };

    let bytes = read_input(input)?;
    let mut trace = match decode_trace(&bytes) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("mlpd-report: {e}");
            return Ok(ExitCode::from(1));
        }
    };

    for w in &trace.warnings {
        log::warn!("frame {}: {}", w.frame_index, w.message);
    }

    apply_filters(args, &mut trace)?;

    let opts = ReportOptions {
        reports,
        method_sort: args.method_sort()?,
        alloc_sort: args.alloc_sort()?,
        max_frames: args.maxframes,
    };

    let rendered = if args.json {
        serde_json::to_string_pretty(&render_json(&trace, &opts))?
    } else {
        let mut out = String::new();
        if args.traces {
            out.push_str(&dump_events(&trace));
        }
        out.push_str(&render_text(&trace, &opts));
        out
    };

    write_output(args, &rendered)?;
    Ok(ExitCode::SUCCESS)
}

/// Validates sort keys, report names, and the track/find/time filter
/// expressions before doing any decode work, so argument typos fail fast
/// with exit code 1 (§6).
fn validate_args(args: &Args) -> Result<Vec<mlpd_report::report::ReportKind>, Box<dyn std::error::Error>> {
    let reports = args.report_kinds()?;
    args.method_sort()?;
    args.alloc_sort()?;
    args.track_addrs()?;
    args.find_query()?;
    args.time_window()?;
    Ok(reports)
}

fn read_input(path: &str) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    if path == "-" {
        std::io::stdin().read_to_end(&mut raw)?;
    } else {
        std::fs::File::open(path)?.read_to_end(&mut raw)?;
    }
    // Gzip streams start with the magic bytes 0x1f 0x8b (§9: the whole
    // file, header included, is gzipped when `use_zip` was set).
    if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&raw[..]).read_to_end(&mut decoded)?;
        Ok(decoded)
    } else {
        Ok(raw)
    }
}

fn write_output(args: &Args, rendered: &str) -> std::io::Result<()> {
    match &args.out {
        Some(path) => std::fs::write(path, rendered),
        None => std::io::stdout().write_all(rendered.as_bytes()),
    }
}

/// Narrows `trace.events` in place to those matching `--thread`, `--time`,
/// `--track`, and `--find`, applied as a conjunction (§6). An empty trace
/// after filtering is not an error: it is reported as zero events.
fn apply_filters(args: &Args, trace: &mut DecodedTrace) -> Result<(), Box<dyn std::error::Error>> {
    let thread = args.thread;
    let window = args.time_window()?;
    let track = args.track_addrs()?;
    let find = args.find_query()?;

    if thread.is_none() && window.is_none() && track.is_empty() && find.is_none() {
        return Ok(());
    }

    let base_time = trace.events.first().map(|e| e.time_ns()).unwrap_or(0);
    trace.events.retain(|event| {
        if let Some(tid) = thread {
            if event.thread_id() != tid {
                return false;
            }
        }
        if let Some(w) = window {
            let rel = event.time_ns().saturating_sub(base_time);
            if rel < w.from_ns || rel > w.to_ns {
                return false;
            }
        }
        if !track.is_empty() && !event_addrs(event).iter().any(|a| track.contains(a)) {
            return false;
        }
        if let Some(q) = &find {
            if !matches_find(event, q, &trace.tables) {
                return false;
            }
        }
        true
    });
    Ok(())
}

/// Every address a `--track` query might match: object/class/method
/// pointers and code ranges, depending on the event kind.
fn event_addrs(event: &DecodedEvent) -> Vec<u64> {
    match event {
        DecodedEvent::Alloc { obj, class, .. } => vec![*obj, *class],
        DecodedEvent::GcHandleCreated { handle, obj, .. } => vec![*handle, *obj],
        DecodedEvent::GcHandleDestroyed { handle, .. } => vec![*handle],
        DecodedEvent::HeapObject { obj, class, refs, .. } => {
            let mut addrs = vec![*obj, *class];
            addrs.extend(refs.iter().map(|(_, r)| *r));
            addrs
        }
        DecodedEvent::HeapRoot { obj, .. } => vec![*obj],
        DecodedEvent::MetadataLoad { id, .. } | DecodedEvent::MetadataUnload { id, .. } | DecodedEvent::MetadataName { id, .. } => vec![*id],
        DecodedEvent::MethodEnter { method, .. } | DecodedEvent::MethodLeave { method, .. } => vec![*method],
        DecodedEvent::MethodJit { method, code_start, .. } => vec![*method, *code_start],
        DecodedEvent::JitHelper { code_start, .. } => vec![*code_start],
        DecodedEvent::Throw { obj, .. } => vec![*obj],
        DecodedEvent::Clause { method, .. } => vec![*method],
        DecodedEvent::Monitor { obj, .. } => vec![*obj],
        DecodedEvent::Coverage { id, .. } => vec![*id],
        DecodedEvent::SampleHit { ip, frames, .. } => {
            let mut addrs = vec![*ip];
            addrs.extend(frames.iter().map(|f| f.method));
            addrs
        }
        DecodedEvent::GcEvent { .. } | DecodedEvent::GcResize { .. } | DecodedEvent::GcMove { .. } | DecodedEvent::HeapStart { .. } | DecodedEvent::HeapEnd { .. } => Vec::new(),
    }
}

fn matches_find(event: &DecodedEvent, query: &FindQuery, tables: &mlpd_report::decoder::Tables) -> bool {
    match query {
        FindQuery::Size(size) => matches!(event, DecodedEvent::Alloc { size: s, .. } if s == size)
            || matches!(event, DecodedEvent::HeapObject { size: s, .. } if s == size),
        FindQuery::Name(needle) => {
            let needle = needle.to_lowercase();
            let names: Vec<String> = match event {
                DecodedEvent::Alloc { class, .. } => vec![tables.class_name(*class)],
                DecodedEvent::MethodEnter { method, .. } | DecodedEvent::MethodLeave { method, .. } | DecodedEvent::Clause { method, .. } => {
                    vec![tables.method_name(*method)]
                }
                DecodedEvent::MethodJit { name, .. } | DecodedEvent::JitHelper { name, .. } | DecodedEvent::Coverage { name, .. } => vec![name.clone()],
                DecodedEvent::MetadataLoad { name, .. } | DecodedEvent::MetadataUnload { name, .. } | DecodedEvent::MetadataName { name, .. } => vec![name.clone()],
                DecodedEvent::HeapObject { class, .. } => vec![tables.class_name(*class)],
                DecodedEvent::SampleHit { frames, .. } => frames.iter().map(|f| tables.method_name(f.method)).collect(),
                _ => Vec::new(),
            };
            names.iter().any(|n| n.to_lowercase().contains(&needle))
        }
    }
}

fn dump_events(trace: &DecodedTrace) -> String {
    let mut out = String::new();
    for event in &trace.events {
        out.push_str(&format!("{event:?}\n"));
    }
    out.push('\n');
    out
}
