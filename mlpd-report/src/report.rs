//! Text and JSON rendering of the aggregates in [`crate::model`], gated by
//! `--reports=R1[,R2…]` (§6). Text output goes through `colored` the way
//! the rest of this pack's CLIs color warnings/highlights; `--json` emits
//! the same data as `serde_json`-serializable structs for scripting.

use crate::decoder::{DecodedEvent, DecodedTrace};
use crate::model::{AllocSort, AllocSummary, CallGraphSummary, GcStats, HeapShotSummary, MethodSort, MonitorStats, SampleAttribution};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Header,
    Jit,
    Gc,
    Sample,
    Alloc,
    Call,
    Metadata,
    Exception,
    Monitor,
    Thread,
    HeapShot,
}

impl ReportKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "header" => Some(Self::Header),
            "jit" => Some(Self::Jit),
            "gc" => Some(Self::Gc),
            "sample" => Some(Self::Sample),
            "alloc" => Some(Self::Alloc),
            "call" => Some(Self::Call),
            "metadata" => Some(Self::Metadata),
            "exception" => Some(Self::Exception),
            "monitor" => Some(Self::Monitor),
            "thread" => Some(Self::Thread),
            "heapshot" => Some(Self::HeapShot),
            _ => None,
        }
    }

    pub fn all() -> &'static [ReportKind] {
        &[
            Self::Header,
            Self::Jit,
            Self::Gc,
            Self::Sample,
            Self::Alloc,
            Self::Call,
            Self::Metadata,
            Self::Exception,
            Self::Monitor,
            Self::Thread,
            Self::HeapShot,
        ]
    }
}

pub struct ReportOptions {
    pub reports: Vec<ReportKind>,
    pub method_sort: MethodSort,
    pub alloc_sort: AllocSort,
    pub max_frames: usize,
}

impl Default for ReportOptions {
    fn default() -> Self {
        ReportOptions {
            reports: ReportKind::all().to_vec(),
            method_sort: MethodSort::Total,
            alloc_sort: AllocSort::Bytes,
            max_frames: 32,
        }
    }
}

#[derive(Serialize)]
pub struct JsonReport {
    pub file_version: String,
    pub pid: u32,
    pub event_count: usize,
    pub warning_count: usize,
    pub alloc: Option<JsonAlloc>,
    pub gc: Option<GcStats>,
    pub monitor: Option<MonitorStats>,
    pub heap_shots: Option<Vec<HeapShotJson>>,
    pub jit_count: Option<usize>,
    pub metadata_count: Option<usize>,
    pub exception_count: Option<usize>,
    pub thread_count: Option<usize>,
}

#[derive(Serialize)]
pub struct JsonAlloc {
    pub total_count: u64,
    pub total_bytes: u64,
    pub top_classes: Vec<(String, u64, u64)>,
}

#[derive(Serialize)]
pub struct HeapShotJson {
    pub object_count: u64,
    pub total_bytes: u64,
    pub root_count: u64,
    pub dangling_roots: usize,
}

impl serde::Serialize for GcStats {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("GcStats", 5)?;
        st.serialize_field("collections", &self.collections)?;
        st.serialize_field("resizes", &self.resizes)?;
        st.serialize_field("moved_objects", &self.moved_objects)?;
        st.serialize_field("handles_created", &self.handles_created)?;
        st.serialize_field("handles_destroyed", &self.handles_destroyed)?;
        st.end()
    }
}

impl serde::Serialize for MonitorStats {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("MonitorStats", 3)?;
        st.serialize_field("contentions", &self.contentions)?;
        st.serialize_field("acquired", &self.acquired)?;
        st.serialize_field("failed", &self.failed)?;
        st.end()
    }
}

pub fn render_json(trace: &DecodedTrace, opts: &ReportOptions) -> JsonReport {
    let has = |k: ReportKind| opts.reports.contains(&k);
    let alloc = has(ReportKind::Alloc).then(|| {
        let summary = AllocSummary::build(trace);
        let top_classes = summary
            .sorted(opts.alloc_sort)
            .into_iter()
            .take(20)
            .map(|c| (c.class_name.clone(), c.count, c.bytes))
            .collect();
        JsonAlloc { total_count: summary.total_count, total_bytes: summary.total_bytes, top_classes }
    });
    let gc = has(ReportKind::Gc).then(|| GcStats::build(trace));
    let monitor = has(ReportKind::Monitor).then(|| MonitorStats::build(trace));
    let heap_shots = has(ReportKind::HeapShot).then(|| {
        HeapShotSummary::build(trace)
            .into_iter()
            .map(|s| HeapShotJson {
                object_count: s.object_count,
                total_bytes: s.total_bytes,
                root_count: s.root_count,
                dangling_roots: s.dangling_roots.len(),
            })
            .collect()
    });
    let jit_count = has(ReportKind::Jit).then(|| trace.events.iter().filter(|e| matches!(e, DecodedEvent::MethodJit { .. })).count());
    let metadata_count = has(ReportKind::Metadata).then(|| {
        trace
            .events
            .iter()
            .filter(|e| matches!(e, DecodedEvent::MetadataLoad { .. } | DecodedEvent::MetadataUnload { .. } | DecodedEvent::MetadataName { .. }))
            .count()
    });
    let exception_count = has(ReportKind::Exception).then(|| {
        trace
            .events
            .iter()
            .filter(|e| matches!(e, DecodedEvent::Throw { .. } | DecodedEvent::Clause { .. }))
            .count()
    });
    let thread_count = has(ReportKind::Thread).then(|| {
        let mut ids: Vec<u64> = trace.events.iter().map(|e| e.thread_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    });

    JsonReport {
        file_version: format!("{}.{}", trace.file_header.major, trace.file_header.minor),
        pid: trace.file_header.pid,
        event_count: trace.events.len(),
        warning_count: trace.warnings.len(),
        alloc,
        gc,
        monitor,
        heap_shots,
        jit_count,
        metadata_count,
        exception_count,
        thread_count,
    }
}

/// Renders the selected reports as colored plain text, in the fixed order
/// `ReportKind::all()` lists them (not the order `--reports` named them).
pub fn render_text(trace: &DecodedTrace, opts: &ReportOptions) -> String {
    let mut out = String::new();
    let has = |k: ReportKind| opts.reports.contains(&k);

    if has(ReportKind::Header) {
        let _ = writeln!(out, "{}", "== header ==".bold());
        let _ = writeln!(
            out,
            "version {}.{} data-version {} pid {} events {} warnings {}",
            trace.file_header.major,
            trace.file_header.minor,
            trace.file_header.data_version,
            trace.file_header.pid,
            trace.events.len(),
            trace.warnings.len()
        );
        if !trace.warnings.is_empty() {
            for w in &trace.warnings {
                let _ = writeln!(out, "  {} frame {}: {}", "warning".yellow(), w.frame_index, w.message);
            }
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::Alloc) {
        let summary = AllocSummary::build(trace);
        let _ = writeln!(out, "{}", "== allocations ==".bold());
        let _ = writeln!(out, "total: {} objects, {} bytes", summary.total_count, summary.total_bytes);
        for stat in summary.sorted(opts.alloc_sort).into_iter().take(20) {
            let _ = writeln!(out, "  {:>10} bytes  {:>8} allocs  {}", stat.bytes, stat.count, stat.class_name);
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::Call) {
        let graph = CallGraphSummary::build(trace);
        let _ = writeln!(out, "{}", "== call graph ==".bold());
        for stat in graph.sorted(opts.method_sort).into_iter().take(30) {
            let _ = writeln!(
                out,
                "  {:>12} ns total  {:>12} ns self  {:>8} calls  {}",
                stat.total_time_ns, stat.self_time_ns, stat.calls, stat.name
            );
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::Gc) {
        let gc = GcStats::build(trace);
        let _ = writeln!(out, "{}", "== gc ==".bold());
        let _ = writeln!(
            out,
            "collections: {}  resizes: {}  moved objects: {}  handles +{} -{}",
            gc.collections, gc.resizes, gc.moved_objects, gc.handles_created, gc.handles_destroyed
        );
        let _ = writeln!(out);
    }

    if has(ReportKind::Monitor) {
        let mon = MonitorStats::build(trace);
        let _ = writeln!(out, "{}", "== monitor ==".bold());
        let _ = writeln!(out, "contentions: {}  acquired: {}  failed: {}", mon.contentions, mon.acquired, mon.failed);
        let _ = writeln!(out);
    }

    if has(ReportKind::Sample) {
        let attribution = SampleAttribution::build(trace);
        let _ = writeln!(out, "{}", "== samples ==".bold());
        let mut rows: Vec<_> = attribution.hits_by_method.values().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        for (name, hits) in rows.into_iter().take(20) {
            let _ = writeln!(out, "  {:>8} hits  {}", hits, name);
        }
        if attribution.unresolved_hits > 0 {
            let _ = writeln!(out, "  {:>8} hits  {}", attribution.unresolved_hits, "<unresolved>".dimmed());
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::Jit) {
        let _ = writeln!(out, "{}", "== jit ==".bold());
        for event in &trace.events {
            if let DecodedEvent::MethodJit { code_start, code_size, name, .. } = event {
                let _ = writeln!(out, "  0x{code_start:x} +{code_size:#x}  {name}");
            }
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::Metadata) {
        let _ = writeln!(out, "{}", "== metadata ==".bold());
        for event in &trace.events {
            match event {
                DecodedEvent::MetadataLoad { kind, id, name, load_err, .. } => {
                    let status = if *load_err { "FAILED".red().to_string() } else { "loaded".green().to_string() };
                    let _ = writeln!(out, "  kind {kind} id 0x{id:x} {name} [{status}]");
                }
                DecodedEvent::MetadataUnload { kind, id, name, .. } => {
                    let _ = writeln!(out, "  kind {kind} id 0x{id:x} {name} [unloaded]");
                }
                _ => {}
            }
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::Exception) {
        let _ = writeln!(out, "{}", "== exceptions ==".bold());
        for event in &trace.events {
            if let DecodedEvent::Throw { obj, backtrace, .. } = event {
                let shown = backtrace.len().min(opts.max_frames);
                let _ = writeln!(out, "  throw 0x{obj:x}  {shown}/{} frames", backtrace.len());
            }
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::Thread) {
        let mut ids: Vec<u64> = trace.events.iter().map(|e| e.thread_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        let _ = writeln!(out, "{}", "== threads ==".bold());
        for id in ids {
            let name = trace.tables.threads.get(&id).cloned().unwrap_or_else(|| "<unnamed>".to_string());
            let _ = writeln!(out, "  {id}  {name}");
        }
        let _ = writeln!(out);
    }

    if has(ReportKind::HeapShot) {
        let shots = HeapShotSummary::build(trace);
        let _ = writeln!(out, "{}", "== heap shots ==".bold());
        for (i, shot) in shots.iter().enumerate() {
            let _ = writeln!(
                out,
                "  shot {i}: {} objects, {} bytes, {} roots{}",
                shot.object_count,
                shot.total_bytes,
                shot.root_count,
                if shot.dangling_roots.is_empty() {
                    String::new()
                } else {
                    format!(", {} dangling", shot.dangling_roots.len()).red().to_string()
                }
            );
        }
        let _ = writeln!(out);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{BufferWarning, DecodedEvent, Tables};

    fn trace_with(events: Vec<DecodedEvent>) -> DecodedTrace {
        DecodedTrace {
            file_header: mlpd_common::header::FileHeader::new(0, 0, 9, 0),
            events,
            tables: Tables::default(),
            warnings: Vec::<BufferWarning>::new(),
        }
    }

    #[test]
    fn text_report_includes_only_requested_sections() {
        let trace = trace_with(vec![DecodedEvent::Alloc {
            thread_id: 1,
            time_ns: 0,
            obj: 0x10,
            class: 0xA,
            size: 32,
            backtrace: vec![],
        }]);
        let opts = ReportOptions {
            reports: vec![ReportKind::Alloc],
            ..ReportOptions::default()
        };
        let text = render_text(&trace, &opts);
        assert!(text.contains("allocations"));
        assert!(!text.contains("call graph"));
    }

    #[test]
    fn json_report_omits_sections_not_requested() {
        let trace = trace_with(vec![]);
        let opts = ReportOptions {
            reports: vec![ReportKind::Gc],
            ..ReportOptions::default()
        };
        let json = render_json(&trace, &opts);
        assert!(json.alloc.is_none());
        assert!(json.gc.is_some());
    }

    #[test]
    fn report_kind_parses_every_advertised_name() {
        for name in ["header", "jit", "gc", "sample", "alloc", "call", "metadata", "exception", "monitor", "thread", "heapshot"] {
            assert!(ReportKind::parse(name).is_some(), "failed to parse {name}");
        }
        assert!(ReportKind::parse("bogus").is_none());
    }
}
