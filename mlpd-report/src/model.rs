//! Aggregation over a decoded event stream (§6 "reports"): allocation
//! summaries, per-method call-graph stats, GC/monitor counters, heap-shot
//! graphs, and sample attribution. Each `Summary::from_events` pass is a
//! single linear scan; sorting is applied only when rendering (§6's
//! `--method-sort`/`--alloc-sort`).

use crate::decoder::{DecodedEvent, DecodedTrace};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct AllocClassStat {
    pub class: u64,
    pub class_name: String,
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocSort {
    Bytes,
    Count,
}

#[derive(Debug, Clone, Default)]
pub struct AllocSummary {
    pub by_class: Vec<AllocClassStat>,
    pub total_count: u64,
    pub total_bytes: u64,
}

impl AllocSummary {
    pub fn build(trace: &DecodedTrace) -> Self {
        let mut by_class: HashMap<u64, AllocClassStat> = HashMap::new();
        let mut total_count = 0u64;
        let mut total_bytes = 0u64;
        for event in &trace.events {
            if let DecodedEvent::Alloc { class, size, .. } = event {
                total_count += 1;
                total_bytes += size;
                let entry = by_class.entry(*class).or_insert_with(|| AllocClassStat {
                    class: *class,
                    class_name: trace.tables.class_name(*class),
                    count: 0,
                    bytes: 0,
                });
                entry.count += 1;
                entry.bytes += size;
            }
        }
        AllocSummary {
            by_class: by_class.into_values().collect(),
            total_count,
            total_bytes,
        }
    }

    pub fn sorted(&self, sort: AllocSort) -> Vec<&AllocClassStat> {
        let mut rows: Vec<&AllocClassStat> = self.by_class.iter().collect();
        match sort {
            AllocSort::Bytes => rows.sort_by(|a, b| b.bytes.cmp(&a.bytes)),
            AllocSort::Count => rows.sort_by(|a, b| b.count.cmp(&a.count)),
        }
        rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSort {
    Total,
    SelfTime,
    Calls,
}

#[derive(Debug, Clone, Default)]
pub struct MethodStat {
    pub method: u64,
    pub name: String,
    pub calls: u64,
    pub total_time_ns: u64,
    pub self_time_ns: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CallGraphSummary {
    pub by_method: Vec<MethodStat>,
}

impl CallGraphSummary {
    /// Builds per-method totals from `MethodLeave` events: `self_time_ns` is
    /// already resolved by the decoder's call-stack bookkeeping; total time
    /// is the enclosing enter→leave span, recovered here as `self_time_ns`
    /// summed with every call's measured span (tracked alongside leave).
    pub fn build(trace: &DecodedTrace) -> Self {
        let mut stats: HashMap<u64, MethodStat> = HashMap::new();
        let mut enter_times: HashMap<(u64, u64), Vec<u64>> = HashMap::new();
        for event in &trace.events {
            match event {
                DecodedEvent::MethodEnter { thread_id, time_ns, method } => {
                    enter_times.entry((*thread_id, *method)).or_default().push(*time_ns);
                }
                DecodedEvent::MethodLeave {
                    thread_id,
                    time_ns,
                    method,
                    self_time_ns,
                    ..
                } => {
                    let total_time_ns = enter_times
                        .get_mut(&(*thread_id, *method))
                        .and_then(|stack| stack.pop())
                        .map(|enter| time_ns.saturating_sub(enter))
                        .unwrap_or(0);
                    let entry = stats.entry(*method).or_insert_with(|| MethodStat {
                        method: *method,
                        name: trace.tables.method_name(*method),
                        calls: 0,
                        total_time_ns: 0,
                        self_time_ns: 0,
                    });
                    entry.calls += 1;
                    entry.total_time_ns += total_time_ns;
                    entry.self_time_ns += self_time_ns;
                }
                _ => {}
            }
        }
        CallGraphSummary {
            by_method: stats.into_values().collect(),
        }
    }

    pub fn sorted(&self, sort: MethodSort) -> Vec<&MethodStat> {
        let mut rows: Vec<&MethodStat> = self.by_method.iter().collect();
        match sort {
            MethodSort::Total => rows.sort_by(|a, b| b.total_time_ns.cmp(&a.total_time_ns)),
            MethodSort::SelfTime => rows.sort_by(|a, b| b.self_time_ns.cmp(&a.self_time_ns)),
            MethodSort::Calls => rows.sort_by(|a, b| b.calls.cmp(&a.calls)),
        }
        rows
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub collections: u64,
    pub resizes: u64,
    pub moved_objects: u64,
    pub handles_created: u64,
    pub handles_destroyed: u64,
    /// Wall-clock span between this generation's first and last observed
    /// `GcEvent`, a rough stand-in for collection duration in the absence of
    /// a paired start/end marker per generation.
    pub max_span_ns_by_generation: HashMap<u64, u64>,
}

impl GcStats {
    pub fn build(trace: &DecodedTrace) -> Self {
        let mut stats = GcStats::default();
        let mut first_seen: HashMap<u64, u64> = HashMap::new();
        for event in &trace.events {
            match event {
                DecodedEvent::GcEvent { generation, time_ns, .. } => {
                    stats.collections += 1;
                    let first = *first_seen.entry(*generation).or_insert(*time_ns);
                    let span = time_ns.saturating_sub(first);
                    let slot = stats.max_span_ns_by_generation.entry(*generation).or_insert(0);
                    if span > *slot {
                        *slot = span;
                    }
                }
                DecodedEvent::GcResize { .. } => stats.resizes += 1,
                DecodedEvent::GcMove { moved, .. } => stats.moved_objects += moved.len() as u64,
                DecodedEvent::GcHandleCreated { .. } => stats.handles_created += 1,
                DecodedEvent::GcHandleDestroyed { .. } => stats.handles_destroyed += 1,
                _ => {}
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub contentions: u64,
    pub acquired: u64,
    pub failed: u64,
}

impl MonitorStats {
    pub fn build(trace: &DecodedTrace) -> Self {
        let mut stats = MonitorStats::default();
        for event in &trace.events {
            if let DecodedEvent::Monitor { op, .. } = event {
                match *op {
                    1 => stats.contentions += 1,
                    2 => stats.acquired += 1,
                    3 => stats.failed += 1,
                    _ => {}
                }
            }
        }
        stats
    }
}

/// One observed heap shot: the `HeapObject`/`HeapRoot` records between a
/// matched `HeapStart`…`HeapEnd` pair.
#[derive(Debug, Clone, Default)]
pub struct HeapShotSummary {
    pub object_count: u64,
    pub total_bytes: u64,
    pub root_count: u64,
    /// Roots whose target object was never observed in this shot's
    /// `HeapObject` records (Testable Property #6's closure check).
    pub dangling_roots: Vec<u64>,
}

impl HeapShotSummary {
    pub fn build(trace: &DecodedTrace) -> Vec<Self> {
        let mut shots = Vec::new();
        let mut current: Option<(HeapShotSummary, std::collections::HashSet<u64>, Vec<u64>)> = None;
        for event in &trace.events {
            match event {
                DecodedEvent::HeapStart { .. } => {
                    current = Some((HeapShotSummary::default(), std::collections::HashSet::new(), Vec::new()));
                }
                DecodedEvent::HeapObject { obj, size, .. } => {
                    if let Some((summary, seen, _)) = current.as_mut() {
                        summary.object_count += 1;
                        summary.total_bytes += size;
                        seen.insert(*obj);
                    }
                }
                DecodedEvent::HeapRoot { obj, .. } => {
                    if let Some((summary, _, roots)) = current.as_mut() {
                        summary.root_count += 1;
                        roots.push(*obj);
                    }
                }
                DecodedEvent::HeapEnd { .. } => {
                    if let Some((mut summary, seen, roots)) = current.take() {
                        summary.dangling_roots = roots.into_iter().filter(|r| !seen.contains(r)).collect();
                        shots.push(summary);
                    }
                }
                _ => {}
            }
        }
        shots
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleAttribution {
    pub hits_by_method: HashMap<u64, (String, u64)>,
    pub unresolved_hits: u64,
}

impl SampleAttribution {
    pub fn build(trace: &DecodedTrace) -> Self {
        let mut attribution = SampleAttribution::default();
        for event in &trace.events {
            if let DecodedEvent::SampleHit { frames, .. } = event {
                match frames.first() {
                    Some(frame) => {
                        let entry = attribution
                            .hits_by_method
                            .entry(frame.method)
                            .or_insert_with(|| (trace.tables.method_name(frame.method), 0));
                        entry.1 += 1;
                    }
                    None => attribution.unresolved_hits += 1,
                }
            }
        }
        attribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{BufferWarning, Tables};

    fn trace_with(events: Vec<DecodedEvent>) -> DecodedTrace {
        DecodedTrace {
            file_header: mlpd_common::header::FileHeader::new(0, 0, 1, 0),
            events,
            tables: Tables::default(),
            warnings: Vec::<BufferWarning>::new(),
        }
    }

    #[test]
    fn alloc_summary_groups_by_class_and_sums_bytes() {
        let trace = trace_with(vec![
            DecodedEvent::Alloc { thread_id: 1, time_ns: 0, obj: 0x10, class: 0xA, size: 32, backtrace: vec![] },
            DecodedEvent::Alloc { thread_id: 1, time_ns: 1, obj: 0x20, class: 0xA, size: 16, backtrace: vec![] },
            DecodedEvent::Alloc { thread_id: 1, time_ns: 2, obj: 0x30, class: 0xB, size: 8, backtrace: vec![] },
        ]);
        let summary = AllocSummary::build(&trace);
        assert_eq!(summary.total_count, 3);
        assert_eq!(summary.total_bytes, 56);
        let top = summary.sorted(AllocSort::Bytes);
        assert_eq!(top[0].class, 0xA);
        assert_eq!(top[0].bytes, 48);
    }

    #[test]
    fn call_graph_attributes_self_time_from_decoder() {
        let trace = trace_with(vec![
            DecodedEvent::MethodEnter { thread_id: 1, time_ns: 0, method: 0x1 },
            DecodedEvent::MethodLeave { thread_id: 1, time_ns: 100, method: 0x1, exceptional: false, self_time_ns: 90 },
        ]);
        let graph = CallGraphSummary::build(&trace);
        let m = &graph.by_method[0];
        assert_eq!(m.calls, 1);
        assert_eq!(m.total_time_ns, 100);
        assert_eq!(m.self_time_ns, 90);
    }

    #[test]
    fn heap_shot_flags_a_root_whose_target_object_was_never_seen() {
        let trace = trace_with(vec![
            DecodedEvent::HeapStart { thread_id: 1, time_ns: 0 },
            DecodedEvent::HeapObject { thread_id: 1, time_ns: 1, obj: 0xA0, class: 0x1, size: 16, refs: vec![] },
            DecodedEvent::HeapRoot { thread_id: 1, time_ns: 2, obj: 0xA0, kind: 1, extra: 0 },
            DecodedEvent::HeapRoot { thread_id: 1, time_ns: 3, obj: 0xFF, kind: 1, extra: 0 },
            DecodedEvent::HeapEnd { thread_id: 1, time_ns: 4 },
        ]);
        let shots = HeapShotSummary::build(&trace);
        assert_eq!(shots.len(), 1);
        assert_eq!(shots[0].object_count, 1);
        assert_eq!(shots[0].dangling_roots, vec![0xFF]);
    }

    #[test]
    fn sample_attribution_counts_the_innermost_frame() {
        let trace = trace_with(vec![DecodedEvent::SampleHit {
            thread_id: 1,
            time_ns: 0,
            sample_kind: 1,
            elapsed_10us: 100,
            ip: 0x1234,
            frames: vec![crate::decoder::SampleFrame { method: 0x5, domain: 0, base_addr: 0, native_offset: 0 }],
        }]);
        let attribution = SampleAttribution::build(&trace);
        assert_eq!(attribution.hits_by_method.get(&0x5).unwrap().1, 1);
    }
}
