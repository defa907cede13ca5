//! Binary trace decoder (§4.J). One pass over the file: the 32-byte file
//! header, then a sequence of 48-byte buffer-frame headers each followed
//! by its payload. Mirrors the encoder's delta-base state machine exactly
//! (`profilerd::buffer::LogBuffer::emit_time/emit_ptr/emit_obj/emit_method`):
//! `time`/`method` chain off a running last-value seeded from the frame
//! header, `ptr`/`obj` stay fixed at the value the frame header recorded.

use crate::error::DecodeError;
use mlpd_common::header::{BufferFrameHeader, FileHeader, BUF_ID, LOG_HEADER_ID};
use mlpd_common::leb128::{decode_sleb128, decode_uleb128};
use mlpd_common::tags::*;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct MethodDesc {
    pub name: String,
    pub code_start: u64,
    pub code_size: u64,
}

/// Global tables accumulated across the whole file, keyed by the raw
/// pointer/id values carried in the trace (§4.J "global tables").
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub methods: HashMap<u64, MethodDesc>,
    pub classes: HashMap<u64, String>,
    pub images: HashMap<u64, String>,
    pub assemblies: HashMap<u64, String>,
    pub domains: HashMap<u64, String>,
    pub threads: HashMap<u64, String>,
}

impl Tables {
    pub fn method_name(&self, ptr: u64) -> String {
        self.methods
            .get(&ptr)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| format!("unknown method 0x{ptr:x}"))
    }

    pub fn class_name(&self, ptr: u64) -> String {
        self.classes
            .get(&ptr)
            .cloned()
            .unwrap_or_else(|| format!("unknown class 0x{ptr:x}"))
    }

    fn register(&mut self, kind: u8, id: u64, name: String) {
        let table = match kind {
            TYPE_CLASS => &mut self.classes,
            TYPE_IMAGE => &mut self.images,
            TYPE_ASSEMBLY => &mut self.assemblies,
            TYPE_DOMAIN => &mut self.domains,
            TYPE_THREAD => &mut self.threads,
            TYPE_CONTEXT => &mut self.domains,
            _ => return,
        };
        table.insert(id, name);
    }
}

/// One heap-allocated call frame as carried by a `TYPE_SAMPLE_HIT` record.
#[derive(Debug, Clone)]
pub struct SampleFrame {
    pub method: u64,
    pub domain: u64,
    pub base_addr: u64,
    pub native_offset: i64,
}

#[derive(Debug, Clone)]
pub enum DecodedEvent {
    Alloc {
        thread_id: u64,
        time_ns: u64,
        obj: u64,
        class: u64,
        size: u64,
        backtrace: Vec<u64>,
    },
    GcEvent {
        thread_id: u64,
        time_ns: u64,
        kind: u64,
        generation: u64,
    },
    GcResize {
        thread_id: u64,
        time_ns: u64,
        new_size: u64,
    },
    GcMove {
        thread_id: u64,
        time_ns: u64,
        moved: Vec<u64>,
    },
    GcHandleCreated {
        thread_id: u64,
        time_ns: u64,
        handle_type: u64,
        handle: u64,
        obj: u64,
    },
    GcHandleDestroyed {
        thread_id: u64,
        time_ns: u64,
        handle_type: u64,
        handle: u64,
    },
    HeapStart {
        thread_id: u64,
        time_ns: u64,
    },
    HeapEnd {
        thread_id: u64,
        time_ns: u64,
    },
    HeapObject {
        thread_id: u64,
        time_ns: u64,
        obj: u64,
        class: u64,
        size: u64,
        refs: Vec<(u64, u64)>,
    },
    HeapRoot {
        thread_id: u64,
        time_ns: u64,
        obj: u64,
        kind: u8,
        extra: u64,
    },
    MetadataLoad {
        thread_id: u64,
        time_ns: u64,
        kind: u8,
        id: u64,
        name: String,
        load_err: bool,
    },
    MetadataUnload {
        thread_id: u64,
        time_ns: u64,
        kind: u8,
        id: u64,
        name: String,
    },
    MetadataName {
        thread_id: u64,
        time_ns: u64,
        kind: u8,
        id: u64,
        name: String,
    },
    MethodEnter {
        thread_id: u64,
        time_ns: u64,
        method: u64,
    },
    MethodLeave {
        thread_id: u64,
        time_ns: u64,
        method: u64,
        exceptional: bool,
        self_time_ns: u64,
    },
    MethodJit {
        thread_id: u64,
        time_ns: u64,
        method: u64,
        code_start: u64,
        code_size: u64,
        name: String,
    },
    JitHelper {
        thread_id: u64,
        time_ns: u64,
        buffer_type: u64,
        code_start: u64,
        code_size: u64,
        name: String,
    },
    Throw {
        thread_id: u64,
        time_ns: u64,
        obj: u64,
        backtrace: Vec<u64>,
    },
    Clause {
        thread_id: u64,
        time_ns: u64,
        method: u64,
        clause_num: u64,
        clause_type: u8,
    },
    Monitor {
        thread_id: u64,
        time_ns: u64,
        obj: u64,
        op: u8,
    },
    Coverage {
        thread_id: u64,
        time_ns: u64,
        kind: u8,
        id: u64,
        name: String,
    },
    SampleHit {
        thread_id: u64,
        time_ns: u64,
        sample_kind: u8,
        elapsed_10us: u64,
        ip: u64,
        frames: Vec<SampleFrame>,
    },
}

impl DecodedEvent {
    pub fn thread_id(&self) -> u64 {
        match self {
            DecodedEvent::Alloc { thread_id, .. }
            | DecodedEvent::GcEvent { thread_id, .. }
            | DecodedEvent::GcResize { thread_id, .. }
            | DecodedEvent::GcMove { thread_id, .. }
            | DecodedEvent::GcHandleCreated { thread_id, .. }
            | DecodedEvent::GcHandleDestroyed { thread_id, .. }
            | DecodedEvent::HeapStart { thread_id, .. }
            | DecodedEvent::HeapEnd { thread_id, .. }
            | DecodedEvent::HeapObject { thread_id, .. }
            | DecodedEvent::HeapRoot { thread_id, .. }
            | DecodedEvent::MetadataLoad { thread_id, .. }
            | DecodedEvent::MetadataUnload { thread_id, .. }
            | DecodedEvent::MetadataName { thread_id, .. }
            | DecodedEvent::MethodEnter { thread_id, .. }
            | DecodedEvent::MethodLeave { thread_id, .. }
            | DecodedEvent::MethodJit { thread_id, .. }
            | DecodedEvent::JitHelper { thread_id, .. }
            | DecodedEvent::Throw { thread_id, .. }
            | DecodedEvent::Clause { thread_id, .. }
            | DecodedEvent::Monitor { thread_id, .. }
            | DecodedEvent::Coverage { thread_id, .. }
            | DecodedEvent::SampleHit { thread_id, .. } => *thread_id,
        }
    }

    pub fn time_ns(&self) -> u64 {
        match self {
            DecodedEvent::Alloc { time_ns, .. }
            | DecodedEvent::GcEvent { time_ns, .. }
            | DecodedEvent::GcResize { time_ns, .. }
            | DecodedEvent::GcMove { time_ns, .. }
            | DecodedEvent::GcHandleCreated { time_ns, .. }
            | DecodedEvent::GcHandleDestroyed { time_ns, .. }
            | DecodedEvent::HeapStart { time_ns, .. }
            | DecodedEvent::HeapEnd { time_ns, .. }
            | DecodedEvent::HeapObject { time_ns, .. }
            | DecodedEvent::HeapRoot { time_ns, .. }
            | DecodedEvent::MetadataLoad { time_ns, .. }
            | DecodedEvent::MetadataUnload { time_ns, .. }
            | DecodedEvent::MetadataName { time_ns, .. }
            | DecodedEvent::MethodEnter { time_ns, .. }
            | DecodedEvent::MethodLeave { time_ns, .. }
            | DecodedEvent::MethodJit { time_ns, .. }
            | DecodedEvent::JitHelper { time_ns, .. }
            | DecodedEvent::Throw { time_ns, .. }
            | DecodedEvent::Clause { time_ns, .. }
            | DecodedEvent::Monitor { time_ns, .. }
            | DecodedEvent::Coverage { time_ns, .. }
            | DecodedEvent::SampleHit { time_ns, .. } => *time_ns,
        }
    }
}

/// A diagnostic recorded for an abandoned buffer frame (§7 `MalformedBuffer`).
#[derive(Debug, Clone)]
pub struct BufferWarning {
    pub frame_index: usize,
    pub message: String,
}

pub struct DecodedTrace {
    pub file_header: FileHeader,
    pub events: Vec<DecodedEvent>,
    pub tables: Tables,
    pub warnings: Vec<BufferWarning>,
}

/// Per-buffer decode state, reset from the frame header on every buffer
/// entry (§4.J).
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    last_time: u64,
    ptr_base: u64,
    obj_base: u64,
    last_method: u64,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], header: &BufferFrameHeader) -> Self {
        Cursor {
            data,
            pos: 0,
            last_time: header.time_base,
            ptr_base: header.ptr_base,
            obj_base: header.obj_base,
            last_method: header.method_base,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| DecodeError::Malformed(format!("unexpected end of buffer at offset {}", self.pos)))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_uleb(&mut self) -> Result<u64, DecodeError> {
        let (value, consumed) = decode_uleb128(&self.data[self.pos..])
            .map_err(|e| DecodeError::Malformed(format!("uleb128 decode failed at offset {}: {e:?}", self.pos)))?;
        self.pos += consumed;
        Ok(value)
    }

    fn read_sleb(&mut self) -> Result<i64, DecodeError> {
        let (value, consumed) = decode_sleb128(&self.data[self.pos..])
            .map_err(|e| DecodeError::Malformed(format!("sleb128 decode failed at offset {}: {e:?}", self.pos)))?;
        self.pos += consumed;
        Ok(value)
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let nul = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DecodeError::Malformed(format!("unterminated string at offset {start}")))?;
        let s = String::from_utf8_lossy(&self.data[start..start + nul]).into_owned();
        self.pos = start + nul + 1;
        Ok(s)
    }

    fn read_time(&mut self) -> Result<u64, DecodeError> {
        let delta = self.read_uleb()?;
        self.last_time = self.last_time.saturating_add(delta);
        Ok(self.last_time)
    }

    fn read_ptr(&mut self) -> Result<u64, DecodeError> {
        let delta = self.read_sleb()?;
        Ok((self.ptr_base as i64).wrapping_add(delta) as u64)
    }

    fn read_obj(&mut self) -> Result<u64, DecodeError> {
        let delta = self.read_sleb()?;
        let shifted = (self.obj_base as i64).wrapping_add(delta) as u64;
        Ok(shifted << 3)
    }

    fn read_method(&mut self) -> Result<u64, DecodeError> {
        let delta = self.read_sleb()?;
        self.last_method = (self.last_method as i64).wrapping_add(delta) as u64;
        Ok(self.last_method)
    }

    /// Reads a `(flags, count, methods[count])` backtrace, innermost frame
    /// first, matching `profilerd::encoders::emit_bt`.
    fn read_backtrace(&mut self) -> Result<Vec<u64>, DecodeError> {
        let _flags = self.read_uleb()?;
        let count = self.read_uleb()?;
        let mut methods = Vec::with_capacity(count as usize);
        for _ in 0..count {
            methods.push(self.read_method()?);
        }
        Ok(methods)
    }
}

/// Decodes a full `.mlpd` trace already resident in memory. Returns
/// `DecodeError::Fatal` only for a bad magic or unsupported version;
/// everything else accumulates as a `BufferWarning` and decoding
/// continues with the next frame.
pub fn decode_trace(bytes: &[u8]) -> Result<DecodedTrace, DecodeError> {
    if bytes.len() < 32 {
        return Err(DecodeError::Fatal("file shorter than the 32-byte file header".into()));
    }
    let mut header_bytes = [0u8; 32];
    header_bytes.copy_from_slice(&bytes[..32]);
    let file_header = FileHeader::from_le_bytes(header_bytes);
    if file_header.header_id != LOG_HEADER_ID {
        return Err(DecodeError::Fatal(format!(
            "bad file magic 0x{:08x}, expected 0x{LOG_HEADER_ID:08x}",
            file_header.header_id
        )));
    }
    if file_header.data_version != mlpd_common::header::LOG_DATA_VERSION {
        return Err(DecodeError::Fatal(format!(
            "unsupported data version {}, this reader understands {}",
            file_header.data_version,
            mlpd_common::header::LOG_DATA_VERSION
        )));
    }

    let mut tables = Tables::default();
    let mut events = Vec::new();
    let mut warnings = Vec::new();
    let mut call_stacks: HashMap<u64, Vec<(u64, u64, u64)>> = HashMap::new();

    let mut offset = 32usize;
    let mut frame_index = 0usize;
    while offset + 48 <= bytes.len() {
        let mut frame_bytes = [0u8; 48];
        frame_bytes.copy_from_slice(&bytes[offset..offset + 48]);
        let frame_header = BufferFrameHeader::from_le_bytes(frame_bytes);
        if frame_header.buf_id != BUF_ID {
            // A corrupt frame header means we no longer know where the next
            // frame starts either; stop rather than guess (§5).
            warnings.push(BufferWarning {
                frame_index,
                message: format!("bad buffer magic 0x{:08x} at file offset {offset}, stopping", frame_header.buf_id),
            });
            break;
        }
        let payload_start = offset + 48;
        let payload_len = frame_header.len as usize;
        if payload_start + payload_len > bytes.len() {
            warnings.push(BufferWarning {
                frame_index,
                message: format!("buffer frame at offset {offset} claims {payload_len} bytes but only {} remain", bytes.len() - payload_start),
            });
            break;
        }
        let payload = &bytes[payload_start..payload_start + payload_len];
        if let Err(e) = decode_buffer_payload(payload, &frame_header, &mut tables, &mut call_stacks, &mut events) {
            warnings.push(BufferWarning {
                frame_index,
                message: e.to_string(),
            });
        }
        offset = payload_start + payload_len;
        frame_index += 1;
    }

    Ok(DecodedTrace {
        file_header,
        events,
        tables,
        warnings,
    })
}

fn decode_buffer_payload(
    payload: &[u8],
    header: &BufferFrameHeader,
    tables: &mut Tables,
    call_stacks: &mut HashMap<u64, Vec<(u64, u64, u64)>>,
    events: &mut Vec<DecodedEvent>,
) -> Result<(), DecodeError> {
    let thread_id = header.thread_id;
    let mut cur = Cursor::new(payload, header);
    while cur.remaining() > 0 {
        let tag = cur.read_byte()?;
        let cat = category(tag);
        if cat == TYPE_END {
            break;
        }
        match cat {
            TYPE_ALLOC => decode_alloc(&mut cur, tag, thread_id, events)?,
            TYPE_GC => decode_gc(&mut cur, tag, thread_id, events)?,
            TYPE_METADATA => decode_metadata(&mut cur, tag, thread_id, tables, events)?,
            TYPE_METHOD => decode_method(&mut cur, tag, thread_id, tables, call_stacks, events)?,
            TYPE_EXCEPTION => decode_exception(&mut cur, tag, thread_id, events)?,
            TYPE_MONITOR => decode_monitor(&mut cur, tag, thread_id, events)?,
            TYPE_HEAP => decode_heap(&mut cur, tag, thread_id, events)?,
            TYPE_SAMPLE => decode_sample(&mut cur, tag, events)?,
            TYPE_RUNTIME => decode_runtime(&mut cur, tag, thread_id, events)?,
            TYPE_COVERAGE => decode_coverage(&mut cur, tag, thread_id, events)?,
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown tag category {other} (raw tag 0x{tag:02x}) at offset {}",
                    cur.pos - 1
                )))
            }
        }
    }
    Ok(())
}

fn decode_alloc(cur: &mut Cursor, tag: u8, thread_id: u64, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let bt = tag & TYPE_ALLOC_BT != 0;
    let time_ns = cur.read_time()?;
    let class = cur.read_ptr()?;
    let obj = cur.read_obj()?;
    let size = cur.read_uleb()?;
    let backtrace = if bt { cur.read_backtrace()? } else { Vec::new() };
    events.push(DecodedEvent::Alloc {
        thread_id,
        time_ns,
        obj,
        class,
        size,
        backtrace,
    });
    Ok(())
}

fn decode_gc(cur: &mut Cursor, tag: u8, thread_id: u64, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let upper = tag & 0xF0;
    let time_ns = cur.read_time()?;
    match upper {
        TYPE_GC_EVENT => {
            let kind = cur.read_uleb()?;
            let generation = cur.read_uleb()?;
            events.push(DecodedEvent::GcEvent { thread_id, time_ns, kind, generation });
        }
        TYPE_GC_RESIZE => {
            let new_size = cur.read_uleb()?;
            events.push(DecodedEvent::GcResize { thread_id, time_ns, new_size });
        }
        TYPE_GC_MOVE => {
            let n = cur.read_uleb()? as usize;
            let mut moved = Vec::with_capacity(n);
            for _ in 0..n {
                moved.push(cur.read_obj()?);
            }
            events.push(DecodedEvent::GcMove { thread_id, time_ns, moved });
        }
        TYPE_GC_HANDLE_CREATED | TYPE_GC_HANDLE_CREATED_BT => {
            let handle_type = cur.read_uleb()?;
            let handle = cur.read_uleb()?;
            let obj = cur.read_obj()?;
            if upper == TYPE_GC_HANDLE_CREATED_BT {
                let _ = cur.read_backtrace()?;
            }
            events.push(DecodedEvent::GcHandleCreated { thread_id, time_ns, handle_type, handle, obj });
        }
        TYPE_GC_HANDLE_DESTROYED | TYPE_GC_HANDLE_DESTROYED_BT => {
            let handle_type = cur.read_uleb()?;
            let handle = cur.read_uleb()?;
            if upper == TYPE_GC_HANDLE_DESTROYED_BT {
                let _ = cur.read_backtrace()?;
            }
            events.push(DecodedEvent::GcHandleDestroyed { thread_id, time_ns, handle_type, handle });
        }
        _ => return Err(DecodeError::Malformed(format!("unknown gc subtype 0x{upper:02x}"))),
    }
    Ok(())
}

fn register_metadata_name(tables: &mut Tables, kind: u8, id: u64, name: String) {
    tables.register(kind, id, name);
}

fn decode_metadata(
    cur: &mut Cursor,
    tag: u8,
    thread_id: u64,
    tables: &mut Tables,
    events: &mut Vec<DecodedEvent>,
) -> Result<(), DecodeError> {
    let phase = subtype(tag);
    let load_err = tag & TYPE_LOAD_ERR != 0;
    let time_ns = cur.read_time()?;
    let kind = cur.read_byte()?;
    let id = cur.read_ptr()?;
    let _flags = cur.read_uleb()?;
    let name = cur.read_string()?;
    match phase {
        TYPE_END_LOAD => {
            if !load_err {
                register_metadata_name(tables, kind, id, name.clone());
            }
            events.push(DecodedEvent::MetadataLoad { thread_id, time_ns, kind, id, name, load_err });
        }
        TYPE_END_UNLOAD => {
            events.push(DecodedEvent::MetadataUnload { thread_id, time_ns, kind, id, name });
        }
        0 => {
            register_metadata_name(tables, kind, id, name.clone());
            events.push(DecodedEvent::MetadataName { thread_id, time_ns, kind, id, name });
        }
        other => return Err(DecodeError::Malformed(format!("unknown metadata phase 0x{other:02x}"))),
    }
    Ok(())
}

fn decode_method(
    cur: &mut Cursor,
    tag: u8,
    thread_id: u64,
    tables: &mut Tables,
    call_stacks: &mut HashMap<u64, Vec<(u64, u64, u64)>>,
    events: &mut Vec<DecodedEvent>,
) -> Result<(), DecodeError> {
    let sub = subtype(tag);
    let time_ns = cur.read_time()?;
    let method = cur.read_method()?;
    match sub {
        TYPE_ENTER => {
            call_stacks.entry(thread_id).or_default().push((method, time_ns, 0));
            events.push(DecodedEvent::MethodEnter { thread_id, time_ns, method });
        }
        TYPE_LEAVE | TYPE_EXC_LEAVE => {
            let exceptional = sub == TYPE_EXC_LEAVE;
            let stack = call_stacks.entry(thread_id).or_default();
            let self_time_ns = match stack.pop() {
                Some((_, enter_time, child_time)) => {
                    let total = time_ns.saturating_sub(enter_time);
                    if let Some(parent) = stack.last_mut() {
                        parent.2 += total;
                    }
                    total.saturating_sub(child_time)
                }
                None => 0,
            };
            events.push(DecodedEvent::MethodLeave { thread_id, time_ns, method, exceptional, self_time_ns });
        }
        TYPE_JIT => {
            let code_start = cur.read_ptr()?;
            let code_size = cur.read_uleb()?;
            let name = cur.read_string()?;
            tables.methods.insert(method, MethodDesc { name: name.clone(), code_start, code_size });
            events.push(DecodedEvent::MethodJit { thread_id, time_ns, method, code_start, code_size, name });
        }
        other => return Err(DecodeError::Malformed(format!("unknown method subtype 0x{other:02x}"))),
    }
    Ok(())
}

fn decode_exception(cur: &mut Cursor, tag: u8, thread_id: u64, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let is_clause = subtype(tag) == TYPE_CLAUSE;
    let bt = tag & TYPE_EXCEPTION_BT != 0;
    let time_ns = cur.read_time()?;
    if is_clause {
        let clause_type = cur.read_uleb()? as u8;
        let clause_num = cur.read_uleb()?;
        let method = cur.read_method()?;
        events.push(DecodedEvent::Clause { thread_id, time_ns, method, clause_num, clause_type });
    } else {
        let obj = cur.read_obj()?;
        let backtrace = if bt { cur.read_backtrace()? } else { Vec::new() };
        events.push(DecodedEvent::Throw { thread_id, time_ns, obj, backtrace });
    }
    Ok(())
}

fn decode_monitor(cur: &mut Cursor, tag: u8, thread_id: u64, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let op = subtype(tag) >> 4;
    let bt = tag & TYPE_MONITOR_BT != 0;
    let time_ns = cur.read_time()?;
    let obj = cur.read_obj()?;
    if bt {
        let _ = cur.read_backtrace()?;
    }
    events.push(DecodedEvent::Monitor { thread_id, time_ns, obj, op });
    Ok(())
}

fn decode_heap(cur: &mut Cursor, tag: u8, thread_id: u64, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let sub = subtype(tag);
    match sub {
        TYPE_HEAP_START => {
            let time_ns = cur.read_time()?;
            events.push(DecodedEvent::HeapStart { thread_id, time_ns });
        }
        TYPE_HEAP_END => {
            let time_ns = cur.read_time()?;
            events.push(DecodedEvent::HeapEnd { thread_id, time_ns });
        }
        TYPE_HEAP_OBJECT => {
            let time_ns = cur.read_time()?;
            let obj = cur.read_obj()?;
            let class = cur.read_ptr()?;
            let size = cur.read_uleb()?;
            let n = cur.read_uleb()? as usize;
            let mut refs = Vec::with_capacity(n);
            let mut last_offset = 0u64;
            for _ in 0..n {
                let delta = cur.read_uleb()?;
                last_offset += delta;
                let target = cur.read_obj()?;
                refs.push((last_offset, target));
            }
            events.push(DecodedEvent::HeapObject { thread_id, time_ns, obj, class, size, refs });
        }
        TYPE_HEAP_ROOT => {
            let time_ns = cur.read_time()?;
            let obj = cur.read_obj()?;
            let kind = cur.read_uleb()? as u8;
            let extra = cur.read_uleb()?;
            events.push(DecodedEvent::HeapRoot { thread_id, time_ns, obj, kind, extra });
        }
        other => return Err(DecodeError::Malformed(format!("unknown heap subtype 0x{other:02x}"))),
    }
    Ok(())
}

fn decode_sample(cur: &mut Cursor, tag: u8, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let sub = subtype(tag);
    match sub {
        TYPE_SAMPLE_HIT => {
            let kind = cur.read_uleb()? as u8;
            let time_ns = cur.read_time()?;
            let thread_id = cur.read_ptr()?;
            let elapsed_10us = cur.read_uleb()?;
            let ip = cur.read_ptr()?;
            let n = cur.read_uleb()? as usize;
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                let method = cur.read_method()?;
                let domain = cur.read_ptr()?;
                let base_addr = cur.read_ptr()?;
                let native_offset = cur.read_sleb()?;
                frames.push(SampleFrame { method, domain, base_addr, native_offset });
            }
            events.push(DecodedEvent::SampleHit { thread_id, time_ns, sample_kind: kind, elapsed_10us, ip, frames });
        }
        other => {
            return Err(DecodeError::Malformed(format!(
                "extended sample record subtype 0x{other:02x} is not implemented by this reader"
            )))
        }
    }
    Ok(())
}

fn decode_runtime(cur: &mut Cursor, tag: u8, thread_id: u64, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let sub = subtype(tag);
    match sub {
        TYPE_JITHELPER => {
            let time_ns = cur.read_time()?;
            let buffer_type = cur.read_uleb()?;
            let code_start = cur.read_ptr()?;
            let code_size = cur.read_uleb()?;
            let name = cur.read_string()?;
            events.push(DecodedEvent::JitHelper { thread_id, time_ns, buffer_type, code_start, code_size, name });
        }
        other => return Err(DecodeError::Malformed(format!("unknown runtime subtype 0x{other:02x}"))),
    }
    Ok(())
}

fn decode_coverage(cur: &mut Cursor, tag: u8, thread_id: u64, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
    let sub = subtype(tag);
    let kind = match sub {
        TYPE_COVERAGE_METHOD => TYPE_COVERAGE_METHOD,
        TYPE_COVERAGE_STATEMENT => TYPE_COVERAGE_STATEMENT,
        TYPE_COVERAGE_ASSEMBLY => TYPE_COVERAGE_ASSEMBLY,
        TYPE_COVERAGE_CLASS => TYPE_COVERAGE_CLASS,
        other => return Err(DecodeError::Malformed(format!("unknown coverage subtype 0x{other:02x}"))),
    };
    let time_ns = cur.read_time()?;
    let id = cur.read_ptr()?;
    let name = cur.read_string()?;
    events.push(DecodedEvent::Coverage { thread_id, time_ns, kind, id, name });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlpd_common::header::FileHeader;
    use profilerd::arena::Arena;
    use profilerd::buffer::LogBuffer;
    use profilerd::config::Config;
    use profilerd::encoders;
    use profilerd::pipeline::Pipeline;

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 40];
        let err = decode_trace(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::Fatal(_)));
    }

    #[test]
    fn empty_trace_decodes_to_an_empty_event_stream() {
        let file_header = FileHeader::new(0, 0, 1, 0);
        let bytes = file_header.to_le_bytes().to_vec();
        let trace = decode_trace(&bytes).unwrap();
        assert!(trace.events.is_empty());
        assert!(trace.warnings.is_empty());
    }

    #[test]
    fn method_jit_then_enter_leave_round_trips_with_balanced_self_time() {
        let arena = Arena::new(64 * 1024);
        let mut buf = LogBuffer::new(&arena, 7, 0).unwrap();
        {
            let mut guard = buf.try_enter().unwrap();
            guard.emit_byte(TYPE_METHOD | TYPE_JIT);
            guard.emit_time(1_000);
            guard.emit_method(0xAB00);
            guard.emit_ptr(0x500000);
            guard.emit_uleb(64);
            guard.emit_string("App::Main");

            guard.emit_byte(TYPE_METHOD | TYPE_ENTER);
            guard.emit_time(1_100);
            guard.emit_method(0xAB00);

            guard.emit_byte(TYPE_METHOD | TYPE_LEAVE);
            guard.emit_time(1_300);
            guard.emit_method(0xAB00);
        }
        let mut bytes = FileHeader::new(0, 0, 1, 0).to_le_bytes().to_vec();
        let frame = BufferFrameHeader::new(
            buf.payload().len() as u32,
            buf.time_base(),
            buf.ptr_base(),
            buf.obj_base(),
            buf.thread_id(),
            buf.method_base(),
        );
        bytes.extend_from_slice(&frame.to_le_bytes());
        bytes.extend_from_slice(buf.payload());

        let trace = decode_trace(&bytes).unwrap();
        assert!(trace.warnings.is_empty());
        assert_eq!(trace.events.len(), 3);
        assert_eq!(trace.tables.method_name(0xAB00), "App::Main");
        match &trace.events[2] {
            DecodedEvent::MethodLeave { self_time_ns, method, .. } => {
                assert_eq!(*method, 0xAB00);
                assert_eq!(*self_time_ns, 200);
            }
            other => panic!("expected MethodLeave, got {other:?}"),
        }
    }

    #[test]
    fn alloc_obj_base_is_fixed_and_deltas_are_shifted_by_8() {
        let arena = Arena::new(64 * 1024);
        let mut buf = LogBuffer::new(&arena, 1, 0).unwrap();
        {
            let mut guard = buf.try_enter().unwrap();
            guard.emit_byte(TYPE_ALLOC);
            guard.emit_time(10);
            guard.emit_ptr(0x9000);
            guard.emit_obj(0x1000);
            guard.emit_uleb(32);

            guard.emit_byte(TYPE_ALLOC);
            guard.emit_time(20);
            guard.emit_ptr(0x9000);
            guard.emit_obj(0x1040);
            guard.emit_uleb(32);
        }
        let mut bytes = FileHeader::new(0, 0, 1, 0).to_le_bytes().to_vec();
        let frame = BufferFrameHeader::new(
            buf.payload().len() as u32,
            buf.time_base(),
            buf.ptr_base(),
            buf.obj_base(),
            buf.thread_id(),
            buf.method_base(),
        );
        bytes.extend_from_slice(&frame.to_le_bytes());
        bytes.extend_from_slice(buf.payload());

        let trace = decode_trace(&bytes).unwrap();
        assert_eq!(trace.events.len(), 2);
        let objs: Vec<u64> = trace
            .events
            .iter()
            .map(|e| match e {
                DecodedEvent::Alloc { obj, .. } => *obj,
                _ => panic!("expected Alloc"),
            })
            .collect();
        assert_eq!(objs, vec![0x1000, 0x1040]);
    }

    #[test]
    fn malformed_tag_abandons_buffer_but_decoding_continues_with_next_frame() {
        let arena = Arena::new(64 * 1024);
        let mut buf = LogBuffer::new(&arena, 1, 0).unwrap();
        {
            let mut guard = buf.try_enter().unwrap();
            guard.emit_byte(0xFE); // category 14: not a real category
        }
        let mut bytes = FileHeader::new(0, 0, 1, 0).to_le_bytes().to_vec();
        let frame = BufferFrameHeader::new(
            buf.payload().len() as u32,
            buf.time_base(),
            buf.ptr_base(),
            buf.obj_base(),
            buf.thread_id(),
            buf.method_base(),
        );
        bytes.extend_from_slice(&frame.to_le_bytes());
        bytes.extend_from_slice(buf.payload());

        let trace = decode_trace(&bytes).unwrap();
        assert_eq!(trace.events.len(), 0);
        assert_eq!(trace.warnings.len(), 1);
    }

    #[test]
    fn sample_hit_round_trips_through_the_real_encoder() {
        let pipeline = Pipeline::for_test(Config::default());
        let frame = mlpd_common::sample::SampleFrame {
            method: 0x4000,
            domain: 0,
            base_addr: 0x100000,
            native_offset: 4,
        };
        let mut bytes = FileHeader::new(0, 0, 1, 0).to_le_bytes().to_vec();
        profilerd::producer::with_thread_state(&pipeline.arena, |buf, _pending| {
            encoders::encode_drained_sample(&pipeline, buf, 7, 1, 500, 0x100004, &[frame]);
            let frame_header = BufferFrameHeader::new(
                buf.payload().len() as u32,
                buf.time_base(),
                buf.ptr_base(),
                buf.obj_base(),
                buf.thread_id(),
                buf.method_base(),
            );
            bytes.extend_from_slice(&frame_header.to_le_bytes());
            bytes.extend_from_slice(buf.payload());
        });

        let trace = decode_trace(&bytes).unwrap();
        assert!(trace.warnings.is_empty());
        let hits: Vec<_> = trace
            .events
            .iter()
            .filter(|e| matches!(e, DecodedEvent::SampleHit { .. }))
            .collect();
        assert_eq!(hits.len(), 1);
    }
}
