//! Fixed-size, little-endian file and buffer-frame headers. Laid out as
//! `#[repr(C)]` `Pod` structs so the writer and decoder share one definition
//! of the wire shape, mirroring `linnix-ai-ebpf-common`'s POD wire-struct
//! idiom (`ProcessEvent`, `SequencedSlot`) applied to this format's headers.

use bytemuck::{Pod, Zeroable};

/// Magic identifying a buffer frame: `proflog.h`'s `BUF_ID`.
pub const BUF_ID: u32 = 0x4D50_4C01;
/// Magic identifying the file header: `proflog.h`'s `LOG_HEADER_ID`.
pub const LOG_HEADER_ID: u32 = 0x4D50_5A01;

pub const LOG_VERSION_MAJOR: u8 = 0;
pub const LOG_VERSION_MINOR: u8 = 4;
pub const LOG_DATA_VERSION: u8 = 4;

/// Size in bytes of a pointer on the host that produced the trace. This
/// crate always targets 64-bit hosts.
pub const PTR_SIZE: u8 = 8;

/// 32-byte file header, written once by the writer thread before any buffer
/// frame. All multi-byte fields are little-endian; `Pod`'s derive enforces a
/// packed, padding-free layout that matches the wire format directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FileHeader {
    pub header_id: u32,
    pub major: u8,
    pub minor: u8,
    pub data_version: u8,
    pub ptr_size: u8,
    pub startup_time_ms_epoch: u64,
    pub timer_overhead_ns: u32,
    pub flags: u32,
    pub pid: u32,
    pub port: u16,
    pub osid: u16,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == 32);

impl FileHeader {
    pub fn new(startup_time_ms_epoch: u64, timer_overhead_ns: u32, pid: u32, port: u16) -> Self {
        FileHeader {
            header_id: LOG_HEADER_ID,
            major: LOG_VERSION_MAJOR,
            minor: LOG_VERSION_MINOR,
            data_version: LOG_DATA_VERSION,
            ptr_size: PTR_SIZE,
            startup_time_ms_epoch,
            timer_overhead_ns,
            flags: 0,
            pid,
            port,
            osid: osid_constant(),
        }
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        bytemuck::cast(*self)
    }

    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        bytemuck::cast(bytes)
    }
}

/// Coarse OS identifier written into the file header. Not meaningful beyond
/// distinguishing "which `osid` produced this trace" for a reader that wants
/// to branch on host conventions; this crate only ever runs on Linux.
const OSID_LINUX: u16 = 1;

fn osid_constant() -> u16 {
    OSID_LINUX
}

/// 48-byte buffer frame header preceding every `LogBuffer`'s serialized
/// payload. `len` is the payload length in bytes, not including this header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BufferFrameHeader {
    pub buf_id: u32,
    pub len: u32,
    pub time_base: u64,
    pub ptr_base: u64,
    pub obj_base: u64,
    pub thread_id: u64,
    pub method_base: u64,
}

const _: () = assert!(std::mem::size_of::<BufferFrameHeader>() == 48);

impl BufferFrameHeader {
    pub fn new(
        len: u32,
        time_base: u64,
        ptr_base: u64,
        obj_base: u64,
        thread_id: u64,
        method_base: u64,
    ) -> Self {
        BufferFrameHeader {
            buf_id: BUF_ID,
            len,
            time_base,
            ptr_base,
            obj_base,
            thread_id,
            method_base,
        }
    }

    pub fn to_le_bytes(&self) -> [u8; 48] {
        bytemuck::cast(*self)
    }

    pub fn from_le_bytes(bytes: [u8; 48]) -> Self {
        bytemuck::cast(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_round_trips_through_bytes() {
        let h = FileHeader::new(1_700_000_000_000, 42, 1234, 0);
        let bytes = h.to_le_bytes();
        assert_eq!(bytes.len(), 32);
        let back = FileHeader::from_le_bytes(bytes);
        assert_eq!(back.header_id, LOG_HEADER_ID);
        assert_eq!(back.pid, 1234);
        assert_eq!(back.timer_overhead_ns, 42);
    }

    #[test]
    fn buffer_frame_header_round_trips_through_bytes() {
        let h = BufferFrameHeader::new(128, 10, 20, 30, 17, 40);
        let bytes = h.to_le_bytes();
        assert_eq!(bytes.len(), 48);
        let back = BufferFrameHeader::from_le_bytes(bytes);
        assert_eq!(back.buf_id, BUF_ID);
        assert_eq!(back.thread_id, 17);
        assert_eq!(back.len, 128);
    }
}
