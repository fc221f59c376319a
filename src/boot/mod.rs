//! Mode setup: real mode, 32-bit paging, 64-bit long mode, and the Linux
//! bzImage loader (which rides on top of the long-mode/protected-mode
//! register contracts this module defines).
//!
//! Three guest classes share one VM: a toy real-mode program, a paging
//! guest (the "1K OS" kernel + shell + TAR filesystem, out of scope here —
//! we only supply the CPU/memory contract it boots into), and a Linux
//! bzImage. Each vCPU picks exactly one of `boot::real`, `boot::protected`,
//! `boot::longmode`, or `boot::linux` to get from "freshly created vCPU" to
//! "ready to `run()`".

pub mod linux;
pub mod longmode;
pub mod protected;
pub mod real;

use crate::kvm::KvmError;
use crate::memory::MemoryError;
use thiserror::Error;

/// Errors during image load and mode setup (SetupError / LoadError kinds).
#[derive(Error, Debug)]
pub enum BootError {
    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("failed to read image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },

    #[error("initrd does not fit below initrd_addr_max: {size} bytes, max end {max_end:#x}")]
    InitrdDoesNotFit { size: usize, max_end: u64 },
}

/// Descriptor-table entry selectors shared by the protected- and long-mode
/// GDTs (§3: "Descriptor tables").
pub mod selectors {
    pub const KERNEL_CODE: u16 = 0x08;
    pub const KERNEL_DATA: u16 = 0x10;
    pub const USER_CODE: u16 = 0x18;
    pub const USER_DATA: u16 = 0x20;
}

/// Construct an 8-byte GDT entry.
pub(crate) const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

/// Decode a GDT entry into a `kvm_segment` for the given selector.
pub(crate) fn kvm_segment_from_gdt(entry: u64, selector: u16) -> kvm_bindings::kvm_segment {
    kvm_bindings::kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector,
        type_: ((entry >> 40) & 0xf) as u8,
        present: ((entry >> 47) & 0x1) as u8,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdt_entry_round_trips_flat_segment() {
        let e = gdt_entry(0xc09b, 0, 0xfffff);
        let seg = kvm_segment_from_gdt(e, selectors::KERNEL_CODE);
        assert_eq!(seg.base, 0);
        assert_eq!(seg.g, 1);
        assert_eq!(seg.db, 1);
        assert_eq!(seg.selector, selectors::KERNEL_CODE);
    }
}
