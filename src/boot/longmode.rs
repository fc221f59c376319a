//! 64-bit long mode (§4.3 "Long mode").
//!
//! Builds a PML4/PDPT/PD at the fixed offsets from §3 ("8 KiB, 12 KiB,
//! 16 KiB"), a minimal 64-bit GDT, programs CPUID and the boot MSR batch,
//! then sets special registers in the order the boot contract requires:
//! CR4.PAE, then CR3, then EFER, then CR0.

use super::{gdt_entry, kvm_segment_from_gdt, selectors, BootError};
use crate::kvm::VcpuFd;
use crate::memory::GuestMemory;
use kvm_bindings::{kvm_fpu, kvm_regs};

pub const GDT_ADDR: u64 = 0x500;
const IDT_ADDR: u64 = GDT_ADDR + 5 * 8;

pub(crate) const PML4_ADDR: u64 = 0x2000;
const PDPT_ADDR: u64 = 0x3000;
const PD_ADDR: u64 = 0x4000;

const TWO_MIB: u64 = 2 * 1024 * 1024;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_ET: u64 = 0x10;
const X86_CR0_NE: u64 = 0x20;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

const GDT_TABLE: [u64; 5] = [
    gdt_entry(0, 0, 0),
    gdt_entry(0xa09b, 0, 0xf_ffff), // 64-bit code: L=1, DB=0
    gdt_entry(0xc093, 0, 0xf_ffff), // data: DB=1, L=0
    gdt_entry(0xa0fb, 0, 0xf_ffff), // user code, DPL=3
    gdt_entry(0xc0f3, 0, 0xf_ffff), // user data, DPL=3
];

/// Identity-map `mem_size` bytes of guest memory with 2 MiB PD leaves.
fn build_page_tables(memory: &GuestMemory, mem_size: u64) -> Result<(), BootError> {
    build_page_tables_at(memory, mem_size, PML4_ADDR)
}

/// Same identity mapping, but with the PML4 planted at a caller-chosen
/// address (the Linux BOOT64 entry shares this table shape but keeps its
/// own descriptor tables at the guest memory layout's Linux-specific
/// addresses).
pub(crate) fn build_page_tables_at(
    memory: &GuestMemory,
    mem_size: u64,
    pml4_addr: u64,
) -> Result<(), BootError> {
    memory.write_u64(pml4_addr, PDPT_ADDR | 0x3)?;
    memory.write_u64(PDPT_ADDR, PD_ADDR | 0x3)?;

    let entry_count = mem_size.div_ceil(TWO_MIB).min(512) as usize;
    let mut pd = vec![0u64; entry_count];
    for (i, entry) in pd.iter_mut().enumerate() {
        *entry = ((i as u64) << 21) | 0x83; // Present + R/W + PS (2MiB leaf)
    }
    let pd_bytes =
        unsafe { std::slice::from_raw_parts(pd.as_ptr() as *const u8, pd.len() * 8) };
    memory.write(PD_ADDR, pd_bytes)?;

    Ok(())
}

fn build_gdt_idt(memory: &GuestMemory) -> Result<(), BootError> {
    let gdt_bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(GDT_TABLE.as_ptr() as *const u8, GDT_TABLE.len() * 8)
    };
    memory.write(GDT_ADDR, gdt_bytes)?;
    memory.write_u64(IDT_ADDR, 0)?;
    Ok(())
}

/// Program a vCPU for 64-bit long mode, entering at `entry_point` with
/// RSP=0x8000 (§4.3 default).
///
/// The caller must have already installed the §4.5 CPUID filter on this
/// vCPU (`VmFd::create_vcpu(id, long_mode = true)`); this function only
/// programs MSRs and special/general registers.
pub fn setup(vcpu: &VcpuFd, memory: &GuestMemory, mem_size: u64, entry_point: u64) -> Result<(), BootError> {
    build_page_tables(memory, mem_size)?;
    build_gdt_idt(memory)?;

    if let Err(e) = vcpu.set_boot_msrs() {
        log::warn!(target: "boot", "boot MSR programming failed (continuing): {e}");
    }

    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)?;

    let code_seg = kvm_segment_from_gdt(GDT_TABLE[1], selectors::KERNEL_CODE);
    let data_seg = kvm_segment_from_gdt(GDT_TABLE[2], selectors::KERNEL_DATA);

    let mut sregs = vcpu.get_sregs()?;
    sregs.gdt.base = GDT_ADDR;
    sregs.gdt.limit = (GDT_TABLE.len() * 8 - 1) as u16;
    sregs.idt.base = IDT_ADDR;
    sregs.idt.limit = 0;
    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;

    // Order matters: PAE, then CR3, then EFER, then CR0 (§4.3).
    sregs.cr4 |= X86_CR4_PAE;
    sregs.cr3 = PML4_ADDR;
    sregs.efer |= EFER_LME | EFER_LMA;
    sregs.cr0 = X86_CR0_PE | X86_CR0_ET | X86_CR0_NE | X86_CR0_PG;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rsp: 0x8000,
        rip: entry_point,
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    vcpu.set_mp_state_runnable()?;

    log::info!(target: "boot", "vCPU: long mode, entry {entry_point:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_tables_cover_whole_slot() {
        let mem = GuestMemory::new(crate::memory::sizing::PAGING_MODE).unwrap();
        assert!(build_page_tables(&mem, mem.size()).is_ok());
    }

    #[test]
    fn entry_count_caps_at_512() {
        assert_eq!((1u64 << 40).div_ceil(TWO_MIB).min(512), 512);
    }
}
