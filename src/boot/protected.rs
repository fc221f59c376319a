//! 32-bit protected mode with paging (§4.3 "Protected mode with 32-bit
//! paging", §3 "Page tables").
//!
//! Builds a page directory and two page tables identity-mapping the first
//! 4 MiB of guest memory and mirroring the same 4 MiB at virtual base
//! `0x8000_0000`, so a guest linked to run at its kernel high-half address
//! (the default `--entry 0x8000_1000`) finds its own code there.

use super::{gdt_entry, kvm_segment_from_gdt, selectors, BootError};
use crate::kvm::VcpuFd;
use crate::memory::GuestMemory;
use kvm_bindings::kvm_regs;

/// GDT/IDT location inside the vCPU's own memory slot.
pub const GDT_ADDR: u64 = 0x500;
const IDT_ADDR: u64 = GDT_ADDR + 5 * 8;

const PAGE_DIR_ADDR: u64 = 0x10_0000;
const PAGE_TABLE_IDENTITY_ADDR: u64 = PAGE_DIR_ADDR + 0x1000;
const PAGE_TABLE_MIRROR_ADDR: u64 = PAGE_DIR_ADDR + 0x2000;

/// Virtual base the identity-mapped 4 MiB is mirrored at (kernel high-half).
const MIRROR_VIRT_BASE: u64 = 0x8000_0000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_ET: u64 = 0x10;
const X86_CR0_PG: u64 = 0x8000_0000;

/// The five-entry GDT shared by the protected/long-mode guests (§3
/// "Descriptor tables"): null, kernel code, kernel data, user code, user
/// data. Only entries 1-2 are actually loaded by this minimal hypervisor
/// (nothing here switches to ring 3), but all five are materialized so the
/// table matches the documented layout.
const GDT_TABLE: [u64; 5] = [
    gdt_entry(0, 0, 0),
    gdt_entry(0xc09b, 0, 0xf_ffff), // kernel code: flat 4GiB, 32-bit, G=1
    gdt_entry(0xc093, 0, 0xf_ffff), // kernel data: flat 4GiB
    gdt_entry(0xc0fb, 0, 0xf_ffff), // user code, DPL=3
    gdt_entry(0xc0f3, 0, 0xf_ffff), // user data, DPL=3
];

fn build_page_tables(memory: &GuestMemory) -> Result<(), BootError> {
    // PD[0] -> identity page table, PD[MIRROR_VIRT_BASE >> 22] -> mirror table.
    memory.write_u32(PAGE_DIR_ADDR, (PAGE_TABLE_IDENTITY_ADDR as u32) | 0x3)?;
    let mirror_pde_index = (MIRROR_VIRT_BASE >> 22) as u64;
    memory.write_u32(
        PAGE_DIR_ADDR + mirror_pde_index * 4,
        (PAGE_TABLE_MIRROR_ADDR as u32) | 0x3,
    )?;

    // Both page tables map the same 1024 identity frames (Present + R/W).
    let mut pt = [0u32; 1024];
    for (i, entry) in pt.iter_mut().enumerate() {
        *entry = ((i as u32) << 12) | 0x3;
    }
    let pt_bytes =
        unsafe { std::slice::from_raw_parts(pt.as_ptr() as *const u8, pt.len() * 4) };
    memory.write(PAGE_TABLE_IDENTITY_ADDR, pt_bytes)?;
    memory.write(PAGE_TABLE_MIRROR_ADDR, pt_bytes)?;

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

/// Program a vCPU for 32-bit protected mode with paging, entering at
/// `entry_point` (the mirrored virtual address, by convention).
pub fn setup(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    entry_point: u64,
) -> Result<(), BootError> {
    build_page_tables(memory)?;
    build_gdt_idt(memory)?;

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

    sregs.cr0 = X86_CR0_PE | X86_CR0_ET | X86_CR0_PG;
    sregs.cr3 = PAGE_DIR_ADDR;
    sregs.cr4 = 0;
    sregs.efer = 0;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rip: entry_point,
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    vcpu.set_mp_state_runnable()?;

    log::info!(target: "boot", "vCPU: protected mode + paging, entry {entry_point:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_pde_index_is_512() {
        assert_eq!((MIRROR_VIRT_BASE >> 22) as u64, 512);
    }

    #[test]
    fn page_tables_fit_a_four_mib_slot() {
        let mem = GuestMemory::new(crate::memory::sizing::PAGING_MODE).unwrap();
        assert!(build_page_tables(&mem).is_ok());
    }

    #[test]
    fn identity_and_mirror_tables_share_frames() {
        let mem = GuestMemory::new(crate::memory::sizing::PAGING_MODE).unwrap();
        build_page_tables(&mem).unwrap();
        let a = mem.read_u8(PAGE_TABLE_IDENTITY_ADDR).unwrap();
        let b = mem.read_u8(PAGE_TABLE_MIRROR_ADDR).unwrap();
        assert_eq!(a, b);
        assert_eq!(a & 0x3, 0x3);
    }
}
