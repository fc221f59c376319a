//! Linux bzImage boot (§4.4): parses the image, assembles the zero page,
//! then dispatches to one of three entry strategies depending on what the
//! caller asked for and what the kernel itself supports.

pub mod bzimage;
pub mod ivt;
pub mod params;

use super::{gdt_entry, kvm_segment_from_gdt, BootError};
use crate::kvm::VcpuFd;
use crate::memory::GuestMemory;
use kvm_bindings::kvm_regs;

/// Real-mode setup entry point (`0x9000:0x0200`, per the bzImage convention
/// of starting 0x200 bytes into the loaded setup code).
const SETUP_CS: u16 = 0x9000;
const SETUP_IP: u16 = 0x0200;
const SETUP_RSP: u64 = 0x9_ff00;

const LINUX_CODE_SELECTOR: u16 = 0x10;
const LINUX_DATA_SELECTOR: u16 = 0x18;

/// GDT location for the CODE32 entry (flat, no paging).
const CODE32_GDT_ADDR: u64 = 0x500;
/// GDT location for the BOOT64 entry (per the guest memory layout table).
const BOOT64_GDT_ADDR: u64 = 0x5000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_ET: u64 = 0x10;

/// Which of the kernel's three entry points to boot through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStrategy {
    Setup,
    Code32,
    Boot64,
}

/// Where to point RSI for the CODE32/BOOT64 entries: at the zero page's own
/// base, or at the embedded setup header within it (some kernels expect the
/// latter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsiMode {
    Base,
    Hdr,
}

const ZERO_PAGE_HDR_OFFSET: u64 = 0x1f1;

/// Boot a Linux kernel image into `memory` on `vcpu`.
#[allow(clippy::too_many_arguments)]
pub fn boot(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    mem_size: u64,
    kernel_path: &str,
    strategy: EntryStrategy,
    rsi_mode: RsiMode,
    cmdline: Option<&str>,
    initrd: Option<&[u8]>,
) -> Result<(), BootError> {
    let kernel = bzimage::load(memory, kernel_path)?;
    params::write_zero_page(memory, &kernel, cmdline)?;
    params::write_e820_map(memory, mem_size)?;

    if let Some(data) = initrd {
        params::place_initrd(
            memory,
            mem_size,
            0x37ff_ffff,
            bzimage::KERNEL_LOAD_ADDR + kernel.init_size,
            data,
        )?;
    }

    let zero_page_base = params::BOOT_PARAMS_START;
    let rsi = match rsi_mode {
        RsiMode::Base => zero_page_base,
        RsiMode::Hdr => zero_page_base + ZERO_PAGE_HDR_OFFSET,
    };

    match strategy {
        EntryStrategy::Setup => setup_entry(vcpu, memory),
        EntryStrategy::Code32 => code32_entry(vcpu, memory, kernel.code32_start as u64, rsi),
        EntryStrategy::Boot64 => {
            if !kernel.supports_boot64() {
                return Err(BootError::InvalidKernel(
                    "kernel does not advertise XLF_KERNEL_64 support".into(),
                ));
            }
            boot64_entry(vcpu, memory, mem_size, kernel.code32_start as u64 + 0x200, rsi)
        }
    }
}

/// SETUP entry: real mode at `0x9000:0x0200`, DS=CS, RSP=0x9FF00.
fn setup_entry(vcpu: &VcpuFd, memory: &GuestMemory) -> Result<(), BootError> {
    ivt::install_real_mode_ivt(memory)?;

    let cs_base = (SETUP_CS as u64) << 4;
    let segment = kvm_bindings::kvm_segment {
        base: cs_base,
        limit: 0xffff,
        selector: SETUP_CS,
        type_: 0x3,
        present: 1,
        s: 1,
        ..Default::default()
    };

    let mut sregs = vcpu.get_sregs()?;
    sregs.cs = segment;
    sregs.ds = segment;
    sregs.es = segment;
    sregs.fs = segment;
    sregs.gs = segment;
    sregs.ss = segment;
    sregs.cr0 = X86_CR0_ET;
    sregs.cr3 = 0;
    sregs.cr4 = 0;
    sregs.efer = 0;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rip: SETUP_IP as u64,
        rsp: SETUP_RSP,
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    vcpu.set_mp_state_runnable()?;

    log::info!(target: "boot", "Linux SETUP entry at {SETUP_CS:#06x}:{SETUP_IP:#06x}");
    Ok(())
}

/// CODE32 entry: protected mode, no paging, flat `__BOOT_CS`/`__BOOT_DS`.
fn code32_entry(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    entry_point: u64,
    rsi: u64,
) -> Result<(), BootError> {
    let gdt_table: [u64; 4] = [
        gdt_entry(0, 0, 0),
        gdt_entry(0, 0, 0),
        gdt_entry(0xc09b, 0, 0xf_ffff),
        gdt_entry(0xc093, 0, 0xf_ffff),
    ];
    let gdt_bytes: &[u8] =
        unsafe { std::slice::from_raw_parts(gdt_table.as_ptr() as *const u8, gdt_table.len() * 8) };
    memory.write(CODE32_GDT_ADDR, gdt_bytes)?;

    let idt_addr = CODE32_GDT_ADDR + gdt_bytes.len() as u64;
    ivt::install_protected_mode_idt(memory, idt_addr, LINUX_CODE_SELECTOR)?;

    let code_seg = kvm_segment_from_gdt(gdt_table[2], LINUX_CODE_SELECTOR);
    let data_seg = kvm_segment_from_gdt(gdt_table[3], LINUX_DATA_SELECTOR);

    let mut sregs = vcpu.get_sregs()?;
    sregs.gdt.base = CODE32_GDT_ADDR;
    sregs.gdt.limit = (gdt_table.len() * 8 - 1) as u16;
    sregs.idt.base = idt_addr;
    sregs.idt.limit = 256 * 8 - 1;
    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;
    sregs.cr0 = X86_CR0_PE | X86_CR0_ET;
    sregs.cr3 = 0;
    sregs.cr4 = 0;
    sregs.efer = 0;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rip: entry_point,
        rsi,
        rsp: SETUP_RSP,
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    vcpu.set_mp_state_runnable()?;

    log::info!(target: "boot", "Linux CODE32 entry at {entry_point:#x}, rsi={rsi:#x}");
    Ok(())
}

/// BOOT64 entry: long mode at `code32_start + 0x200`, paging built the same
/// way as the generic long-mode path but at the Linux-specific GDT address.
fn boot64_entry(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    mem_size: u64,
    entry_point: u64,
    rsi: u64,
) -> Result<(), BootError> {
    super::longmode::build_page_tables_at(memory, mem_size, super::longmode::PML4_ADDR)?;

    let gdt_table: [u64; 4] = [
        gdt_entry(0, 0, 0),
        gdt_entry(0, 0, 0),
        gdt_entry(0xa09b, 0, 0xf_ffff),
        gdt_entry(0xc093, 0, 0xf_ffff),
    ];
    let gdt_bytes: &[u8] =
        unsafe { std::slice::from_raw_parts(gdt_table.as_ptr() as *const u8, gdt_table.len() * 8) };
    memory.write(BOOT64_GDT_ADDR, gdt_bytes)?;

    if let Err(e) = vcpu.set_boot_msrs() {
        log::warn!(target: "boot", "boot MSR programming failed (continuing): {e}");
    }

    let code_seg = kvm_segment_from_gdt(gdt_table[2], LINUX_CODE_SELECTOR);
    let data_seg = kvm_segment_from_gdt(gdt_table[3], LINUX_DATA_SELECTOR);

    let mut sregs = vcpu.get_sregs()?;
    sregs.gdt.base = BOOT64_GDT_ADDR;
    sregs.gdt.limit = (gdt_table.len() * 8 - 1) as u16;
    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;

    sregs.cr4 |= 0x20; // PAE
    sregs.cr3 = super::longmode::PML4_ADDR;
    sregs.efer |= 0x100 | 0x400; // LME | LMA
    sregs.cr0 = X86_CR0_PE | X86_CR0_ET | 0x20 | 0x8000_0000; // PE|ET|NE|PG
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rip: entry_point,
        rsi,
        rsp: SETUP_RSP,
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    vcpu.set_mp_state_runnable()?;

    log::info!(target: "boot", "Linux BOOT64 entry at {entry_point:#x}, rsi={rsi:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_cs_ip_match_convention() {
        assert_eq!(SETUP_CS, 0x9000);
        assert_eq!(SETUP_IP, 0x0200);
    }

    #[test]
    fn linux_selectors_are_0x10_and_0x18() {
        assert_eq!(LINUX_CODE_SELECTOR, 0x10);
        assert_eq!(LINUX_DATA_SELECTOR, 0x18);
    }

    #[test]
    fn rsi_hdr_mode_points_past_zero_page_base() {
        let base = params::BOOT_PARAMS_START;
        let hdr = base + ZERO_PAGE_HDR_OFFSET;
        assert!(hdr > base);
    }
}
