//! Real-mode setup for 16-bit toy guests (§4.3 "Real mode").
//!
//! Grounded in the earliest bring-up path in the original `kvm-vmm-x86`
//! prototype: CS is a flat-but-based real-mode segment so that four vCPUs
//! can each own a private 256 KiB slice of the 1 MiB real-mode address
//! space, RIP starts at zero, and no paging or protected-mode state is
//! touched at all.

use super::BootError;
use crate::kvm::VcpuFd;
use crate::memory::GuestMemory;
use kvm_bindings::kvm_segment;

const X86_CR0_ET: u64 = 0x10;

fn real_mode_segment(base: u32, selector: u16) -> kvm_segment {
    kvm_segment {
        base: base as u64,
        limit: 0xffff,
        selector,
        type_: 0x3,
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 0,
        g: 0,
        ..Default::default()
    }
}

/// Program a vCPU for real-mode execution at `id * mem_size`.
///
/// CS base is the vCPU's guest-physical base (so CS:IP = 0 lands at the
/// start of its own memory slot); every other segment is based at zero.
/// Paging is off, CR0 carries only the Extension-Type bit, EFER is zero.
pub fn setup(vcpu: &VcpuFd, id: u64, mem_size: u64) -> Result<(), BootError> {
    let cs_base = id * mem_size;
    let cs_selector = (cs_base / 16) as u16;

    let mut sregs = vcpu.get_sregs()?;
    sregs.cs = real_mode_segment(cs_base as u32, cs_selector);
    sregs.ds = real_mode_segment(0, 0);
    sregs.es = real_mode_segment(0, 0);
    sregs.fs = real_mode_segment(0, 0);
    sregs.gs = real_mode_segment(0, 0);
    sregs.ss = real_mode_segment(0, 0);
    sregs.cr0 = X86_CR0_ET;
    sregs.cr3 = 0;
    sregs.cr4 = 0;
    sregs.efer = 0;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_bindings::kvm_regs {
        rip: 0,
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    vcpu.set_mp_state_runnable()?;

    log::info!(
        target: "boot",
        "vCPU {id}: real mode, CS base {cs_base:#x}, RIP=0"
    );
    Ok(())
}

/// Load a raw real-mode image at guest-physical `load_offset` within the
/// vCPU's own memory slot.
pub fn load_image(memory: &GuestMemory, load_offset: u64, image: &[u8]) -> Result<(), BootError> {
    memory.load_image(load_offset, image)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cs_base_matches_vcpu_slot() {
        let mem_size = crate::memory::sizing::REAL_MODE;
        for id in 0..4u64 {
            let cs_base = id * mem_size;
            assert_eq!(cs_base % 16, 0, "CS base must be selector-representable");
        }
    }

    #[test]
    fn load_fits_in_slot() {
        let mem = GuestMemory::new(crate::memory::sizing::REAL_MODE).unwrap();
        let image = vec![0x90u8; 512];
        assert!(load_image(&mem, 0, &image).is_ok());
    }
}
