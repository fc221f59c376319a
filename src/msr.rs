//! MSR indices and the boot-time batch programmed before entering long mode.

use kvm_bindings::kvm_msr_entry;

/// EFER and SYSCALL/SWAPGS-related MSR indices used during long-mode bring-up.
pub mod ids {
    /// Extended Feature Enable Register.
    pub const IA32_EFER: u32 = 0xc000_0080;
    /// Segment selectors for SYSCALL/SYSRET.
    pub const STAR: u32 = 0xc000_0081;
    /// Long-mode SYSCALL target RIP.
    pub const LSTAR: u32 = 0xc000_0082;
    /// Compatibility-mode SYSCALL target RIP.
    pub const CSTAR: u32 = 0xc000_0083;
    /// RFLAGS mask applied on SYSCALL entry.
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    /// Base of the %fs segment.
    pub const FS_BASE: u32 = 0xc000_0100;
    /// Base of the %gs segment.
    pub const GS_BASE: u32 = 0xc000_0101;
    /// Swap target for the SWAPGS instruction.
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
}

mod efer {
    pub const LME: u64 = 1 << 8;
    pub const SCE: u64 = 1 << 0;
    pub const NXE: u64 = 1 << 11;
}

/// Build the MSR batch programmed on a vCPU before it enters long mode.
///
/// `EFER` carries `LME|SCE|NXE`; the SYSCALL/SWAPGS MSRs are left at zero —
/// the guest kernel reprograms them during its own boot.
pub fn boot_entries() -> Vec<kvm_msr_entry> {
    let entry = |index: u32, data: u64| kvm_msr_entry {
        index,
        data,
        ..Default::default()
    };

    vec![
        entry(ids::IA32_EFER, efer::LME | efer::SCE | efer::NXE),
        entry(ids::STAR, 0),
        entry(ids::LSTAR, 0),
        entry(ids::CSTAR, 0),
        entry(ids::SYSCALL_MASK, 0),
        entry(ids::FS_BASE, 0),
        entry(ids::GS_BASE, 0),
        entry(ids::KERNEL_GS_BASE, 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efer_carries_lme_sce_nxe() {
        let entries = boot_entries();
        let efer = entries
            .iter()
            .find(|e| e.index == ids::IA32_EFER)
            .unwrap();
        assert_eq!(efer.data, efer::LME | efer::SCE | efer::NXE);
    }

    #[test]
    fn syscall_msrs_are_zeroed() {
        let entries = boot_entries();
        for idx in [ids::STAR, ids::LSTAR, ids::CSTAR, ids::SYSCALL_MASK] {
            let e = entries.iter().find(|e| e.index == idx).unwrap();
            assert_eq!(e.data, 0);
        }
    }

    #[test]
    fn batch_has_eight_entries() {
        assert_eq!(boot_entries().len(), 8);
    }
}
