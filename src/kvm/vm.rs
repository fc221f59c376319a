//! Virtual machine creation and memory/vCPU registration.
//!
//! # Memory regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ mmap'd region│
//! │              │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! Four guest images share one VM, each in its own slot at
//! `guest_phys_base = id * mem_size` (§4.2), so each vCPU sees the same flat
//! layout as if it had the whole address space to itself.

use super::{KvmError, VcpuFd};
use kvm_bindings::{kvm_userspace_memory_region, CpuId};

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
    supported_cpuid: CpuId,
}

impl VmFd {
    /// Initialize required x86 VM-level state and wrap the VM handle.
    ///
    /// Sets the TSS address unconditionally (failure is logged, not fatal:
    /// the call only matters on Intel-like backends). Creates the in-kernel
    /// IRQ chip only when `want_irqchip` is set — pure hypercall guests have
    /// no IDT installed and would triple-fault on a spurious IRQ0, so the
    /// chip (and with it, any PIT) is never created for them. No PIT is ever
    /// created; nothing in this system relies on the legacy timer.
    pub fn new(
        vm: kvm_ioctls::VmFd,
        supported_cpuid: CpuId,
        want_irqchip: bool,
    ) -> Result<Self, KvmError> {
        if let Err(e) = vm.set_tss_address(super::TSS_ADDRESS as usize) {
            log::warn!(target: "kvm", "set_tss_address failed (non-fatal on this backend): {e}");
        }

        if want_irqchip {
            vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;
        }

        Ok(Self {
            vm,
            supported_cpuid,
        })
    }

    /// Register a guest memory region with KVM.
    ///
    /// # Safety
    ///
    /// The caller must ensure the host memory region outlives the VM and
    /// does not overlap with other registered slots.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(|source| KvmError::SetMemoryRegion { slot, source })
        }
    }

    /// Create a new virtual CPU and program its CPUID view.
    ///
    /// `long_mode` selects the §4.5 feature-bit filter (long-mode/Linux
    /// guests); real- and protected-mode guests never execute CPUID in a way
    /// this system cares about, so they keep the backend's default table.
    /// No KVM-clock paravirt leaves are added: this system never relies on
    /// the PIT or a paravirtualized clocksource (Non-goal: "no KVM clock").
    pub fn create_vcpu(&self, id: u64, long_mode: bool) -> Result<VcpuFd, KvmError> {
        let vcpu = self
            .vm
            .create_vcpu(id)
            .map_err(|source| KvmError::CreateVcpu { id, source })?;
        let vcpu = VcpuFd::new(vcpu);

        let cpuid = if long_mode {
            crate::cpuid::filter_for_long_mode(&self.supported_cpuid)
        } else {
            self.supported_cpuid.clone()
        };

        vcpu.set_cpuid2(&cpuid)?;
        log::debug!(
            target: "kvm",
            "vCPU {id}: installed {} CPUID entries (long_mode={long_mode})",
            cpuid.as_slice().len()
        );

        Ok(vcpu)
    }

    /// Pulse a line-triggered IRQ: raise it, then immediately lower it
    /// (§4.8 "Pulse IRQ 4"). Requires the in-kernel IRQ chip to have been
    /// created (Linux boot path only).
    pub fn pulse_irq_line(&self, irq: u32) -> Result<(), KvmError> {
        self.vm
            .set_irq_line(irq, true)
            .map_err(|source| KvmError::SetIrqLine { irq, source })?;
        self.vm
            .set_irq_line(irq, false)
            .map_err(|source| KvmError::SetIrqLine { irq, source })
    }
}
