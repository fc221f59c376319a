//! Thin, typed wrapper around the Linux KVM ioctl surface.
//!
//! This is the HV driver wrapper of the VMM: it opens `/dev/kvm`, verifies
//! the API version, creates the VM object, creates vCPU objects, and exposes
//! the ioctl verbs the rest of the crate needs (registers, special
//! registers, MSRs, CPUID, memory slots, the in-kernel IRQ chip, guest
//! debug, and the run loop itself). Every other module talks to KVM only
//! through here.
//!
//! Unlike a production hypervisor we never create a PIT or rely on the
//! local APIC timer: our guests are either real/protected-mode toy programs
//! that poll a hypercall port, or a Linux guest booted with `noapictimer`,
//! so an injected timer interrupt would only risk an early triple fault.
//! The in-kernel IRQ chip is still created for the Linux path, since the
//! serial driver's IRQ4 line needs somewhere to land — for hypercall-only
//! guests it is deliberately skipped (see spec Open Question ii).

mod vcpu;
mod vm;

pub use vcpu::{IoData, IoHandler, MmioHandler, SingleStepExit, VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Kvm;
use thiserror::Error;

/// Guest physical address used for the TSS scratch region required by Intel VT-x.
pub const TSS_ADDRESS: u64 = 0x0020_0000;

/// Errors that can occur during KVM operations. Each variant names the
/// failing verb, matching the error taxonomy's SetupError contract (which
/// verb, which mode).
#[derive(Error, Debug)]
pub enum KvmError {
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU {id}: {source}")]
    CreateVcpu { id: u64, source: kvm_ioctls::Error },

    #[error("failed to set user memory region (slot {slot}): {source}")]
    SetMemoryRegion { slot: u32, source: kvm_ioctls::Error },

    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("failed to create in-kernel IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),

    #[error("failed to set guest debug state: {0}")]
    SetGuestDebug(#[source] kvm_ioctls::Error),

    #[error("failed to set MP state: {0}")]
    SetMpState(#[source] kvm_ioctls::Error),

    #[error("failed to raise IRQ line {irq}: {source}")]
    SetIrqLine { irq: u32, source: kvm_ioctls::Error },

    #[error("KVM API version mismatch: expected {expected}, got {got}")]
    UnsupportedApiVersion { expected: i32, got: i32 },
}

/// The stable KVM ABI version this crate is written against.
const KVM_API_VERSION: i32 = 12;

/// Open `/dev/kvm`, verify the API version and create a new VM.
///
/// `want_irqchip` requests the in-kernel PIC/IOAPIC; it is only set for the
/// Linux boot path (see module docs).
pub fn create_vm(want_irqchip: bool) -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

    let api_version = kvm.get_api_version();
    log::debug!(target: "kvm", "KVM API version: {api_version}");
    if api_version != KVM_API_VERSION {
        return Err(KvmError::UnsupportedApiVersion {
            expected: KVM_API_VERSION,
            got: api_version,
        });
    }

    let supported_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)?;

    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;

    VmFd::new(vm, supported_cpuid, want_irqchip)
}
