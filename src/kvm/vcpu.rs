//! Virtual CPU management and execution.
//!
//! A vCPU wraps the KVM vCPU file descriptor and exposes the run loop: enter
//! guest mode, come back on a VM exit, dispatch I/O and MMIO synchronously
//! against a caller-supplied handler, and hand back a typed exit reason for
//! everything else. The dispatch policy itself (HLT terminates the thread,
//! SHUTDOWN dumps state, etc.) lives in `crate::runtime`; this module only
//! classifies the raw KVM exit.

use super::KvmError;
use kvm_bindings::{
    kvm_fpu, kvm_guest_debug, kvm_mp_state, kvm_msr_entry, kvm_regs, kvm_sregs,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_MP_STATE_RUNNABLE,
};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Maximum size for I/O operations (x86 supports 1, 2, or 4 byte I/O).
pub const MAX_IO_SIZE: usize = 4;

/// Fixed-size I/O data buffer to avoid heap allocation.
#[derive(Debug, Clone, Copy)]
pub struct IoData {
    data: [u8; MAX_IO_SIZE],
    len: u8,
}

impl IoData {
    #[inline]
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= MAX_IO_SIZE);
        Self {
            data: [0; MAX_IO_SIZE],
            len: len as u8,
        }
    }

    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_IO_SIZE);
        let mut data = [0u8; MAX_IO_SIZE];
        data[..len].copy_from_slice(&slice[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        self.data.get(index).filter(|_| index < self.len as usize).copied()
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: u8) {
        if index < self.len as usize {
            self.data[index] = value;
        }
    }

    #[inline]
    pub fn fill(&mut self, value: u8) {
        for i in 0..self.len as usize {
            self.data[i] = value;
        }
    }
}

impl Default for IoData {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Architectural state captured on a DEBUG (single-step) exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleStepExit {
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// Classified reasons a vCPU's `run()` can return.
#[derive(Debug)]
pub enum VcpuExit {
    /// An I/O or MMIO exit was handled inline by the supplied handler.
    Io,
    /// Guest executed HLT.
    Hlt,
    /// Single-step trap; carries the architectural state at the trap.
    Debug(SingleStepExit),
    /// Backend reports it can accept an injected interrupt (IRQ window / INTR window open).
    IrqWindowOpen,
    /// Guest requested shutdown (explicit, or triple fault).
    Shutdown,
    /// KVM could not enter guest mode; carries the hardware-specific reason code.
    FailEntry(u64),
    /// KVM internal error; carries the suberror code, if the backend reports one.
    InternalError(u32),
    /// System event (S3 sleep, reset, crash); carries the event type.
    SystemEvent(u32),
    /// Anything else, named for logging.
    Unknown(&'static str),
}

/// Handles guest port I/O (IN/OUT instructions).
pub trait IoHandler {
    fn io_read(&mut self, port: u16, data: &mut IoData);
    /// `regs` is the vCPU's general-purpose register file as of the exit,
    /// since a single-byte `OUT` only carries AL in `data` — operands in
    /// other registers (e.g. the hypercall ABI's BL) have to come from here.
    fn io_write(&mut self, port: u16, data: &IoData, regs: &kvm_regs);
}

/// Handles guest memory-mapped I/O.
pub trait MmioHandler {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]);
    fn mmio_write(&mut self, addr: u64, data: &[u8]);
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
}

impl VcpuFd {
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<(), KvmError> {
        self.vcpu.set_fpu(fpu).map_err(KvmError::SetRegisters)
    }

    pub fn set_cpuid2(&self, cpuid: &kvm_bindings::CpuId) -> Result<(), KvmError> {
        self.vcpu.set_cpuid2(cpuid).map_err(KvmError::SetCpuid)
    }

    /// Program the long-mode boot MSR batch (see `crate::msr::boot_entries`).
    /// Non-fatal on failure; the caller logs and continues per the boot contract.
    pub fn set_boot_msrs(&self) -> Result<(), KvmError> {
        let entries: Vec<kvm_msr_entry> = crate::msr::boot_entries();
        let msrs = kvm_bindings::Msrs::from_entries(&entries)
            .expect("static MSR batch always fits Msrs");
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
        log::debug!(target: "kvm", "programmed {} boot MSRs", entries.len());
        Ok(())
    }

    /// Set the MP state, e.g. to `KVM_MP_STATE_RUNNABLE` before first run.
    pub fn set_mp_state_runnable(&self) -> Result<(), KvmError> {
        let state = kvm_mp_state {
            mp_state: KVM_MP_STATE_RUNNABLE,
        };
        self.vcpu.set_mp_state(state).map_err(KvmError::SetMpState)
    }

    pub fn get_mp_state(&self) -> Result<kvm_mp_state, KvmError> {
        self.vcpu.get_mp_state().map_err(KvmError::SetMpState)
    }

    /// Enable or disable single-step guest debugging.
    pub fn set_guest_debug(&self, single_step: bool) -> Result<(), KvmError> {
        let control = if single_step {
            KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
        } else {
            0
        };
        let debug = kvm_guest_debug {
            control,
            ..Default::default()
        };
        self.vcpu
            .set_guest_debug(&debug)
            .map_err(KvmError::SetGuestDebug)
    }

    /// Run the vCPU until it exits, dispatching I/O/MMIO to `handler` inline.
    pub fn run_with_io<H: IoHandler + MmioHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::IoIn(port, data) => {
                let mut io_data = IoData::new(data.len());
                handler.io_read(port, &mut io_data);
                let copy_len = io_data.len().min(data.len());
                data[..copy_len].copy_from_slice(&io_data.as_slice()[..copy_len]);
                Ok(VcpuExit::Io)
            }
            KvmVcpuExit::IoOut(port, data) => {
                let io_data = IoData::from_slice(data);
                let regs = self.vcpu.get_regs().map_err(KvmError::GetRegisters)?;
                handler.io_write(port, &io_data, &regs);
                Ok(VcpuExit::Io)
            }
            KvmVcpuExit::MmioRead(addr, data) => {
                // Unmapped MMIO reads zero-fill; writes are silently ignored (§4.7).
                handler.mmio_read(addr, data);
                Ok(VcpuExit::Io)
            }
            KvmVcpuExit::MmioWrite(addr, data) => {
                handler.mmio_write(addr, data);
                Ok(VcpuExit::Io)
            }
            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError(0)),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::IrqWindowOpen),
            KvmVcpuExit::Debug(debug) => Ok(VcpuExit::Debug(SingleStepExit {
                pc: debug.arch.pc,
                dr6: debug.arch.dr6,
                dr7: debug.arch.dr7,
            })),
            KvmVcpuExit::Intr => Ok(VcpuExit::IrqWindowOpen),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown("Exception")),
            KvmVcpuExit::Hypercall(_) => Ok(VcpuExit::Unknown("Hypercall")),
            KvmVcpuExit::S390Sieic => Ok(VcpuExit::Unknown("S390Sieic")),
            KvmVcpuExit::S390Reset => Ok(VcpuExit::Unknown("S390Reset")),
            KvmVcpuExit::Dcr => Ok(VcpuExit::Unknown("Dcr")),
            KvmVcpuExit::Nmi => Ok(VcpuExit::Unknown("Nmi")),
            KvmVcpuExit::Watchdog => Ok(VcpuExit::Unknown("Watchdog")),
            KvmVcpuExit::Epr => Ok(VcpuExit::Unknown("Epr")),
            _ => Ok(VcpuExit::Unknown("Other")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_data_round_trips() {
        let d = IoData::from_slice(&[1, 2, 3, 4]);
        assert_eq!(d.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn io_data_truncates_to_max_size() {
        let d = IoData::from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(d.len(), MAX_IO_SIZE);
    }

    #[test]
    fn io_data_set_ignores_out_of_range() {
        let mut d = IoData::new(2);
        d.set(0, 0xaa);
        d.set(5, 0xbb);
        assert_eq!(d.as_slice(), &[0xaa, 0x00]);
    }

    #[test]
    fn io_data_fill_only_touches_valid_len() {
        let mut d = IoData::new(2);
        d.fill(0xff);
        assert_eq!(d.as_slice(), &[0xff, 0xff]);
    }
}
