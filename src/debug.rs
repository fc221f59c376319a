//! Exit-reason stringification, register/segment/IDT dumps, and the
//! single-step (DEBUG level `ALL`) tracker (§4.7 dispatcher logging,
//! §4.9.1 "Single-step (debug) mode").
//!
//! Grounded in `original_source/kvm-vmm-x86/src/debug.c`'s
//! `get_exit_reason_string`/`dump_*` routines: the original dumps to stderr
//! on every interesting exit; we keep the same fields but route them
//! through `log::debug!`/`log::trace!` instead of raw `fprintf`.

use crate::kvm::VcpuExit;
use crate::memory::GuestMemory;
use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

/// A human-readable name for a classified vCPU exit, for log lines.
pub fn exit_reason_name(exit: &VcpuExit) -> &'static str {
    match exit {
        VcpuExit::Io => "IO",
        VcpuExit::Hlt => "HLT",
        VcpuExit::Debug(_) => "DEBUG",
        VcpuExit::IrqWindowOpen => "IRQ_WINDOW_OPEN",
        VcpuExit::Shutdown => "SHUTDOWN",
        VcpuExit::FailEntry(_) => "FAIL_ENTRY",
        VcpuExit::InternalError(_) => "INTERNAL_ERROR",
        VcpuExit::SystemEvent(_) => "SYSTEM_EVENT",
        VcpuExit::Unknown(name) => name,
    }
}

fn dump_segment(tag: &str, seg: &kvm_segment) {
    log::debug!(
        target: "debug",
        "  {tag}: selector={:#06x} base={:#x} limit={:#x}",
        seg.selector, seg.base, seg.limit
    );
}

/// Dump general-purpose registers at `log::debug!`.
pub fn dump_regs(regs: &kvm_regs) {
    log::debug!(
        target: "debug",
        "regs: rip={:#x} rsp={:#x} rflags={:#x} rax={:#x} rbx={:#x} rcx={:#x} rdx={:#x} rsi={:#x} rdi={:#x}",
        regs.rip, regs.rsp, regs.rflags, regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi
    );
}

/// Dump segment registers and control registers at `log::debug!`.
pub fn dump_sregs(sregs: &kvm_sregs) {
    dump_segment("cs", &sregs.cs);
    dump_segment("ds", &sregs.ds);
    dump_segment("es", &sregs.es);
    dump_segment("ss", &sregs.ss);
    log::debug!(
        target: "debug",
        "cr0={:#x} cr3={:#x} cr4={:#x} efer={:#x}",
        sregs.cr0, sregs.cr3, sregs.cr4, sregs.efer
    );
    log::debug!(
        target: "debug",
        "gdt: base={:#x} limit={:#x}  idt: base={:#x} limit={:#x}",
        sregs.gdt.base, sregs.gdt.limit, sregs.idt.base, sregs.idt.limit
    );
}

/// Dump up to five key IDT vector entries (as raw 8-byte gate descriptors),
/// for a SHUTDOWN post-mortem.
pub fn dump_idt_entries(memory: &GuestMemory, idt_base: u64, vectors: &[u16]) {
    for &vector in vectors.iter().take(5) {
        let addr = idt_base + vector as u64 * 8;
        let mut buf = [0u8; 8];
        if memory.read(addr, &mut buf).is_ok() {
            log::debug!(
                target: "debug",
                "  idt[{vector}] @ {addr:#x} = {:#018x}",
                u64::from_le_bytes(buf)
            );
        }
    }
}

/// Architectural snapshot taken on a single-step DEBUG exit, kept around for
/// a SHUTDOWN post-mortem dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSnapshot {
    pub rip: u64,
    pub cs_base: u64,
    pub cr0: u64,
    pub rsi: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub es_selector: u16,
    pub es_base: u64,
    pub es_limit: u32,
    pub idt_base: u64,
    pub idt_limit: u16,
    pub bytes_at_rip: [u8; 4],
}

impl StepSnapshot {
    pub fn linear_rip(&self) -> u64 {
        self.cs_base.wrapping_add(self.rip)
    }

    pub fn capture(regs: &kvm_regs, sregs: &kvm_sregs, memory: &GuestMemory) -> Self {
        let linear = sregs.cs.base.wrapping_add(regs.rip);
        let mut bytes_at_rip = [0u8; 4];
        let _ = memory.read(linear, &mut bytes_at_rip);
        Self {
            rip: regs.rip,
            cs_base: sregs.cs.base,
            cr0: sregs.cr0,
            rsi: regs.rsi,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rflags: regs.rflags,
            es_selector: sregs.es.selector,
            es_base: sregs.es.base,
            es_limit: sregs.es.limit,
            idt_base: sregs.idt.base,
            idt_limit: sregs.idt.limit,
            bytes_at_rip,
        }
    }

    /// `true` when the next instruction is a `REP`/`REPZ` prefix (0xF2 or
    /// 0xF3): single-step should pause for one run so the repeated string
    /// operation completes at full speed (§4.9.1, §9 design note).
    pub fn next_is_rep_prefixed(&self) -> bool {
        matches!(self.bytes_at_rip[0], 0xf2 | 0xf3)
    }

    pub fn log(&self) {
        log::trace!(
            target: "debug",
            "step: rip={:#x} linear={:#x} cr0={:#x} rsi={:#x} rbx={:#x} rcx={:#x} rdi={:#x} rsp={:#x} rflags={:#x} bytes={:02x?}",
            self.rip, self.linear_rip(), self.cr0, self.rsi, self.rbx, self.rcx, self.rdi, self.rsp,
            self.rflags, self.bytes_at_rip
        );
    }
}

/// Per-vCPU single-step budget and pause state (§3 "Optional single-step
/// state", §4.9.1). Only constructed when the debug level is `ALL`.
pub struct SingleStep {
    pub remaining: u32,
    paused_for_rep: bool,
    pub exits: u64,
    pub last_snapshot: Option<StepSnapshot>,
}

impl SingleStep {
    /// Seed the budget at 2000 DEBUG exits (§4.9.1).
    pub fn new() -> Self {
        Self {
            remaining: 2000,
            paused_for_rep: false,
            exits: 0,
            last_snapshot: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Whether single-step should be re-armed on the *next* exit, after
    /// pausing for one run to let a REP-prefixed instruction finish.
    pub fn take_rep_pause(&mut self) -> bool {
        std::mem::replace(&mut self.paused_for_rep, false)
    }

    /// Record one DEBUG exit: log on a decaying schedule (every exit for the
    /// first 20, every 10th up to 200, every 100th after), decrement the
    /// budget, and arm a REP pause if warranted.
    pub fn record(&mut self, snapshot: StepSnapshot) {
        self.exits += 1;
        let should_log = match self.exits {
            n if n <= 20 => true,
            n if n <= 200 => n.is_multiple_of(10),
            n => n.is_multiple_of(100),
        };
        if should_log {
            snapshot.log();
        }
        self.paused_for_rep = snapshot.next_is_rep_prefixed();
        self.last_snapshot = Some(snapshot);
        self.remaining = self.remaining.saturating_sub(1);
    }
}

impl Default for SingleStep {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rep_prefix_is_detected() {
        let snap = StepSnapshot {
            bytes_at_rip: [0xf3, 0xa4, 0, 0],
            ..Default::default()
        };
        assert!(snap.next_is_rep_prefixed());
    }

    #[test]
    fn non_rep_prefix_is_not_detected() {
        let snap = StepSnapshot {
            bytes_at_rip: [0x90, 0, 0, 0],
            ..Default::default()
        };
        assert!(!snap.next_is_rep_prefixed());
    }

    #[test]
    fn budget_exhausts_after_2000_records() {
        let mut step = SingleStep::new();
        for _ in 0..2000 {
            step.record(StepSnapshot::default());
        }
        assert!(step.is_exhausted());
    }

    #[test]
    fn rep_pause_is_one_shot() {
        let mut step = SingleStep::new();
        step.record(StepSnapshot {
            bytes_at_rip: [0xf2, 0, 0, 0],
            ..Default::default()
        });
        assert!(step.take_rep_pause());
        assert!(!step.take_rep_pause());
    }

    #[test]
    fn linear_rip_adds_cs_base() {
        let snap = StepSnapshot {
            rip: 0x10,
            cs_base: 0x9_0000,
            ..Default::default()
        };
        assert_eq!(snap.linear_rip(), 0x9_0010);
    }
}
