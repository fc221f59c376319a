//! Per-vCPU thread runtime: the exit dispatcher (§4.7), hypercall/UART/
//! legacy I/O routing (§4.8), the single-step hook (§4.9.1), and the stdin
//! monitor thread that feeds the keyboard ring (§4.9).
//!
//! A vCPU's mutable state is split into two values that are never borrowed
//! together mutably through the same reference: the low-level `VcpuFd`
//! (borrowed for the blocking `run()` ioctl) and `VcpuState` (everything
//! else in §3's "vCPU context" data model, borrowed by the I/O handler).
//! Keeping them as separate locals is what lets the handler mutate
//! hypercall/single-step state while `run_with_io` still holds `&mut`
//! access to the vCPU fd.

use crate::console;
use crate::debug::{StepSnapshot, SingleStep};
use crate::devices::{Legacy, Serial, SERIAL_COM1_BASE, SERIAL_COM1_END, SERIAL_IRQ};
use crate::hypercall::{self, HypercallState};
use crate::keyboard::KeyboardRing;
use crate::kvm::{IoData, IoHandler, MmioHandler, VcpuExit, VcpuFd, VmFd};
use kvm_bindings::kvm_regs;
use crate::memory::GuestMemory;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Safety cap on non-paging (real-mode toy) guests: abort after this many
/// exits rather than spin forever on a guest that never halts (§4.7).
pub const NON_PAGING_EXIT_CAP: u64 = 100_000;

/// Errors a vCPU's run loop can terminate with (§7 "RuntimeExit").
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("vCPU {id}: {source}")]
    Kvm {
        id: u64,
        #[source]
        source: crate::kvm::KvmError,
    },
    #[error("vCPU {id}: hardware failed to enter guest mode (reason {reason:#x})")]
    FailEntry { id: u64, reason: u64 },
    #[error("vCPU {id}: KVM internal error (suberror {suberror:#x})")]
    InternalError { id: u64, suberror: u32 },
    #[error("vCPU {id}: unrecognized exit reason {reason}")]
    UnknownExit { id: u64, reason: &'static str },
    #[error("vCPU {id}: {source}")]
    Protocol {
        id: u64,
        #[source]
        source: hypercall::HypercallError,
    },
    #[error("vCPU {id}: exceeded the {cap}-exit safety cap for a non-paging guest")]
    ExitCapExceeded { id: u64, cap: u64 },
}

/// How a vCPU's run loop ended, when it ended without error (§7: a guest
/// triple fault is "a clean termination, not an error", but still abnormal
/// for the process exit code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// HLT or hypercall EXIT.
    Normal,
    /// Guest triple fault (SHUTDOWN exit).
    Shutdown,
}

impl RunOutcome {
    pub fn is_normal(self) -> bool {
        matches!(self, RunOutcome::Normal)
    }
}

/// Everything about a vCPU the I/O handler and dispatcher need, other than
/// the vCPU fd itself (§3 "vCPU context").
pub struct VcpuState {
    pub id: u64,
    pub memory: GuestMemory,
    pub display_name: String,
    pub use_paging: bool,
    pub running: Arc<AtomicBool>,
    pub exit_count: u64,
    pub hypercall: HypercallState,
    pub single_step: Option<SingleStep>,
}

impl VcpuState {
    pub fn new(id: u64, memory: GuestMemory, display_name: String, use_paging: bool) -> Self {
        Self {
            id,
            memory,
            display_name,
            use_paging,
            running: Arc::new(AtomicBool::new(false)),
            exit_count: 0,
            hypercall: HypercallState::new(),
            single_step: None,
        }
    }
}

/// State and handles shared, read-only (aside from internally-synchronized
/// devices), across every vCPU thread (§5 "Shared-resource policy").
#[derive(Clone)]
pub struct Shared {
    pub vm: Arc<VmFd>,
    pub keyboard: Arc<KeyboardRing>,
    pub serial: Arc<Mutex<Serial>>,
    pub legacy: Arc<Mutex<Legacy>>,
    pub n_vcpus: usize,
    pub debug_all: bool,
}

#[derive(Default)]
struct IoOutcome {
    error: Option<RuntimeError>,
    requested_exit: bool,
}

/// Adapts a vCPU's I/O exits onto the hypercall ABI, the UART, and the
/// legacy no-op ports (§4.8). Holds `&mut VcpuState` (not the vCPU fd) so it
/// can be passed to `VcpuFd::run_with_io` while `run()` still owns `&mut
/// VcpuFd` as a separate local.
struct DispatchIo<'a> {
    state: &'a mut VcpuState,
    shared: &'a Shared,
    outcome: IoOutcome,
}

impl IoHandler for DispatchIo<'_> {
    fn io_read(&mut self, port: u16, data: &mut IoData) {
        if port == hypercall::PORT {
            let byte = hypercall::handle_in(&mut self.state.hypercall);
            data.set(0, byte);
        } else if (SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&port) {
            let offset = port - SERIAL_COM1_BASE;
            let value = self
                .shared
                .serial
                .lock()
                .unwrap()
                .read(offset, &self.shared.keyboard);
            for i in 0..data.len() {
                data.set(i, value);
            }
        } else if Legacy::handles(port) {
            let value = self.shared.legacy.lock().unwrap().read(port);
            for i in 0..data.len() {
                data.set(i, value);
            }
        }
        // Any other port: IoData starts zero-filled already (§4.8 "unknown
        // ports return 0 on read").
    }

    fn io_write(&mut self, port: u16, data: &IoData, regs: &kvm_regs) {
        if port == hypercall::PORT {
            // The guest issues a single-byte `outb %al, %dx`, so `data` only
            // ever carries AL; the PUTCHAR operand in BL has to come from
            // the register file captured at the exit.
            let al = data.get(0).unwrap_or(0);
            let bl = (regs.rbx & 0xff) as u8;
            match hypercall::handle_out(&mut self.state.hypercall, self.state.id, al, bl, &self.shared.keyboard) {
                Ok(hypercall::HypercallEffect::Exit) => self.outcome.requested_exit = true,
                Ok(hypercall::HypercallEffect::Putchar(byte)) => {
                    console::write_guest_bytes(self.state.id, self.shared.n_vcpus, &[byte]);
                }
                Ok(hypercall::HypercallEffect::GetcharLatched) => {}
                Err(source) => {
                    self.outcome.error = Some(RuntimeError::Protocol {
                        id: self.state.id,
                        source,
                    });
                    self.outcome.requested_exit = true;
                }
            }
        } else if (SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&port) {
            let offset = port - SERIAL_COM1_BASE;
            let effect = self
                .shared
                .serial
                .lock()
                .unwrap()
                .write(offset, data.get(0).unwrap_or(0));
            if let Some(byte) = effect.emit_byte {
                console::write_guest_bytes(self.state.id, self.shared.n_vcpus, &[byte]);
            }
            if effect.pulse_irq4 {
                if let Err(e) = self.shared.vm.pulse_irq_line(SERIAL_IRQ) {
                    log::warn!(target: "io", "vCPU {}: IRQ4 pulse failed: {e}", self.state.id);
                }
            }
        } else if Legacy::handles(port) {
            self.shared
                .legacy
                .lock()
                .unwrap()
                .write(port, data.get(0).unwrap_or(0));
        }
        // Unknown ports: write accepted, nothing to do.
    }
}

impl MmioHandler for DispatchIo<'_> {
    fn mmio_read(&mut self, _addr: u64, data: &mut [u8]) {
        // Unmapped MMIO always reads as zero (§4.7); this system maps no
        // MMIO devices at all.
        data.fill(0);
    }

    fn mmio_write(&mut self, _addr: u64, _data: &[u8]) {
        // Writes to unmapped MMIO are ignored (§4.7).
    }
}

/// Run one vCPU to completion: enter the dispatch loop, handle every exit
/// per §4.7's table, and return how it ended.
pub fn run(mut vcpu: VcpuFd, mut state: VcpuState, shared: Shared) -> Result<RunOutcome, RuntimeError> {
    state.running.store(true, Ordering::SeqCst);

    if shared.debug_all {
        vcpu.set_guest_debug(true)
            .map_err(|source| RuntimeError::Kvm { id: state.id, source })?;
        state.single_step = Some(SingleStep::new());
    }
    let mut step_paused = false;

    let outcome = 'dispatch: loop {
        if step_paused {
            if vcpu.set_guest_debug(true).is_ok() {
                step_paused = false;
            }
        }

        let mut io = DispatchIo {
            state: &mut state,
            shared: &shared,
            outcome: IoOutcome::default(),
        };
        let exit = match vcpu.run_with_io(&mut io) {
            Ok(exit) => exit,
            Err(source) => break Err(RuntimeError::Kvm { id: state.id, source }),
        };
        let io_outcome = io.outcome;
        state.exit_count += 1;

        if let Some(err) = io_outcome.error {
            break Err(err);
        }
        if io_outcome.requested_exit {
            log::info!(
                target: "runtime",
                "vCPU {} ({}): hypercall EXIT after {} exits",
                state.id, state.display_name, state.exit_count
            );
            break Ok(RunOutcome::Normal);
        }

        match exit {
            VcpuExit::Io => {}
            VcpuExit::Hlt => {
                log::info!(
                    target: "runtime",
                    "vCPU {} ({}): HLT after {} exits",
                    state.id, state.display_name, state.exit_count
                );
                break Ok(RunOutcome::Normal);
            }
            VcpuExit::Debug(_) => {
                let regs = match vcpu.get_regs() {
                    Ok(r) => r,
                    Err(source) => break Err(RuntimeError::Kvm { id: state.id, source }),
                };
                let sregs = match vcpu.get_sregs() {
                    Ok(s) => s,
                    Err(source) => break Err(RuntimeError::Kvm { id: state.id, source }),
                };
                let snapshot = StepSnapshot::capture(&regs, &sregs, &state.memory);
                if let Some(step) = state.single_step.as_mut() {
                    step.record(snapshot);
                    if step.is_exhausted() {
                        let _ = vcpu.set_guest_debug(false);
                    } else if step.take_rep_pause() {
                        let _ = vcpu.set_guest_debug(false);
                        step_paused = true;
                    }
                }
            }
            VcpuExit::IrqWindowOpen => {}
            VcpuExit::Shutdown => {
                dump_shutdown(&vcpu, &state);
                break Ok(RunOutcome::Shutdown);
            }
            VcpuExit::FailEntry(reason) => break Err(RuntimeError::FailEntry { id: state.id, reason }),
            VcpuExit::InternalError(suberror) => {
                break Err(RuntimeError::InternalError { id: state.id, suberror })
            }
            VcpuExit::SystemEvent(_) => break Ok(RunOutcome::Normal),
            VcpuExit::Unknown(name) => break Err(RuntimeError::UnknownExit { id: state.id, reason: name }),
        }

        if !state.use_paging && state.exit_count >= NON_PAGING_EXIT_CAP {
            break Err(RuntimeError::ExitCapExceeded {
                id: state.id,
                cap: NON_PAGING_EXIT_CAP,
            });
        }
        continue 'dispatch;
    };

    state.running.store(false, Ordering::SeqCst);
    outcome
}

/// Guest triple fault: collect registers, segments, and (if single-stepping
/// was active) the last-step context plus a handful of IDT entries, so the
/// operator can see what the guest was doing (§4.7 SHUTDOWN, §4.9.1).
fn dump_shutdown(vcpu: &VcpuFd, state: &VcpuState) {
    log::warn!(
        target: "runtime",
        "vCPU {} ({}): guest triple fault (SHUTDOWN) after {} exits",
        state.id, state.display_name, state.exit_count
    );
    if let Ok(regs) = vcpu.get_regs() {
        crate::debug::dump_regs(&regs);
    }
    if let Ok(sregs) = vcpu.get_sregs() {
        crate::debug::dump_sregs(&sregs);
        if let Some(step) = &state.single_step {
            if let Some(snapshot) = step.last_snapshot {
                snapshot.log();
            }
        }
        crate::debug::dump_idt_entries(&state.memory, sregs.idt.base, &[0, 1, 2, 3, 4]);
    }
}

/// Spawn the stdin-monitor thread (§4.9, §5): polls stdin every 100 ms,
/// pushes each byte read into the keyboard ring, and — only in Linux-boot
/// mode — pulses IRQ 4 after each byte to wake the guest serial driver.
pub fn spawn_stdin_monitor(
    keyboard: Arc<KeyboardRing>,
    vm: Arc<VmFd>,
    pulse_on_byte: bool,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 1];
        let mut stdin = std::io::stdin();
        while !stop.load(Ordering::Relaxed) {
            if !poll_stdin_ready(Duration::from_millis(100)) {
                continue;
            }
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    keyboard.push(buf[0]);
                    if pulse_on_byte {
                        if let Err(e) = vm.pulse_irq_line(SERIAL_IRQ) {
                            log::warn!(target: "io", "stdin monitor: IRQ4 pulse failed: {e}");
                        }
                    }
                }
                Err(_) => break,
            }
        }
    })
}

#[cfg(target_os = "linux")]
fn poll_stdin_ready(timeout: Duration) -> bool {
    let mut fds = [libc::pollfd {
        fd: 0,
        events: libc::POLLIN,
        revents: 0,
    }];
    let ms = timeout.as_millis() as libc::c_int;
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, ms) };
    ret > 0 && (fds[0].revents & libc::POLLIN) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_outcome_normal_is_normal() {
        assert!(RunOutcome::Normal.is_normal());
        assert!(!RunOutcome::Shutdown.is_normal());
    }

    #[test]
    fn vcpu_state_starts_not_running() {
        let mem = GuestMemory::new(4096).unwrap();
        let state = VcpuState::new(0, mem, "test".into(), false);
        assert!(!state.running.load(Ordering::SeqCst));
        assert_eq!(state.exit_count, 0);
    }
}
