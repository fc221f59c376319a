//! Stub interrupt vector/descriptor tables installed for a Linux guest
//! before any BIOS or kernel IDT exists (§4.7.1).
//!
//! Real-mode code executed from the SETUP entry still expects BIOS-style
//! `INT 0x10/0x13/0x15/0x16/0x1A` services to return *something*; the
//! CODE32 entry's protected-mode payload can fault before it installs its
//! own IDT. Neither path gets a working BIOS or kernel handler here — only
//! enough of a stub to avoid an immediate triple fault during bring-up.

use crate::memory::GuestMemory;
use crate::boot::BootError;

const IRET_STUB: u64 = 0x1000;
const SUCCESS_STUB: u64 = 0x1100;
const FAILURE_STUB: u64 = 0x1200;
const PROTECTED_MODE_STUB: u64 = 0x7000;

const INTS_WITH_SUCCESS_STUB: [u8; 4] = [0x10, 0x15, 0x16, 0x1a];
const INT_WITH_FAILURE_STUB: u8 = 0x13;

/// `IRET` (0xCF) — the catch-all real-mode handler.
const IRET_CODE: &[u8] = &[0xcf];

/// `IRET` pops the FLAGS word pushed at interrupt entry, overwriting
/// whatever `clc`/`stc` did to the live flags — so CF has to be fixed up on
/// the stacked image instead. The real-mode INT frame from SP is
/// `[sp+0]=IP, [sp+2]=CS, [sp+4]=FLAGS`.
const SUCCESS_CODE: &[u8] = &[
    0x8b, 0xec, // mov bp, sp
    0x81, 0x66, 0x04, 0xfe, 0xff, // and word [bp+4], 0xfffe
    0x31, 0xc0, // xor ax, ax
    0xcf, // iret
];

const FAILURE_CODE: &[u8] = &[
    0x8b, 0xec, // mov bp, sp
    0x81, 0x4e, 0x04, 0x01, 0x00, // or word [bp+4], 0x0001
    0x31, 0xc0, // xor ax, ax
    0xcf, // iret
];

/// A minimal protected-mode fault handler: write 'E' to COM1, then halt.
/// Installed at `selector = __BOOT_CS` for all 256 IDT gates on the CODE32
/// entry path, so an early fault is at least visible instead of silently
/// resetting the vCPU. `out imm8, al` only reaches ports 0-0xff, so COM1
/// (0x3f8) needs DX loaded first.
const PROTECTED_MODE_HANDLER: &[u8] = &[
    0xb0, b'E', // mov al, 'E'
    0xba, 0xf8, 0x03, // mov dx, 0x3f8
    0xee, // out dx, al
    0xf4, // hlt
    0xeb, 0xfd, // jmp $-1 (in case HLT resumes via NMI)
];

/// Install the real-mode IVT at guest-physical 0..0x400 plus its three
/// stub handlers.
pub fn install_real_mode_ivt(memory: &GuestMemory) -> Result<(), BootError> {
    memory.write(IRET_STUB, IRET_CODE)?;
    memory.write(SUCCESS_STUB, SUCCESS_CODE)?;
    memory.write(FAILURE_STUB, FAILURE_CODE)?;

    for vector in 0u16..256 {
        let target = if vector == INT_WITH_FAILURE_STUB as u16 {
            FAILURE_STUB
        } else if INTS_WITH_SUCCESS_STUB.contains(&(vector as u8)) {
            SUCCESS_STUB
        } else {
            IRET_STUB
        };

        // Real-mode IVT entry: offset:segment, 4 bytes, little-endian.
        let offset = (target & 0xf) as u16;
        let segment = (target >> 4) as u16;
        let entry_addr = (vector as u64) * 4;
        memory.write_u16(entry_addr, offset)?;
        memory.write_u16(entry_addr + 2, segment)?;
    }

    Ok(())
}

/// Install a 256-entry protected-mode IDT at `idt_addr`, all gates pointing
/// to the minimal fault handler at 0x7000 via `code_selector`.
pub fn install_protected_mode_idt(
    memory: &GuestMemory,
    idt_addr: u64,
    code_selector: u16,
) -> Result<(), BootError> {
    memory.write(PROTECTED_MODE_STUB, PROTECTED_MODE_HANDLER)?;

    for vector in 0u64..256 {
        let gate = interrupt_gate(PROTECTED_MODE_STUB, code_selector);
        memory.write_u64(idt_addr + vector * 8, gate)?;
    }

    Ok(())
}

/// Build a 32-bit interrupt gate descriptor (present, DPL=0, type=0xE).
fn interrupt_gate(offset: u64, selector: u16) -> u64 {
    let offset = offset as u32;
    let low = (offset & 0xffff) as u64;
    let high = ((offset >> 16) & 0xffff) as u64;
    let selector = selector as u64;
    let flags: u64 = 0x8e00; // present, DPL=0, type=0xE (32-bit interrupt gate)

    low | (selector << 16) | (flags << 32) | (high << 48)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_stub_routed_for_int10() {
        let mem = GuestMemory::new(0x2_0000).unwrap();
        install_real_mode_ivt(&mem).unwrap();
        let entry_addr = 0x10u64 * 4;
        let offset = mem.read_u8(entry_addr).unwrap() as u16
            | ((mem.read_u8(entry_addr + 1).unwrap() as u16) << 8);
        let segment = mem.read_u8(entry_addr + 2).unwrap() as u16
            | ((mem.read_u8(entry_addr + 3).unwrap() as u16) << 8);
        let target = (segment as u64) * 16 + offset as u64;
        assert_eq!(target, SUCCESS_STUB);
    }

    #[test]
    fn failure_stub_routed_for_int13() {
        let mem = GuestMemory::new(0x2_0000).unwrap();
        install_real_mode_ivt(&mem).unwrap();
        let entry_addr = 0x13u64 * 4;
        let offset = mem.read_u8(entry_addr).unwrap() as u16
            | ((mem.read_u8(entry_addr + 1).unwrap() as u16) << 8);
        let segment = mem.read_u8(entry_addr + 2).unwrap() as u16
            | ((mem.read_u8(entry_addr + 3).unwrap() as u16) << 8);
        let target = (segment as u64) * 16 + offset as u64;
        assert_eq!(target, FAILURE_STUB);
    }

    #[test]
    fn other_vectors_route_to_iret() {
        let mem = GuestMemory::new(0x2_0000).unwrap();
        install_real_mode_ivt(&mem).unwrap();
        let entry_addr = 0x21u64 * 4;
        let offset = mem.read_u8(entry_addr).unwrap() as u16;
        let segment = mem.read_u8(entry_addr + 2).unwrap() as u16;
        assert_eq!((segment as u64) * 16 + offset as u64, IRET_STUB);
    }

    #[test]
    fn idt_gates_all_point_to_stub() {
        let mem = GuestMemory::new(0x2_0000).unwrap();
        install_protected_mode_idt(&mem, 0x1_0000, 0x10).unwrap();
        let gate = {
            let mut buf = [0u8; 8];
            mem.read(0x1_0000, &mut buf).unwrap();
            u64::from_le_bytes(buf)
        };
        let offset = (gate & 0xffff) | ((gate >> 32) & 0xffff_0000);
        assert_eq!(offset, PROTECTED_MODE_STUB);
    }
}
