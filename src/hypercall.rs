//! The guest hypercall ABI on port 0x500 (§4.8 "Hypercall and I/O
//! emulation"), grounded in `original_source/os-1k/kernel.c`'s
//! `putchar`/`getchar` syscall stubs: AL selects the call, BL carries the
//! PUTCHAR operand, and GETCHAR's result comes back on the very next IN from
//! the same port.

use crate::keyboard::KeyboardRing;
use thiserror::Error;

/// The fixed I/O port every guest hypercall goes through.
pub const PORT: u16 = 0x500;

pub mod op {
    pub const EXIT: u8 = 0x00;
    pub const PUTCHAR: u8 = 0x01;
    pub const GETCHAR: u8 = 0x02;
}

#[derive(Error, Debug)]
pub enum HypercallError {
    #[error("unknown hypercall 0x{al:02x} on vCPU {vcpu_id}")]
    UnknownCall { al: u8, vcpu_id: u64 },
}

/// What a hypercall OUT asks the host to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallEffect {
    /// `EXIT`: guest requests orderly shutdown.
    Exit,
    /// `PUTCHAR`: print this byte.
    Putchar(u8),
    /// `GETCHAR`: the result is now latched in `HypercallState`, to be read
    /// back on the paired IN.
    GetcharLatched,
}

/// The hypercall pairing state carried in each vCPU's context (§3 "Hypercall
/// pairing state"): an IN on the hypercall port only returns a meaningful
/// byte if the immediately preceding exit on the same vCPU was a GETCHAR
/// OUT.
#[derive(Debug, Default, Clone, Copy)]
pub struct HypercallState {
    pending_getchar: bool,
    getchar_result: i16,
}

impl HypercallState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_getchar(&self) -> bool {
        self.pending_getchar
    }
}

/// Handle an OUT to the hypercall port. `al` selects the call, `bl` carries
/// the PUTCHAR operand.
pub fn handle_out(
    state: &mut HypercallState,
    vcpu_id: u64,
    al: u8,
    bl: u8,
    keyboard: &KeyboardRing,
) -> Result<HypercallEffect, HypercallError> {
    match al {
        op::EXIT => Ok(HypercallEffect::Exit),
        op::PUTCHAR => Ok(HypercallEffect::Putchar(bl)),
        op::GETCHAR => {
            state.getchar_result = keyboard.pop().map(i16::from).unwrap_or(-1);
            state.pending_getchar = true;
            Ok(HypercallEffect::GetcharLatched)
        }
        _ => Err(HypercallError::UnknownCall { al, vcpu_id }),
    }
}

/// Handle an IN from the hypercall port. Returns the low byte of the
/// latched GETCHAR result (0xFF if the ring was empty), or 0 if there was no
/// pending GETCHAR to pair with (§3 invariant).
pub fn handle_in(state: &mut HypercallState) -> u8 {
    if !state.pending_getchar {
        return 0;
    }
    state.pending_getchar = false;
    if state.getchar_result < 0 {
        0xff
    } else {
        state.getchar_result as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getchar_pairs_out_then_in() {
        let keyboard = KeyboardRing::new();
        keyboard.push(b'Q');
        let mut state = HypercallState::new();

        let effect = handle_out(&mut state, 0, op::GETCHAR, 0, &keyboard).unwrap();
        assert_eq!(effect, HypercallEffect::GetcharLatched);
        assert!(state.pending_getchar());

        let byte = handle_in(&mut state);
        assert_eq!(byte, b'Q');
        assert!(!state.pending_getchar());
    }

    #[test]
    fn getchar_on_empty_ring_returns_0xff() {
        let keyboard = KeyboardRing::new();
        let mut state = HypercallState::new();
        handle_out(&mut state, 0, op::GETCHAR, 0, &keyboard).unwrap();
        assert_eq!(handle_in(&mut state), 0xff);
    }

    #[test]
    fn in_without_pending_getchar_returns_zero() {
        let mut state = HypercallState::new();
        assert_eq!(handle_in(&mut state), 0);
    }

    #[test]
    fn putchar_reports_the_byte() {
        let keyboard = KeyboardRing::new();
        let mut state = HypercallState::new();
        let effect = handle_out(&mut state, 0, op::PUTCHAR, b'X', &keyboard).unwrap();
        assert_eq!(effect, HypercallEffect::Putchar(b'X'));
    }

    #[test]
    fn unknown_call_is_an_error() {
        let keyboard = KeyboardRing::new();
        let mut state = HypercallState::new();
        assert!(handle_out(&mut state, 3, 0x7f, 0, &keyboard).is_err());
    }
}
