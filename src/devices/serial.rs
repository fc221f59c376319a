//! 16550 UART emulation for COM1 (`0x3F8..0x3FF`), §4.8 "16550 UART".
//!
//! Output bytes are handed back to the caller (rather than written here
//! directly) so the vCPU thread can serialize them through the
//! color-multiplexed console (§4.9); input comes from the process-wide
//! keyboard ring. The device itself only tracks register state and decides,
//! per the spec's register table, whether a write should pulse IRQ 4.

use crate::keyboard::KeyboardRing;

/// Register offsets from the COM1 base.
mod offset {
    pub const THR_RBR_DLL: u16 = 0;
    pub const IER_DLH: u16 = 1;
    pub const IIR: u16 = 2;
    pub const LCR: u16 = 3;
    pub const MCR: u16 = 4;
    pub const LSR: u16 = 5;
    pub const MSR: u16 = 6;
    pub const SCR: u16 = 7;
}

const LCR_DLAB: u8 = 0x80;
const IER_RDA: u8 = 0x01;
const IER_THRE: u8 = 0x02;

/// Result of a register write: whether IRQ 4 should be pulsed (raised then
/// lowered) and, for the THR, the byte that was written so the caller can
/// print it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialWriteEffect {
    pub pulse_irq4: bool,
    pub emit_byte: Option<u8>,
}

/// 16550-compatible UART, COM1 subset.
pub struct Serial {
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    dll: u8,
    dlh: u8,
    /// Whether the guest's serial driver expects an RX IRQ pulse at all
    /// (only the Linux path wires up a PIC/IDT that can take one; real- and
    /// protected-mode toy guests never enable this and would triple-fault).
    linux_serial_irq: bool,
}

impl Serial {
    pub fn new(linux_serial_irq: bool) -> Self {
        Self {
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            dll: 0,
            dlh: 0,
            linux_serial_irq,
        }
    }

    fn dlab(&self) -> bool {
        self.lcr & LCR_DLAB != 0
    }

    fn rda_enabled(&self) -> bool {
        self.ier & IER_RDA != 0
    }

    fn thre_enabled(&self) -> bool {
        self.ier & IER_THRE != 0
    }

    /// Handle a read at `offset` (0-7 from the COM1 base).
    pub fn read(&self, offset: u16, keyboard: &KeyboardRing) -> u8 {
        match offset {
            offset::THR_RBR_DLL if self.dlab() => self.dll,
            offset::THR_RBR_DLL => keyboard.pop().unwrap_or(0),
            offset::IER_DLH if self.dlab() => self.dlh,
            offset::IER_DLH => self.ier,
            offset::IIR => {
                let rx_pending = !keyboard.is_empty();
                if rx_pending && self.rda_enabled() {
                    0x04
                } else if self.thre_enabled() {
                    0x02
                } else {
                    0x01
                }
            }
            offset::LCR => self.lcr,
            offset::MCR => self.mcr,
            offset::LSR => {
                let rx_pending = !keyboard.is_empty();
                0x60 | if rx_pending { 0x01 } else { 0x00 }
            }
            offset::MSR => 0,
            offset::SCR => self.scr,
            _ => 0,
        }
    }

    /// Handle a write at `offset`. Returns whether to pulse IRQ 4 and, for
    /// the THR, the byte to emit to the host console.
    pub fn write(&mut self, offset: u16, value: u8) -> SerialWriteEffect {
        match offset {
            offset::THR_RBR_DLL if self.dlab() => {
                self.dll = value;
                SerialWriteEffect::default()
            }
            offset::THR_RBR_DLL => SerialWriteEffect {
                pulse_irq4: self.thre_enabled() && self.linux_serial_irq,
                emit_byte: Some(value),
            },
            offset::IER_DLH if self.dlab() => {
                self.dlh = value;
                SerialWriteEffect::default()
            }
            offset::IER_DLH => {
                self.ier = value;
                SerialWriteEffect {
                    pulse_irq4: self.thre_enabled() && self.linux_serial_irq,
                    emit_byte: None,
                }
            }
            offset::LCR => {
                self.lcr = value;
                SerialWriteEffect::default()
            }
            offset::MCR => {
                self.mcr = value;
                SerialWriteEffect::default()
            }
            offset::SCR => {
                self.scr = value;
                SerialWriteEffect::default()
            }
            _ => SerialWriteEffect::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlab_round_trips_divisor_latch() {
        let mut serial = Serial::new(false);
        serial.write(offset::LCR, LCR_DLAB);
        serial.write(offset::THR_RBR_DLL, 0x42);
        serial.write(offset::IER_DLH, 0x24);
        serial.write(offset::LCR, 0);

        serial.write(offset::LCR, LCR_DLAB);
        let keyboard = KeyboardRing::new();
        assert_eq!(serial.read(offset::THR_RBR_DLL, &keyboard), 0x42);
        assert_eq!(serial.read(offset::IER_DLH, &keyboard), 0x24);
    }

    #[test]
    fn lsr_reports_data_ready_when_keyboard_nonempty() {
        let serial = Serial::new(false);
        let keyboard = KeyboardRing::new();
        assert_eq!(serial.read(offset::LSR, &keyboard), 0x60);
        keyboard.push(b'x');
        assert_eq!(serial.read(offset::LSR, &keyboard), 0x61);
    }

    #[test]
    fn rbr_read_pops_keyboard_ring() {
        let serial = Serial::new(false);
        let keyboard = KeyboardRing::new();
        keyboard.push(b'q');
        assert_eq!(serial.read(offset::THR_RBR_DLL, &keyboard), b'q');
        assert_eq!(serial.read(offset::THR_RBR_DLL, &keyboard), 0);
    }

    #[test]
    fn iir_prioritizes_rda_over_thre() {
        let mut serial = Serial::new(false);
        serial.write(offset::IER_DLH, IER_RDA | IER_THRE);
        let keyboard = KeyboardRing::new();
        keyboard.push(b'z');
        assert_eq!(serial.read(offset::IIR, &keyboard), 0x04);
    }

    #[test]
    fn iir_is_thre_when_no_rx_pending() {
        let mut serial = Serial::new(false);
        serial.write(offset::IER_DLH, IER_THRE);
        let keyboard = KeyboardRing::new();
        assert_eq!(serial.read(offset::IIR, &keyboard), 0x02);
    }

    #[test]
    fn iir_is_none_pending_by_default() {
        let serial = Serial::new(false);
        let keyboard = KeyboardRing::new();
        assert_eq!(serial.read(offset::IIR, &keyboard), 0x01);
    }

    #[test]
    fn thr_write_pulses_only_in_linux_mode_with_thre_enabled() {
        let mut serial = Serial::new(true);
        serial.write(offset::IER_DLH, IER_THRE);
        let effect = serial.write(offset::THR_RBR_DLL, b'A');
        assert!(effect.pulse_irq4);
        assert_eq!(effect.emit_byte, Some(b'A'));

        let mut serial = Serial::new(false);
        serial.write(offset::IER_DLH, IER_THRE);
        let effect = serial.write(offset::THR_RBR_DLL, b'A');
        assert!(!effect.pulse_irq4);
    }
}
