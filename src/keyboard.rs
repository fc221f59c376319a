//! Process-wide keyboard ring buffer shared by the stdin monitor thread and
//! every vCPU's GETCHAR hypercall/UART-RX handler (§3 "Keyboard ring
//! buffer").
//!
//! Single-producer (the stdin monitor thread), multi-consumer (vCPU
//! threads) FIFO. A push on a full ring drops the newest byte rather than
//! blocking or evicting the oldest (§7 "Recovery": "Keyboard ring overflow
//! silently drops the newest byte").

use std::sync::Mutex;

const CAPACITY: usize = 256;

struct Ring {
    buf: [u8; CAPACITY],
    head: usize,
    tail: usize,
}

impl Ring {
    const fn new() -> Self {
        Self {
            buf: [0; CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn push(&mut self, byte: u8) {
        let next = (self.tail + 1) % CAPACITY;
        if next == self.head {
            return; // full: drop the newest byte
        }
        self.buf[self.tail] = byte;
        self.tail = next;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % CAPACITY;
        Some(byte)
    }
}

/// A bounded FIFO of bytes typed at the host's stdin, mutex-protected so the
/// head-increment (pop, from any vCPU thread) and tail-increment (push, from
/// the stdin monitor thread) stay atomic with respect to each other.
pub struct KeyboardRing {
    inner: Mutex<Ring>,
}

impl KeyboardRing {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Ring::new()),
        }
    }

    pub fn push(&self, byte: u8) {
        self.inner.lock().unwrap().push(byte);
    }

    /// Pop one byte, or `None` if the ring is empty.
    pub fn pop(&self) -> Option<u8> {
        self.inner.lock().unwrap().pop()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for KeyboardRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_on_empty_ring_is_none() {
        let ring = KeyboardRing::new();
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let ring = KeyboardRing::new();
        ring.push(b'a');
        ring.push(b'b');
        assert_eq!(ring.pop(), Some(b'a'));
        assert_eq!(ring.pop(), Some(b'b'));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn overflow_drops_newest_byte() {
        let ring = KeyboardRing::new();
        for i in 0..CAPACITY + 10 {
            ring.push(i as u8);
        }
        // First byte pushed is still there; the tail-end pushes were dropped.
        assert_eq!(ring.pop(), Some(0));
    }
}
