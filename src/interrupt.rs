//! The interrupt controller: owns the interrupt-vector
//! memory region and the latched device pins, and raises CPU interrupt
//! lines. Grounded on `dev/basicinterruptcontroller.cpp`, which is itself a
//! thin wrapper: reserve the vector region at init, forward
//! `interrupt(line)` straight to the master CPU.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const NUM_INTERRUPT_LINES: u32 = 32;

/// The CPU's pending-interrupt bitset, shared with every device thread that
/// can raise a line. One bit per line, lock-free.
#[derive(Default)]
pub struct InterruptLines(AtomicU32);

impl InterruptLines {
    pub fn new() -> Arc<Self> {
        Arc::new(InterruptLines(AtomicU32::new(0)))
    }

    pub fn raise(&self, line: u32) {
        self.0.fetch_or(1 << line, Ordering::SeqCst);
    }

    pub fn clear(&self, line: u32) {
        self.0.fetch_and(!(1 << line), Ordering::SeqCst);
    }

    /// The lowest-index pending line, if any.
    pub fn lowest_pending(&self) -> Option<u32> {
        let bits = self.0.load(Ordering::SeqCst);
        if bits == 0 {
            None
        } else {
            Some(bits.trailing_zeros())
        }
    }
}

/// Owns the interrupt-vector region and the latched I/O pins (keyboard
/// scancode, etc.) that `read` consults.
pub struct InterruptController {
    vector_address: usize,
    pins: Mutex<Vec<u32>>,
    lines: Arc<InterruptLines>,
}

impl InterruptController {
    pub fn new(vector_address: usize, lines: Arc<InterruptLines>) -> Self {
        InterruptController { vector_address, pins: Mutex::new(vec![0; NUM_INTERRUPT_LINES as usize]), lines }
    }

    pub fn vector_address(&self) -> usize {
        self.vector_address
    }

    pub fn get_pin(&self, pin: u32) -> u32 {
        self.pins.lock().unwrap().get(pin as usize).copied().unwrap_or(0)
    }

    pub fn set_pin(&self, pin: u32, value: u32) {
        let mut pins = self.pins.lock().unwrap();
        if (pin as usize) >= pins.len() {
            pins.resize(pin as usize + 1, 0);
        }
        pins[pin as usize] = value;
    }

    /// Raise `line` on the master CPU. BasicCPU's own implementation forwards
    /// this straight to `Cpu::interrupt`; here the CPU's bitset is the shared
    /// `InterruptLines` the controller was built with, so there is no CPU
    /// reference to thread through.
    pub fn interrupt(&self, line: u32) {
        self.lines.raise(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_pending_line_wins() {
        let lines = InterruptLines::new();
        lines.raise(5);
        lines.raise(2);
        assert_eq!(lines.lowest_pending(), Some(2));
        lines.clear(2);
        assert_eq!(lines.lowest_pending(), Some(5));
    }

    #[test]
    fn pins_latch_independently() {
        let lines = InterruptLines::new();
        let ic = InterruptController::new(4, lines);
        ic.set_pin(3, 0x41);
        assert_eq!(ic.get_pin(3), 0x41);
        assert_eq!(ic.get_pin(0), 0);
    }
}
