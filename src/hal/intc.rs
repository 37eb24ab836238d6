//! ARM interrupt controller (AINTC) shim
//!
//! Thin concrete backing for the interrupt-vector contract the storage stack
//! consumes: register a handler for a numeric vector, enable/disable the
//! vector, and dispatch the active IRQ from the platform trampoline.
//! Handlers are registered during single-threaded bring-up, before the
//! corresponding vector is enabled.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::mmio::Mmio;
use super::AINTC_BASE;

/// Active IRQ number register
const INTC_SIR_IRQ: usize = 0x40;
/// New IRQ agreement register
const INTC_CONTROL: usize = 0x48;
/// Mask clear register for vectors n*32..n*32+31 (write 1 to unmask)
const INTC_MIR_CLEAR: usize = 0x88;
/// Mask set register for vectors n*32..n*32+31 (write 1 to mask)
const INTC_MIR_SET: usize = 0x8C;
/// Stride between the per-bank mask register groups
const INTC_BANK_STRIDE: usize = 0x20;

/// ActiveIRQ field of SIR_IRQ
const SIR_ACTIVE_IRQ_MASK: u32 = 0x7F;
/// NewIRQAgr bit of CONTROL
const CONTROL_NEW_IRQ_AGR: u32 = 1 << 0;

/// Number of interrupt vectors the AINTC serves
pub const NUM_VECTORS: usize = 128;

/// An interrupt service routine
pub type Handler = fn();

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicUsize = AtomicUsize::new(0);

/// Registered handlers, one slot per vector (0 = unregistered)
static HANDLERS: [AtomicUsize; NUM_VECTORS] = [EMPTY_SLOT; NUM_VECTORS];

/// AINTC register interface
pub struct Aintc {
    base: usize,
}

impl Aintc {
    /// Create a handle on the SoC interrupt controller
    pub const fn new() -> Self {
        Self { base: AINTC_BASE }
    }

    /// Create a handle on a caller-supplied register block
    pub const fn at(base: usize) -> Self {
        Self { base }
    }

    /// Register `handler` for `vector`, replacing any previous registration
    pub fn register_handler(&self, vector: u32, handler: Handler) {
        if (vector as usize) < NUM_VECTORS {
            HANDLERS[vector as usize].store(handler as usize, Ordering::Release);
        }
    }

    /// Unmask a vector
    pub fn enable_vector(&self, vector: u32) {
        let bank = (vector / 32) as usize;
        let reg = unsafe {
            Mmio::<u32>::new(self.base + INTC_MIR_CLEAR + bank * INTC_BANK_STRIDE)
        };
        reg.write(1 << (vector % 32));
    }

    /// Mask a vector
    pub fn disable_vector(&self, vector: u32) {
        let bank = (vector / 32) as usize;
        let reg = unsafe {
            Mmio::<u32>::new(self.base + INTC_MIR_SET + bank * INTC_BANK_STRIDE)
        };
        reg.write(1 << (vector % 32));
    }

    /// Service the active IRQ, then acknowledge it to the controller.
    /// Called from the platform's IRQ trampoline.
    pub fn dispatch(&self) {
        let sir = unsafe { Mmio::<u32>::new(self.base + INTC_SIR_IRQ) };
        let vector = (sir.read() & SIR_ACTIVE_IRQ_MASK) as usize;

        let raw = HANDLERS[vector].load(Ordering::Acquire);
        if raw != 0 {
            let handler: Handler = unsafe { core::mem::transmute(raw) };
            handler();
        }

        let control = unsafe { Mmio::<u32>::new(self.base + INTC_CONTROL) };
        control.write(CONTROL_NEW_IRQ_AGR);
    }
}

impl Default for Aintc {
    fn default() -> Self {
        Self::new()
    }
}

/// Enable IRQ delivery at the CPU
pub fn master_irq_enable() {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::arch::asm!("cpsie i");
    }
}

/// Disable IRQ delivery at the CPU
pub fn master_irq_disable() {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::arch::asm!("cpsid i");
    }
}
