//! GPIO bank 0 access for the card-detect line

use super::mmio::Mmio;
use super::GPIO0_BASE;

/// Output-enable register (1 = input)
const GPIO_OE: usize = 0x134;
/// Sampled input levels
const GPIO_DATAIN: usize = 0x138;

/// GPIO controller for bank 0
pub struct GpioController {
    base: usize,
}

impl GpioController {
    /// Create a handle on GPIO bank 0
    pub const fn new() -> Self {
        Self { base: GPIO0_BASE }
    }

    /// Create a handle on a caller-supplied register block
    pub const fn at(base: usize) -> Self {
        Self { base }
    }

    /// Configure a pin as an input
    pub fn configure_input(&self, pin: u32) {
        let oe = unsafe { Mmio::<u32>::new(self.base + GPIO_OE) };
        oe.modify(|val| val | (1 << pin));
    }

    /// Read the sampled level of a pin
    pub fn read_pin(&self, pin: u32) -> bool {
        let datain = unsafe { Mmio::<u32>::new(self.base + GPIO_DATAIN) };
        datain.read() & (1 << pin) != 0
    }
}

impl Default for GpioController {
    fn default() -> Self {
        Self::new()
    }
}
