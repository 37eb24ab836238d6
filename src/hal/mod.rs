//! Hardware Abstraction Layer for the TI AM335x SoC
//!
//! This module provides low-level hardware access for the AM335x,
//! including GPIO, the HS MMC/SD host controller, the interrupt
//! controller and a free-running timer.

pub mod gpio;
pub mod intc;
pub mod mmchs;
pub mod mmio;
pub mod timer;

/// HS MMC/SD controller instance 0 base address
pub const MMCHS0_BASE: usize = 0x4806_0000;

/// EDMA3 channel controller base address
pub const EDMA3CC_BASE: usize = 0x4900_0000;

/// GPIO bank 0 base address (carries the card-detect line)
pub const GPIO0_BASE: usize = 0x44E0_7000;

/// DMTimer2 base address (free-running time base)
pub const DMTIMER2_BASE: usize = 0x4804_0000;

/// ARM interrupt controller (AINTC) base address
pub const AINTC_BASE: usize = 0x4820_0000;

/// AINTC vector for the MMCSD0 controller status interrupt
pub const MMCSD0_INT: u32 = 64;

/// AINTC vector for EDMA3 transfer completion
pub const EDMA_COMPLETION_INT: u32 = 12;

/// AINTC vector for EDMA3 channel controller errors
pub const EDMA_ERROR_INT: u32 = 14;

/// Card-detect input on GPIO bank 0
pub const CARD_DETECT_PIN: u32 = 6;
