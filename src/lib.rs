//! # AM335x SD/MMC Storage Driver
//!
//! A bare-metal SD/MMC storage driver for the TI AM335x, built on the
//! HSMMCSD host controller and the EDMA3 engine.
//!
//! This driver provides the storage bring-up path for a system with no OS
//! scheduler:
//! - Controller and card initialization
//! - DMA block transfers with no CPU copy
//! - Interrupt-driven command/transfer completion consumed by a polling loop
//! - Card presence monitoring with automatic re-initialization
//! - A mountable block device surface for a filesystem layer
//!
//! ## Features
//!
//! - `std`: Enable std support for testing
//!
//! ## Example
//!
//! ```rust,no_run
//! use am335x_mmcsd_driver::{
//!     read_file, start_file_system, FileSystem, FsError, MmcsdDriver, SdCard,
//! };
//!
//! // The filesystem layer is an external collaborator; any implementation
//! // of `FileSystem` can be mounted.
//! struct Fat;
//! impl FileSystem for Fat {
//!     type Handle = ();
//!     fn mount(&mut self, _drive: u32, _card: &SdCard) -> Result<(), FsError> {
//!         Ok(())
//!     }
//!     fn open(&mut self, _path: &str) -> Result<(), FsError> {
//!         Ok(())
//!     }
//!     fn read(&mut self, _h: &mut (), _buf: &mut [u8]) -> Result<usize, FsError> {
//!         Ok(0)
//!     }
//!     fn close(&mut self, _h: ()) -> Result<(), FsError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut driver = MmcsdDriver::new();
//! let mut fs = Fat;
//!
//! // Blocks until media is present and mounted
//! if start_file_system(&mut driver, &mut fs) {
//!     let mut image = [0u8; 10_000];
//!     let len = image.len();
//!     read_file(&mut fs, &mut image, len, "boot/kernel.elf");
//! }
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs, clippy::all)]

pub mod hal;

// Re-export the storage stack
pub use card::{CardCsd, CardIdent, CardType, SdCard, BLOCK_LEN};
pub use edma::{
    edma3_completion_isr, edma3_error_isr, orphan_error_count, CallbackTable, Direction,
    DmaCallback, DmaStatus, Edma3, EdmaError, ParamSet, EDMA3_NUM_TCC, EDMA_CALLBACKS,
};
pub use mmcsd::{
    dma_done_callback, mmchs_isr, ControllerOps, DriverStatus, MmcsdDriver, SdError,
    TransferFlags, INTERRUPT_MASK, XFER_FLAGS,
};
pub use storage::{read_file, start_file_system, FileSystem, FsError, MountState, MOUNT_DRIVE};

// Re-export HAL components for advanced users
pub use hal::{
    gpio::GpioController,
    intc::Aintc,
    mmchs::{CmdFlags, MmchsController, MmchsError, MmchsInterrupt, SdCommand},
    mmio::Mmio,
    timer::SystemTimer,
};

mod card;
mod edma;
mod mmcsd;
mod storage;
