//! MMCSD command/transfer state machine
//!
//! Coordinates the host controller and the DMA engine around a single
//! in-flight command or transfer. The interrupt handlers record what the
//! hardware signalled into [`TransferFlags`]; the polling side consumes the
//! flags and advances. Exactly one command/transfer may be outstanding at a
//! time — that discipline is what keeps the flags unambiguous, and issuing a
//! second command before the first resolves is a caller error this layer
//! does not detect.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::edma::{Direction, DmaStatus, Edma3, EdmaError, EDMA_CALLBACKS};
use crate::hal::gpio::GpioController;
use crate::hal::mmchs::{MmchsController, MmchsError, MmchsInterrupt, SdCommand};
use crate::hal::timer::SystemTimer;
use crate::hal::CARD_DETECT_PIN;
use bitflags::bitflags;
use defmt::Format;

/// Status bits the controller ISR is armed for
pub const INTERRUPT_MASK: MmchsInterrupt = MmchsInterrupt::CMD_COMPLETE
    .union(MmchsInterrupt::TRANSFER_COMPLETE)
    .union(MmchsInterrupt::CMD_TIMEOUT)
    .union(MmchsInterrupt::DATA_TIMEOUT);

/// Bounded poll count for the DMA-drain confirmation after the controller
/// reports transfer completion
const DMA_CALLBACK_POLL_LIMIT: u32 = 0xFFFF;

/// Operational bus clock once the card is identified
pub const MMCSD_OP_CLOCK: u32 = 25_000_000;

/// Storage stack error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum SdError {
    /// The controller's command timeout window expired
    CommandTimeout,
    /// The controller's data timeout window expired
    DataTimeout,
    /// The controller finished but the DMA engine never confirmed the drain
    DmaIncomplete,
    /// No card on the detect line
    CardAbsent,
    /// The card did not answer the identification sequence as expected
    UnsupportedCard,
    /// Caller-supplied buffer or geometry is wrong
    InvalidParam,
    /// DMA descriptor construction failed
    Dma(EdmaError),
    /// Register-layer handshake failed
    Controller(MmchsError),
}

impl From<EdmaError> for SdError {
    fn from(error: EdmaError) -> Self {
        SdError::Dma(error)
    }
}

impl From<MmchsError> for SdError {
    fn from(error: MmchsError) -> Self {
        SdError::Controller(error)
    }
}

/// Shared state between the three ISRs and the polling side.
///
/// Each flag is set exactly once by an ISR and cleared exactly once by the
/// waiting routine within one command/transfer cycle. The state machine
/// clears flags *before* arming hardware, never after, so a completion can
/// never race its own clear.
pub struct TransferFlags {
    command_complete: AtomicBool,
    command_timed_out: AtomicBool,
    transfer_complete: AtomicBool,
    data_timed_out: AtomicBool,
    dma_callback_fired: AtomicBool,
    error_mask: AtomicU32,
}

impl TransferFlags {
    /// All-clear flag block
    pub const fn new() -> Self {
        Self {
            command_complete: AtomicBool::new(false),
            command_timed_out: AtomicBool::new(false),
            transfer_complete: AtomicBool::new(false),
            data_timed_out: AtomicBool::new(false),
            dma_callback_fired: AtomicBool::new(false),
            error_mask: AtomicU32::new(0),
        }
    }

    /// Reset every flag; used when the mount loop re-initializes after a
    /// card removal or failed bring-up
    pub fn reset(&self) {
        self.command_complete.store(false, Ordering::SeqCst);
        self.command_timed_out.store(false, Ordering::SeqCst);
        self.transfer_complete.store(false, Ordering::SeqCst);
        self.data_timed_out.store(false, Ordering::SeqCst);
        self.dma_callback_fired.store(false, Ordering::SeqCst);
        self.error_mask.store(0, Ordering::SeqCst);
    }

    /// Clear the command-phase flags before the command registers are armed
    pub fn begin_command(&self) {
        self.command_complete.store(false, Ordering::SeqCst);
        self.command_timed_out.store(false, Ordering::SeqCst);
    }

    /// Clear the data-phase flags before the DMA channel is armed
    pub fn begin_transfer(&self) {
        self.transfer_complete.store(false, Ordering::SeqCst);
        self.data_timed_out.store(false, Ordering::SeqCst);
        self.dma_callback_fired.store(false, Ordering::SeqCst);
    }

    pub(crate) fn note_command_complete(&self) {
        self.command_complete.store(true, Ordering::SeqCst);
    }

    pub(crate) fn note_command_timeout(&self) {
        self.command_timed_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn note_transfer_complete(&self) {
        self.transfer_complete.store(true, Ordering::SeqCst);
    }

    pub(crate) fn note_data_timeout(&self) {
        self.data_timed_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn note_dma_callback(&self) {
        self.dma_callback_fired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn record_error_mask(&self, mask: u32) {
        self.error_mask.store(mask, Ordering::SeqCst);
    }

    /// Raw controller error bits from the last failed cycle, cleared on read
    pub fn take_error_mask(&self) -> u32 {
        self.error_mask.swap(0, Ordering::SeqCst)
    }

    /// Non-blocking command status poll: `Some(true)` on completion,
    /// `Some(false)` on command timeout, `None` while the hardware has
    /// signalled neither. Consumes the flag it observed.
    pub fn try_command_status(&self) -> Option<bool> {
        if self.command_complete.swap(false, Ordering::SeqCst) {
            return Some(true);
        }
        if self.command_timed_out.swap(false, Ordering::SeqCst) {
            return Some(false);
        }
        None
    }

    /// Busy-wait for the command to resolve. There is deliberately no
    /// software timeout here: the hardware command-timeout interrupt is the
    /// only exit on a dead bus, and if that interrupt is lost this never
    /// returns.
    pub fn wait_command_status(&self) -> bool {
        loop {
            if let Some(ok) = self.try_command_status() {
                return ok;
            }
            core::hint::spin_loop();
        }
    }

    /// Non-blocking transfer status poll, mirroring `try_command_status`
    pub fn try_transfer_status(&self) -> Option<bool> {
        if self.transfer_complete.swap(false, Ordering::SeqCst) {
            return Some(true);
        }
        if self.data_timed_out.swap(false, Ordering::SeqCst) {
            return Some(false);
        }
        None
    }

    /// Busy-wait for the data phase to resolve (hardware data timeout is the
    /// only exit on a stuck transfer)
    pub fn wait_transfer_status(&self) -> bool {
        loop {
            if let Some(ok) = self.try_transfer_status() {
                return ok;
            }
            core::hint::spin_loop();
        }
    }

    /// Bounded poll for the DMA completion callback. The controller-level
    /// "transfer complete" can arrive before the DMA engine has drained the
    /// FIFO; this wait closes that window. Returns whether the callback
    /// fired within the poll budget.
    pub fn wait_dma_callback(&self, poll_limit: u32) -> bool {
        let mut remaining = poll_limit;
        while remaining != 0 {
            if self.dma_callback_fired.swap(false, Ordering::SeqCst) {
                return true;
            }
            remaining -= 1;
            core::hint::spin_loop();
        }
        // Leave nothing behind for the next cycle
        self.dma_callback_fired.store(false, Ordering::SeqCst);
        false
    }
}

impl Default for TransferFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Flags for the live controller instance, shared with the ISRs
pub static XFER_FLAGS: TransferFlags = TransferFlags::new();

bitflags! {
    /// Driver bring-up progress
    #[derive(Clone, Copy)]
    pub struct DriverStatus: u32 {
        /// Controller reset, powered and clocked
        const CONTROLLER_READY = 1 << 0;
        /// Status interrupts armed
        const INTERRUPTS_ENABLED = 1 << 1;
        /// DMA channels bound to their completion tags
        const DMA_BOUND = 1 << 2;
    }
}

/// Capability set of a host controller, so an alternate controller can be
/// substituted under the card and storage layers
pub trait ControllerOps {
    /// Reset and bring up the controller hardware
    fn init(&mut self) -> Result<(), SdError>;

    /// Arm the command registers and return immediately; completion is
    /// observed through `command_status`
    fn send_command(&mut self, cmd: &SdCommand);

    /// Busy-wait for the in-flight command, consuming its flags; returns the
    /// response registers on success
    fn command_status(&mut self) -> Result<[u32; 4], SdError>;

    /// Prepare the DMA engine and block-length register for a data phase.
    /// Must be called before the data command is sent.
    fn setup_transfer(
        &mut self,
        direction: Direction,
        buf: u32,
        blk_size: u32,
        nblks: u32,
    ) -> Result<(), SdError>;

    /// Busy-wait for the in-flight data phase, consuming its flags and
    /// confirming the DMA drain
    fn transfer_status(&mut self) -> Result<(), SdError>;

    /// Level of the card-detect line
    fn card_present(&self) -> bool;

    /// Select the data bus width
    fn config_bus_width(&mut self, width: u8) -> Result<(), SdError>;

    /// Select the bus clock frequency
    fn config_bus_freq(&mut self, freq_hz: u32) -> Result<(), SdError>;

    /// Arm the controller status interrupts
    fn enable_interrupts(&mut self);
}

/// The AM335x HSMMCSD instance 0 controller
pub struct MmcsdDriver {
    mmchs: MmchsController,
    gpio: GpioController,
    timer: SystemTimer,
    edma: Edma3,
    status: DriverStatus,
    dma_enabled: bool,
}

impl MmcsdDriver {
    /// Create the driver over the fixed SoC instances
    pub const fn new() -> Self {
        Self {
            mmchs: MmchsController::new(),
            gpio: GpioController::new(),
            timer: SystemTimer::new(),
            edma: Edma3::new(),
            status: DriverStatus::empty(),
            dma_enabled: false,
        }
    }

    /// Bind both DMA directions to their fixed channels and register the
    /// flag-raising completion callback
    pub fn bind_dma(&mut self) -> Result<(), SdError> {
        self.edma
            .bind_channel(&EDMA_CALLBACKS, Direction::Receive, dma_done_callback)?;
        self.edma
            .bind_channel(&EDMA_CALLBACKS, Direction::Transmit, dma_done_callback)?;
        self.status.insert(DriverStatus::DMA_BOUND);
        Ok(())
    }

    /// Free-running timer shared with the card layer's retry loops
    pub fn timer(&self) -> &SystemTimer {
        &self.timer
    }

    /// Whether a DMA transfer is considered in flight
    pub fn dma_enabled(&self) -> bool {
        self.dma_enabled
    }

    /// Bring-up progress of this driver instance
    pub fn status(&self) -> DriverStatus {
        self.status
    }
}

impl ControllerOps for MmcsdDriver {
    fn init(&mut self) -> Result<(), SdError> {
        self.gpio.configure_input(CARD_DETECT_PIN);
        self.mmchs.init()?;
        self.mmchs.send_init_stream();
        self.status.insert(DriverStatus::CONTROLLER_READY);
        defmt::info!("MMCSD: controller initialized");
        Ok(())
    }

    fn send_command(&mut self, cmd: &SdCommand) {
        // Clear before arming; the completion interrupt may fire the moment
        // the command register is written
        XFER_FLAGS.begin_command();
        self.mmchs.write_command(cmd);
    }

    fn command_status(&mut self) -> Result<[u32; 4], SdError> {
        if XFER_FLAGS.wait_command_status() {
            Ok(self.mmchs.response())
        } else {
            let raw = XFER_FLAGS.take_error_mask();
            defmt::warn!("MMCSD: command timeout, error bits {:#x}", raw);
            Err(SdError::CommandTimeout)
        }
    }

    fn setup_transfer(
        &mut self,
        direction: Direction,
        buf: u32,
        blk_size: u32,
        nblks: u32,
    ) -> Result<(), SdError> {
        // Clear before arming the channel; the DMA completion may preempt
        // any instruction after `arm_transfer`
        XFER_FLAGS.begin_transfer();
        self.edma.configure_transfer(
            direction,
            self.mmchs.data_register_address(),
            buf,
            blk_size,
            nblks,
        )?;
        self.edma.arm_transfer(direction);
        self.mmchs.set_block_length(blk_size);
        self.dma_enabled = true;
        Ok(())
    }

    fn transfer_status(&mut self) -> Result<(), SdError> {
        let mut result = if XFER_FLAGS.wait_transfer_status() {
            Ok(())
        } else {
            let raw = XFER_FLAGS.take_error_mask();
            defmt::warn!("MMCSD: data timeout, error bits {:#x}", raw);
            Err(SdError::DataTimeout)
        };

        // The controller's transfer-complete can outrun the DMA engine's
        // last FIFO drain; confirm the completion callback before declaring
        // the buffer valid
        if self.mmchs.last_command_had_data()
            && !XFER_FLAGS.wait_dma_callback(DMA_CALLBACK_POLL_LIMIT)
            && result.is_ok()
        {
            defmt::warn!("MMCSD: transfer complete but DMA never drained");
            result = Err(SdError::DmaIncomplete);
        }

        // DMA mode mirrors "transfer in flight" and is dropped on every
        // exit path, success or failure
        self.dma_enabled = false;
        result
    }

    fn card_present(&self) -> bool {
        // The detect line pulls low when a card sits in the slot
        !self.gpio.read_pin(CARD_DETECT_PIN)
    }

    fn config_bus_width(&mut self, width: u8) -> Result<(), SdError> {
        self.mmchs.set_bus_width(width)?;
        Ok(())
    }

    fn config_bus_freq(&mut self, freq_hz: u32) -> Result<(), SdError> {
        self.mmchs.set_clock(freq_hz)?;
        Ok(())
    }

    fn enable_interrupts(&mut self) {
        self.mmchs.enable_interrupts(INTERRUPT_MASK);
        self.status.insert(DriverStatus::INTERRUPTS_ENABLED);
    }
}

impl Default for MmcsdDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// DMA completion callback registered for both MMCSD channels: raise the
/// drain flag and disarm the channel. Runs in interrupt context.
pub fn dma_done_callback(tcc: u32, _status: DmaStatus) {
    XFER_FLAGS.note_dma_callback();
    Edma3::new().disarm_transfer(tcc);
}

/// Translate one raw status word into the shared flags. Several bits can
/// arrive in a single read, so every condition is checked independently
/// rather than as an if/else chain.
fn apply_status(status: MmchsInterrupt, flags: &TransferFlags) {
    if status.contains(MmchsInterrupt::CMD_COMPLETE) {
        flags.note_command_complete();
    }

    if status.contains(MmchsInterrupt::ERROR) {
        flags.record_error_mask(status.bits() & 0xFFFF_0000);

        if status.contains(MmchsInterrupt::CMD_TIMEOUT) {
            flags.note_command_timeout();
        }
        if status.contains(MmchsInterrupt::DATA_TIMEOUT) {
            flags.note_data_timeout();
        }
    }

    if status.contains(MmchsInterrupt::TRANSFER_COMPLETE) {
        flags.note_transfer_complete();
    }
}

/// Controller status ISR, registered on the MMCSD0 vector
pub fn mmchs_isr() {
    let mmchs = MmchsController::new();
    let status = mmchs.status();
    mmchs.clear_status(status);
    apply_status(status, &XFER_FLAGS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_flags_are_consumed_exactly_once() {
        let flags = TransferFlags::new();
        flags.begin_command();

        // ISR reports completion once; the poller observes it once
        flags.note_command_complete();
        assert_eq!(flags.try_command_status(), Some(true));
        assert_eq!(flags.try_command_status(), None);

        flags.begin_command();
        flags.note_command_timeout();
        assert_eq!(flags.try_command_status(), Some(false));
        assert_eq!(flags.try_command_status(), None);
    }

    #[test]
    fn wait_returns_immediately_once_a_flag_is_up() {
        let flags = TransferFlags::new();
        flags.note_command_complete();
        assert!(flags.wait_command_status());

        flags.note_command_timeout();
        assert!(!flags.wait_command_status());

        flags.note_transfer_complete();
        assert!(flags.wait_transfer_status());

        flags.note_data_timeout();
        assert!(!flags.wait_transfer_status());
    }

    #[test]
    fn stuck_bus_never_resolves_the_command_poll() {
        // With neither flag raised the wait has no exit: the documented
        // behavior when the hardware timeout interrupt is lost. Assert the
        // non-blocking poll stays empty over a bounded harness instead of
        // spinning forever.
        let flags = TransferFlags::new();
        flags.begin_command();
        for _ in 0..100_000 {
            assert_eq!(flags.try_command_status(), None);
        }
    }

    #[test]
    fn begin_command_discards_stale_results() {
        let flags = TransferFlags::new();
        flags.note_command_complete();
        flags.note_command_timeout();

        flags.begin_command();
        assert_eq!(flags.try_command_status(), None);
    }

    #[test]
    fn dma_callback_wait_is_bounded() {
        let flags = TransferFlags::new();
        assert!(!flags.wait_dma_callback(1000));

        flags.note_dma_callback();
        assert!(flags.wait_dma_callback(1000));
        // Consumed: a second wait without a new callback expires again
        assert!(!flags.wait_dma_callback(10));
    }

    #[test]
    fn status_translation_handles_multiple_bits_in_one_read() {
        let flags = TransferFlags::new();
        let status = MmchsInterrupt::CMD_COMPLETE
            | MmchsInterrupt::TRANSFER_COMPLETE
            | MmchsInterrupt::ERROR
            | MmchsInterrupt::CMD_TIMEOUT
            | MmchsInterrupt::DATA_TIMEOUT;

        apply_status(status, &flags);

        assert_eq!(flags.try_command_status(), Some(true));
        assert_eq!(flags.try_transfer_status(), Some(true));
        // The sub-bit flags were latched too, not shadowed by the first hit
        assert!(flags.command_timed_out.load(Ordering::SeqCst));
        assert!(flags.data_timed_out.load(Ordering::SeqCst));
        assert_eq!(
            flags.take_error_mask(),
            (MmchsInterrupt::CMD_TIMEOUT | MmchsInterrupt::DATA_TIMEOUT).bits()
        );
    }

    #[test]
    fn error_path_latches_only_timeout_sub_bits() {
        let flags = TransferFlags::new();
        let status = MmchsInterrupt::ERROR | MmchsInterrupt::CMD_CRC;

        apply_status(status, &flags);

        assert_eq!(flags.try_command_status(), None);
        assert_eq!(flags.try_transfer_status(), None);
        assert_eq!(
            flags.take_error_mask(),
            (MmchsInterrupt::ERROR | MmchsInterrupt::CMD_CRC).bits() & 0xFFFF_0000
        );
    }

    #[test]
    fn reset_clears_every_flag() {
        let flags = TransferFlags::new();
        flags.note_command_complete();
        flags.note_transfer_complete();
        flags.note_dma_callback();
        flags.record_error_mask(0xDEAD_0000);

        flags.reset();

        assert_eq!(flags.try_command_status(), None);
        assert_eq!(flags.try_transfer_status(), None);
        assert!(!flags.wait_dma_callback(10));
        assert_eq!(flags.take_error_mask(), 0);
    }
}
