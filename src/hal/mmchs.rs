//! HS MMC/SD host controller register layer for the AM335x
//!
//! Owns the raw MMCHS register programming: reset, power, clocking, bus
//! width, interrupt enables and the command register. Command completion is
//! observed asynchronously through the controller status interrupt, so
//! `write_command` returns as soon as the registers are written.

use super::mmio::Mmio;
use super::timer::SystemTimer;
use super::MMCHS0_BASE;
use bitflags::bitflags;
use defmt::Format;

/// MMCHS register offsets
const MMCHS_SYSCONFIG: usize = 0x110;
const MMCHS_SYSSTATUS: usize = 0x114;
const MMCHS_CON: usize = 0x12C;
const MMCHS_BLK: usize = 0x204;
const MMCHS_ARG: usize = 0x208;
const MMCHS_CMD: usize = 0x20C;
const MMCHS_RSP10: usize = 0x210;
const MMCHS_RSP32: usize = 0x214;
const MMCHS_RSP54: usize = 0x218;
const MMCHS_RSP76: usize = 0x21C;
const MMCHS_DATA: usize = 0x220;
const MMCHS_HCTL: usize = 0x228;
const MMCHS_SYSCTL: usize = 0x22C;
const MMCHS_STAT: usize = 0x230;
const MMCHS_IE: usize = 0x234;
const MMCHS_ISE: usize = 0x238;
const MMCHS_CAPA: usize = 0x240;

/// SYSCONFIG soft reset request
const SYSCONFIG_SOFTRESET: u32 = 1 << 1;
/// SYSSTATUS reset-done flag
const SYSSTATUS_RESETDONE: u32 = 1 << 0;

/// SYSCTL internal clock enable
const SYSCTL_ICE: u32 = 1 << 0;
/// SYSCTL internal clock stable
const SYSCTL_ICS: u32 = 1 << 1;
/// SYSCTL bus clock enable
const SYSCTL_CEN: u32 = 1 << 2;
/// SYSCTL clock divider field
const SYSCTL_CLKD_SHIFT: u32 = 6;
const SYSCTL_CLKD_MASK: u32 = 0x3FF << SYSCTL_CLKD_SHIFT;
/// SYSCTL data timeout counter field (0xE = longest window)
const SYSCTL_DTO_SHIFT: u32 = 16;
const SYSCTL_DTO_MASK: u32 = 0xF << SYSCTL_DTO_SHIFT;
const SYSCTL_DTO_MAX: u32 = 0xE << SYSCTL_DTO_SHIFT;
/// SYSCTL software reset for all
const SYSCTL_SRA: u32 = 1 << 24;

/// HCTL data transfer width (set = 4-bit)
const HCTL_DTW: u32 = 1 << 1;
/// HCTL bus voltage select field
const HCTL_SDVS_SHIFT: u32 = 9;
const HCTL_SDVS_MASK: u32 = 0x7 << HCTL_SDVS_SHIFT;
/// 3.0 V bus voltage
const HCTL_SDVS_3V0: u32 = 0x6 << HCTL_SDVS_SHIFT;
/// HCTL bus power on
const HCTL_SDBP: u32 = 1 << 8;

/// CAPA 3.0 V supported
const CAPA_VS30: u32 = 1 << 25;
/// CAPA 1.8 V supported
const CAPA_VS18: u32 = 1 << 26;

/// CON init-stream bit
const CON_INIT: u32 = 1 << 1;

/// CMD data-present bit, re-read by the transfer wait to decide whether a
/// DMA drain must also be confirmed
const CMD_DP: u32 = 1 << 21;

/// Reference clock into the controller's divider (96 MHz)
pub const MMCHS_INPUT_CLOCK: u32 = 96_000_000;
/// Identification-phase bus clock
pub const MMCHS_INIT_CLOCK: u32 = 400_000;

/// How long to wait for reset/clock/power handshakes (µs)
const HANDSHAKE_TIMEOUT_US: u32 = 100_000;

bitflags! {
    /// MMCHS interrupt status / enable bits (STAT, IE and ISE share a layout)
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmchsInterrupt: u32 {
        /// Command complete
        const CMD_COMPLETE = 1 << 0;
        /// Transfer complete
        const TRANSFER_COMPLETE = 1 << 1;
        /// Buffer write ready
        const BUFFER_WRITE_READY = 1 << 4;
        /// Buffer read ready
        const BUFFER_READ_READY = 1 << 5;
        /// Card interrupt
        const CARD_INTERRUPT = 1 << 8;
        /// Generic error summary bit
        const ERROR = 1 << 15;
        /// Command timeout error
        const CMD_TIMEOUT = 1 << 16;
        /// Command CRC error
        const CMD_CRC = 1 << 17;
        /// Command end-bit error
        const CMD_END_BIT = 1 << 18;
        /// Command index error
        const CMD_INDEX = 1 << 19;
        /// Data timeout error
        const DATA_TIMEOUT = 1 << 20;
        /// Data CRC error
        const DATA_CRC = 1 << 21;
        /// Data end-bit error
        const DATA_END_BIT = 1 << 22;
        /// Auto CMD12 error
        const ACMD12_ERR = 1 << 24;
        /// Card error summary
        const CARD_ERROR = 1 << 28;
        /// Bad access to data space
        const BAD_ACCESS = 1 << 29;
    }
}

bitflags! {
    /// Command attributes, encoded into the CMD register
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CmdFlags: u32 {
        /// 48-bit response expected
        const RESP_48 = 1 << 0;
        /// 136-bit response expected
        const RESP_136 = 1 << 1;
        /// 48-bit response with busy signalling
        const RESP_BUSY = 1 << 2;
        /// Check response CRC
        const CHECK_CRC = 1 << 3;
        /// Check response index
        const CHECK_INDEX = 1 << 4;
        /// Data phase follows the command
        const DATA_PRESENT = 1 << 5;
        /// Data direction is card-to-host
        const READ = 1 << 6;
        /// Multi-block transfer
        const MULTI_BLOCK = 1 << 7;
        /// Hand the data phase to the DMA engine
        const DMA_ENABLE = 1 << 8;
    }
}

/// One SD/MMC bus command
#[derive(Debug, Clone, Copy)]
pub struct SdCommand {
    /// Command index (CMD0..CMD63)
    pub index: u8,
    /// 32-bit command argument
    pub arg: u32,
    /// Response/data attributes
    pub flags: CmdFlags,
    /// Block count for data commands
    pub nblks: u16,
}

/// Errors raised by the register layer's bounded handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum MmchsError {
    /// Controller never reported reset completion
    ResetTimeout,
    /// Internal clock never stabilized
    ClockTimeout,
    /// Bus power never came up
    PowerTimeout,
    /// Requested bus width is not supported
    InvalidBusWidth,
}

/// HS MMC/SD host controller
pub struct MmchsController {
    base: usize,
    timer: SystemTimer,
}

impl MmchsController {
    /// Create a handle on MMCHS instance 0
    pub const fn new() -> Self {
        Self {
            base: MMCHS0_BASE,
            timer: SystemTimer::new(),
        }
    }

    /// Create a handle on a caller-supplied register block
    pub const fn at(base: usize) -> Self {
        Self {
            base,
            timer: SystemTimer::new(),
        }
    }

    fn reg(&self, offset: usize) -> Mmio<u32> {
        unsafe { Mmio::<u32>::new(self.base + offset) }
    }

    /// Address of the data FIFO register, handed to the DMA engine as the
    /// constant-address end of every transfer
    pub fn data_register_address(&self) -> u32 {
        (self.base + MMCHS_DATA) as u32
    }

    /// Reset and power the controller, then drop the bus to the
    /// identification clock
    pub fn init(&self) -> Result<(), MmchsError> {
        self.soft_reset()?;

        // Advertise the supported voltage windows before powering the bus
        let capa = self.reg(MMCHS_CAPA);
        capa.modify(|val| val | CAPA_VS30 | CAPA_VS18);

        let hctl = self.reg(MMCHS_HCTL);
        hctl.modify(|val| (val & !HCTL_SDVS_MASK) | HCTL_SDVS_3V0);
        hctl.modify(|val| val | HCTL_SDBP);

        let start = self.timer.get_ticks();
        while self.reg(MMCHS_HCTL).read() & HCTL_SDBP == 0 {
            if self.timer.is_timeout(start, HANDSHAKE_TIMEOUT_US) {
                defmt::error!("MMCHS: bus power-up timeout");
                return Err(MmchsError::PowerTimeout);
            }
            core::hint::spin_loop();
        }

        // Longest data timeout window; the data-timeout interrupt is the
        // only watchdog the transfer wait has
        let sysctl = self.reg(MMCHS_SYSCTL);
        sysctl.modify(|val| (val & !SYSCTL_DTO_MASK) | SYSCTL_DTO_MAX);

        self.set_clock(MMCHS_INIT_CLOCK)?;

        Ok(())
    }

    /// Software reset of the whole controller
    fn soft_reset(&self) -> Result<(), MmchsError> {
        let sysconfig = self.reg(MMCHS_SYSCONFIG);
        sysconfig.modify(|val| val | SYSCONFIG_SOFTRESET);

        let sysstatus = self.reg(MMCHS_SYSSTATUS);
        let start = self.timer.get_ticks();
        while sysstatus.read() & SYSSTATUS_RESETDONE == 0 {
            if self.timer.is_timeout(start, HANDSHAKE_TIMEOUT_US) {
                defmt::error!("MMCHS: soft reset timeout");
                return Err(MmchsError::ResetTimeout);
            }
            core::hint::spin_loop();
        }

        let sysctl = self.reg(MMCHS_SYSCTL);
        sysctl.modify(|val| val | SYSCTL_SRA);
        let start = self.timer.get_ticks();
        while sysctl.read() & SYSCTL_SRA != 0 {
            if self.timer.is_timeout(start, HANDSHAKE_TIMEOUT_US) {
                defmt::error!("MMCHS: lines reset timeout");
                return Err(MmchsError::ResetTimeout);
            }
            core::hint::spin_loop();
        }

        Ok(())
    }

    /// Program the bus clock divider and wait for it to stabilize
    pub fn set_clock(&self, freq_hz: u32) -> Result<(), MmchsError> {
        let sysctl = self.reg(MMCHS_SYSCTL);

        // Stop the bus clock while the divider changes
        sysctl.modify(|val| val & !SYSCTL_CEN);

        let divisor = if freq_hz >= MMCHS_INPUT_CLOCK {
            1
        } else {
            ((MMCHS_INPUT_CLOCK + freq_hz - 1) / freq_hz).min(0x3FF)
        };

        sysctl.modify(|val| {
            (val & !SYSCTL_CLKD_MASK) | (divisor << SYSCTL_CLKD_SHIFT) | SYSCTL_ICE
        });

        let start = self.timer.get_ticks();
        while sysctl.read() & SYSCTL_ICS == 0 {
            if self.timer.is_timeout(start, HANDSHAKE_TIMEOUT_US) {
                defmt::error!("MMCHS: internal clock stabilization timeout");
                return Err(MmchsError::ClockTimeout);
            }
            core::hint::spin_loop();
        }

        sysctl.modify(|val| val | SYSCTL_CEN);
        defmt::debug!("MMCHS: bus clock set to {} Hz", freq_hz);
        Ok(())
    }

    /// Select the data bus width (1 or 4 lines)
    pub fn set_bus_width(&self, width: u8) -> Result<(), MmchsError> {
        let hctl = self.reg(MMCHS_HCTL);
        match width {
            1 => hctl.modify(|val| val & !HCTL_DTW),
            4 => hctl.modify(|val| val | HCTL_DTW),
            _ => return Err(MmchsError::InvalidBusWidth),
        }
        Ok(())
    }

    /// Enable the given status bits in IE and route them to the interrupt
    /// line through ISE
    pub fn enable_interrupts(&self, mask: MmchsInterrupt) {
        self.reg(MMCHS_IE).write(mask.bits());
        self.reg(MMCHS_ISE).write(mask.bits());
    }

    /// Pulse the 80-clock init stream the card needs after power-up
    pub fn send_init_stream(&self) {
        let con = self.reg(MMCHS_CON);
        con.modify(|val| val | CON_INIT);
        self.reg(MMCHS_CMD).write(0);
        self.timer.delay_ms(1);
        // The init pulse raises a spurious command-complete
        self.clear_status(MmchsInterrupt::CMD_COMPLETE);
        con.modify(|val| val & !CON_INIT);
    }

    /// Record the transfer block length
    pub fn set_block_length(&self, len: u32) {
        self.reg(MMCHS_BLK).modify(|val| (val & !0xFFF) | (len & 0xFFF));
    }

    /// Write a command into ARG/CMD. Returns immediately; completion is
    /// signalled through the status interrupt.
    pub fn write_command(&self, cmd: &SdCommand) {
        self.reg(MMCHS_BLK)
            .modify(|val| (val & 0xFFFF) | ((cmd.nblks as u32) << 16));
        self.reg(MMCHS_ARG).write(cmd.arg);
        self.reg(MMCHS_CMD).write(encode_command(cmd));
    }

    /// Read back the response registers
    pub fn response(&self) -> [u32; 4] {
        [
            self.reg(MMCHS_RSP10).read(),
            self.reg(MMCHS_RSP32).read(),
            self.reg(MMCHS_RSP54).read(),
            self.reg(MMCHS_RSP76).read(),
        ]
    }

    /// Raw interrupt status
    pub fn status(&self) -> MmchsInterrupt {
        MmchsInterrupt::from_bits_truncate(self.reg(MMCHS_STAT).read())
    }

    /// Acknowledge status bits by write-back
    pub fn clear_status(&self, bits: MmchsInterrupt) {
        self.reg(MMCHS_STAT).write(bits.bits());
    }

    /// Whether the most recently issued command carried a data phase
    pub fn last_command_had_data(&self) -> bool {
        self.reg(MMCHS_CMD).read() & CMD_DP != 0
    }
}

impl Default for MmchsController {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the CMD register value for a command
fn encode_command(cmd: &SdCommand) -> u32 {
    let mut value = ((cmd.index as u32) & 0x3F) << 24;

    if cmd.flags.contains(CmdFlags::RESP_136) {
        value |= 0x1 << 16;
    } else if cmd.flags.contains(CmdFlags::RESP_BUSY) {
        value |= 0x3 << 16;
    } else if cmd.flags.contains(CmdFlags::RESP_48) {
        value |= 0x2 << 16;
    }

    if cmd.flags.contains(CmdFlags::CHECK_CRC) {
        value |= 1 << 19;
    }
    if cmd.flags.contains(CmdFlags::CHECK_INDEX) {
        value |= 1 << 20;
    }
    if cmd.flags.contains(CmdFlags::DATA_PRESENT) {
        value |= CMD_DP;
    }
    if cmd.flags.contains(CmdFlags::READ) {
        value |= 1 << 4;
    }
    if cmd.flags.contains(CmdFlags::MULTI_BLOCK) {
        // Multi-block with block counting enabled
        value |= (1 << 5) | (1 << 1);
    }
    if cmd.flags.contains(CmdFlags::DMA_ENABLE) {
        value |= 1 << 0;
    }

    value
}
