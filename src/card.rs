//! SD card identification and block I/O
//!
//! Walks a freshly inserted card through the identification sequence and
//! exposes block reads/writes over the controller's DMA data path. The card
//! context holds no reference of its own; every operation borrows the
//! controller, and the context is rebuilt on each insertion.

use crate::edma::Direction;
use crate::hal::mmchs::{CmdFlags, SdCommand};
use crate::hal::timer::SystemTimer;
use crate::mmcsd::{ControllerOps, SdError, MMCSD_OP_CLOCK};
use defmt::Format;

/// SD command indices
mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const ALL_SEND_CID: u8 = 2;
    pub const SEND_RELATIVE_ADDR: u8 = 3;
    pub const SELECT_CARD: u8 = 7;
    pub const SEND_IF_COND: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const WRITE_SINGLE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const APP_CMD: u8 = 55;

    // Application commands, sent after APP_CMD
    pub const ACMD_SET_BUS_WIDTH: u8 = 6;
    pub const ACMD_SD_SEND_OP_COND: u8 = 41;
}

/// CMD8 voltage range + check pattern (2.7-3.6 V, pattern 0xAA)
const IF_COND_CHECK: u32 = 0x1AA;
/// ACMD41 host-capacity-support bit
const OCR_HCS: u32 = 1 << 30;
/// ACMD41 power-up-done bit
const OCR_READY: u32 = 1 << 31;
/// Supported voltage window: 3.0-3.2 V
const OCR_VOLTAGE_WINDOW: u32 = (1 << 18) | (1 << 19);
/// ACMD41 retry budget (1 ms between attempts)
const OP_COND_RETRIES: u32 = 1000;

/// Transfer block length, fixed for the whole stack
pub const BLOCK_LEN: u32 = 512;

/// Card capacity class learned from the identification handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum CardType {
    /// SD v1.x, byte addressed
    StandardCapacity,
    /// SDHC/SDXC, block addressed
    HighCapacity,
}

/// Decoded card identification register
#[derive(Debug, Clone, Default)]
pub struct CardIdent {
    /// Manufacturer ID byte
    pub manufacturer_id: u8,
    /// Printable product name from the CID
    pub product_name: heapless::String<8>,
    /// Product serial number
    pub serial_number: u32,
}

/// The subset of the CSD this stack needs
#[derive(Debug, Clone, Copy, Default)]
pub struct CardCsd {
    /// CSD structure version field
    pub version: u8,
    /// Device size field, interpretation depends on `version`
    pub c_size: u32,
    /// v1 device size multiplier
    pub c_size_mult: u8,
    /// v1 read block length exponent
    pub read_bl_len: u8,
}

/// One identified card
pub struct SdCard {
    /// Capacity class
    pub card_type: CardType,
    /// Published relative card address
    pub rca: u16,
    /// Identification register contents
    pub ident: CardIdent,
    /// Total 512-byte sectors
    pub total_sectors: u64,
}

impl SdCard {
    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.total_sectors * BLOCK_LEN as u64
    }

    /// Run the identification sequence against a present card and leave the
    /// bus in 4-bit transfer mode at the operational clock
    pub fn init(
        ops: &mut impl ControllerOps,
        timer: &SystemTimer,
    ) -> Result<Self, SdError> {
        if !ops.card_present() {
            return Err(SdError::CardAbsent);
        }

        // CMD0: reset the card into idle
        transact(ops, cmd::GO_IDLE_STATE, 0, CmdFlags::empty())?;
        timer.delay_ms(1);

        // CMD8: v2 cards echo the check pattern, v1 cards time out
        let card_type = match transact(
            ops,
            cmd::SEND_IF_COND,
            IF_COND_CHECK,
            CmdFlags::RESP_48 | CmdFlags::CHECK_CRC,
        ) {
            Ok(resp) if resp[0] & 0xFFF == IF_COND_CHECK => CardType::HighCapacity,
            Ok(_) => return Err(SdError::UnsupportedCard),
            Err(SdError::CommandTimeout) => CardType::StandardCapacity,
            Err(e) => return Err(e),
        };

        // ACMD41 until the card reports power-up done
        let hcs = if card_type == CardType::HighCapacity {
            OCR_HCS
        } else {
            0
        };
        let mut ocr = 0;
        let mut powered_up = false;
        for _ in 0..OP_COND_RETRIES {
            // The R3 response carries no CRC
            transact(ops, cmd::APP_CMD, 0, CmdFlags::RESP_48)?;
            let resp = transact(
                ops,
                cmd::ACMD_SD_SEND_OP_COND,
                OCR_VOLTAGE_WINDOW | hcs,
                CmdFlags::RESP_48,
            )?;
            ocr = resp[0];
            if ocr & OCR_READY != 0 {
                powered_up = true;
                break;
            }
            timer.delay_ms(1);
        }
        if !powered_up {
            defmt::error!("SD: card never finished power-up");
            return Err(SdError::UnsupportedCard);
        }
        let card_type = if ocr & OCR_HCS != 0 {
            CardType::HighCapacity
        } else {
            CardType::StandardCapacity
        };

        // CMD2: identification register
        let cid = transact(
            ops,
            cmd::ALL_SEND_CID,
            0,
            CmdFlags::RESP_136 | CmdFlags::CHECK_CRC,
        )?;
        let ident = parse_cid(&cid);

        // CMD3: the card publishes its relative address
        let resp = transact(
            ops,
            cmd::SEND_RELATIVE_ADDR,
            0,
            CmdFlags::RESP_48 | CmdFlags::CHECK_CRC,
        )?;
        let rca = (resp[0] >> 16) as u16;

        // CMD9: capacity geometry
        let raw_csd = transact(
            ops,
            cmd::SEND_CSD,
            (rca as u32) << 16,
            CmdFlags::RESP_136 | CmdFlags::CHECK_CRC,
        )?;
        let csd = parse_csd(&raw_csd);
        let total_sectors = total_sectors(&csd);

        // CMD7: select the card for transfers
        transact(
            ops,
            cmd::SELECT_CARD,
            (rca as u32) << 16,
            CmdFlags::RESP_BUSY | CmdFlags::CHECK_CRC,
        )?;

        // ACMD6: 4-bit bus on both ends
        transact(ops, cmd::APP_CMD, (rca as u32) << 16, CmdFlags::RESP_48)?;
        transact(
            ops,
            cmd::ACMD_SET_BUS_WIDTH,
            0x2,
            CmdFlags::RESP_48 | CmdFlags::CHECK_CRC,
        )?;
        ops.config_bus_width(4)?;

        transact(
            ops,
            cmd::SET_BLOCKLEN,
            BLOCK_LEN,
            CmdFlags::RESP_48 | CmdFlags::CHECK_CRC,
        )?;
        ops.config_bus_freq(MMCSD_OP_CLOCK)?;

        let card = Self {
            card_type,
            rca,
            ident,
            total_sectors,
        };
        defmt::info!(
            "SD: card ready, type {}, {} sectors, name {}",
            card.card_type,
            card.total_sectors,
            card.ident.product_name.as_str()
        );
        Ok(card)
    }

    /// Read `nblks` 512-byte blocks starting at `sector` into `buf` over DMA
    pub fn read_blocks(
        &self,
        ops: &mut impl ControllerOps,
        sector: u32,
        nblks: u16,
        buf: &mut [u8],
    ) -> Result<(), SdError> {
        if nblks == 0 || buf.len() < nblks as usize * BLOCK_LEN as usize {
            return Err(SdError::InvalidParam);
        }

        // The DMA channel must be armed before the command triggers events
        ops.setup_transfer(
            Direction::Receive,
            buf.as_mut_ptr() as usize as u32,
            BLOCK_LEN,
            nblks as u32,
        )?;

        let mut flags =
            CmdFlags::RESP_48 | CmdFlags::CHECK_CRC | CmdFlags::DATA_PRESENT
                | CmdFlags::READ | CmdFlags::DMA_ENABLE;
        let index = if nblks > 1 {
            flags |= CmdFlags::MULTI_BLOCK;
            cmd::READ_MULTIPLE_BLOCK
        } else {
            cmd::READ_SINGLE_BLOCK
        };

        ops.send_command(&SdCommand {
            index,
            arg: self.data_address(sector),
            flags,
            nblks,
        });
        ops.command_status()?;
        ops.transfer_status()?;

        if nblks > 1 {
            transact(
                ops,
                cmd::STOP_TRANSMISSION,
                0,
                CmdFlags::RESP_BUSY | CmdFlags::CHECK_CRC,
            )?;
        }
        Ok(())
    }

    /// Write `nblks` 512-byte blocks starting at `sector` from `buf` over DMA
    pub fn write_blocks(
        &self,
        ops: &mut impl ControllerOps,
        sector: u32,
        nblks: u16,
        buf: &[u8],
    ) -> Result<(), SdError> {
        if nblks == 0 || buf.len() < nblks as usize * BLOCK_LEN as usize {
            return Err(SdError::InvalidParam);
        }

        ops.setup_transfer(
            Direction::Transmit,
            buf.as_ptr() as usize as u32,
            BLOCK_LEN,
            nblks as u32,
        )?;

        let mut flags = CmdFlags::RESP_48
            | CmdFlags::CHECK_CRC
            | CmdFlags::DATA_PRESENT
            | CmdFlags::DMA_ENABLE;
        let index = if nblks > 1 {
            flags |= CmdFlags::MULTI_BLOCK;
            cmd::WRITE_MULTIPLE_BLOCK
        } else {
            cmd::WRITE_SINGLE_BLOCK
        };

        ops.send_command(&SdCommand {
            index,
            arg: self.data_address(sector),
            flags,
            nblks,
        });
        ops.command_status()?;
        ops.transfer_status()?;

        if nblks > 1 {
            transact(
                ops,
                cmd::STOP_TRANSMISSION,
                0,
                CmdFlags::RESP_BUSY | CmdFlags::CHECK_CRC,
            )?;
        }
        Ok(())
    }

    /// High-capacity cards address by block, standard-capacity by byte
    fn data_address(&self, sector: u32) -> u32 {
        match self.card_type {
            CardType::HighCapacity => sector,
            CardType::StandardCapacity => sector * BLOCK_LEN,
        }
    }
}

/// Issue one command and wait for its response
fn transact(
    ops: &mut impl ControllerOps,
    index: u8,
    arg: u32,
    flags: CmdFlags,
) -> Result<[u32; 4], SdError> {
    ops.send_command(&SdCommand {
        index,
        arg,
        flags,
        nblks: 0,
    });
    ops.command_status()
}

/// Decode the pieces of the CID this stack keeps. The response registers
/// hold the 128-bit field shifted down by the CRC byte.
fn parse_cid(resp: &[u32; 4]) -> CardIdent {
    let manufacturer_id = (resp[3] >> 16) as u8;

    let name_bytes = [
        (resp[2] >> 24) as u8,
        (resp[2] >> 16) as u8,
        (resp[2] >> 8) as u8,
        resp[2] as u8,
        (resp[1] >> 24) as u8,
    ];
    let mut product_name = heapless::String::new();
    for byte in name_bytes {
        let ch = if byte.is_ascii_graphic() {
            byte as char
        } else {
            '.'
        };
        let _ = product_name.push(ch);
    }

    let serial_number = (resp[1] << 16) | (resp[0] >> 16);

    CardIdent {
        manufacturer_id,
        product_name,
        serial_number,
    }
}

/// Decode the capacity-relevant CSD fields
fn parse_csd(resp: &[u32; 4]) -> CardCsd {
    let version = ((resp[3] >> 22) & 0x3) as u8;

    if version >= 1 {
        // CSD v2: device size is a 22-bit multiple of 512 KiB
        CardCsd {
            version,
            c_size: ((resp[1] >> 16) | (resp[2] & 0x3F) << 16),
            c_size_mult: 0,
            read_bl_len: 0,
        }
    } else {
        CardCsd {
            version,
            c_size: ((resp[2] & 0x3FF) << 2) | (resp[1] >> 30),
            c_size_mult: ((resp[1] >> 15) & 0x7) as u8,
            read_bl_len: ((resp[2] >> 16) & 0xF) as u8,
        }
    }
}

/// Total 512-byte sectors described by a CSD
fn total_sectors(csd: &CardCsd) -> u64 {
    if csd.version >= 1 {
        (csd.c_size as u64 + 1) * 1024
    } else {
        let block_count = (csd.c_size as u64 + 1) << (csd.c_size_mult + 2);
        let block_len = 1u64 << csd.read_bl_len;
        block_count * block_len / BLOCK_LEN as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_csd_capacity_is_half_mebibyte_granular() {
        // c_size = 0x1000 → (0x1000 + 1) * 1024 sectors ≈ 2 GiB
        let csd = CardCsd {
            version: 1,
            c_size: 0x1000,
            c_size_mult: 0,
            read_bl_len: 0,
        };
        assert_eq!(total_sectors(&csd), 0x1001 * 1024);
    }

    #[test]
    fn v1_csd_capacity_folds_multiplier_and_block_length() {
        // (c_size+1) * 2^(mult+2) blocks of 2^read_bl_len bytes
        let csd = CardCsd {
            version: 0,
            c_size: 2047,
            c_size_mult: 7,
            read_bl_len: 10,
        };
        // 2048 * 512 * 1024 bytes = 1 GiB = 2^21 sectors
        assert_eq!(total_sectors(&csd), 1 << 21);
    }

    #[test]
    fn cid_name_parses_printable_and_masks_garbage() {
        // "SD08G" spread across the response words as the controller
        // delivers it
        let resp = [
            0x0000_0000,
            0x4700_0000, // 'G'
            0x5344_3038, // "SD08"
            0x0003_5344,
        ];
        let ident = parse_cid(&resp);
        assert_eq!(ident.manufacturer_id, 0x03);
        assert_eq!(ident.product_name.as_str(), "SD08G");

        let junk = [0, 0, 0x0102_0304, 0];
        assert_eq!(parse_cid(&junk).product_name.as_str(), ".....");
    }

    #[test]
    fn block_addressing_differs_by_capacity_class() {
        let mut card = SdCard {
            card_type: CardType::HighCapacity,
            rca: 1,
            ident: CardIdent::default(),
            total_sectors: 1024,
        };
        assert_eq!(card.data_address(8), 8);

        card.card_type = CardType::StandardCapacity;
        assert_eq!(card.data_address(8), 8 * 512);
    }
}
