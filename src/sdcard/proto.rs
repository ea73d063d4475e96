//! Constants and register layouts from the SD/MMC Specifications
//!
//! Based on SdFat, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License
//! >
//! > Permission is hereby granted, free of charge, to any person obtaining a
//! > copy of this software and associated documentation files (the "Software"),
//! > to deal in the Software without restriction, including without limitation
//! > the rights to use, copy, modify, merge, publish, distribute, sublicense,
//! > and/or sell copies of the Software, and to permit persons to whom the
//! > Software is furnished to do so, subject to the following conditions:
//! >
//! > The above copyright notice and this permission notice shall be included
//! > in all copies or substantial portions of the Software.
//! >
//! > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//! > OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! > FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! > AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! > LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//! > FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//! > DEALINGS IN THE SOFTWARE.

use byteorder::{BigEndian, ByteOrder};

use crate::blockdevice::BLOCK_LEN_U64;

//==============================================================================

// SD Card Commands

/// Marks a command as application-specific. These are sent as CMD55
/// followed by the command with this bit cleared.
pub const ACMD_FLAG: u8 = 0x80;

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - activates the card's initialization process (MMC)
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the Card Identification (CID register)
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - set the block length for byte addressed cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_STATUS - read the 64-byte SD Status register
pub const ACMD13: u8 = ACMD_FLAG | 0x0D;
/// SET_WR_BLK_ERASE_COUNT - number of blocks to pre-erase before a
/// multi-block write
pub const ACMD23: u8 = ACMD_FLAG | 0x17;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = ACMD_FLAG | 0x29;

//==============================================================================

// Command arguments and checksums

/// CMD8 argument: 2.7-3.6V supply, check pattern 0xAA
pub const IF_COND_ARG: u32 = 0x0000_01AA;

/// ACMD41 argument bit: host supports high capacity cards
pub const ACMD41_HCS: u32 = 1 << 30;

/// Pre-computed CRC (and end bit) for CMD0 with a zero argument
pub const CMD0_CRC: u8 = 0x95;

/// Pre-computed CRC (and end bit) for CMD8 with [`IF_COND_ARG`]
pub const CMD8_CRC: u8 = 0x87;

/// Placeholder CRC (and end bit) for when the card is not checking
pub const DUMMY_CRC: u8 = 0x01;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// what we see on the bus when the card does not answer at all
pub const R1_NO_RESPONSE: u8 = 0xFF;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// The token that starts (or, for [`DataToken::StopTran`], replaces) a data
/// packet.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataToken {
    /// Single block read or write, and each block of a multi-block read
    StartBlock,
    /// Each block of a multi-block write
    WriteMultiple,
    /// End of a multi-block write. Has no payload.
    StopTran,
}

impl DataToken {
    /// The byte sent on the wire for this token
    pub const fn value(self) -> u8 {
        match self {
            DataToken::StartBlock => DATA_START_BLOCK,
            DataToken::WriteMultiple => WRITE_MULTIPLE_TOKEN,
            DataToken::StopTran => STOP_TRAN_TOKEN,
        }
    }

    /// Is a data payload sent after this token?
    pub const fn has_payload(self) -> bool {
        !matches!(self, DataToken::StopTran)
    }
}

//==============================================================================

/// Card Specific Data, version 1
///
/// Used by SD v1 cards, standard capacity SD v2 cards and MMC cards.
#[derive(Default, Debug, Clone)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
///
/// Used by high capacity (SDHC/SDXC) cards.
#[derive(Default, Debug, Clone)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
#[derive(Debug, Clone)]
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl Csd {
    /// Wrap a raw CSD, picking the layout from the structure version in
    /// the top two bits of byte 0.
    pub fn from_bytes(data: [u8; 16]) -> Csd {
        if (data[0] >> 6) == 1 {
            Csd::V2(CsdV2 { data })
        } else {
            Csd::V1(CsdV1 { data })
        }
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    /// The raw register contents
    pub fn data(&self) -> &[u8; 16] {
        match self {
            Csd::V1(csd) => &csd.data,
            Csd::V2(csd) => &csd.data,
        }
    }
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(mmc_erase_group_size, u8, 10, 2, 5);
    define_field!(mmc_erase_group_multiplier, u8, [(10, 0, 2), (11, 5, 3)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(write_protect_group_enable, bool, 12, 7);
    define_field!(write_speed_factor, u8, 12, 2, 3);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u64 {
        self.card_capacity_bytes() / BLOCK_LEN_U64
    }

    /// The erase unit of an SD v1 card, in 512-byte blocks.
    ///
    /// The erase sector size is counted in write blocks, which may be
    /// bigger than 512 bytes.
    pub fn sd_erase_block_sectors(&self) -> u32 {
        let write_block_shift = self.max_write_data_length().saturating_sub(9);
        (u32::from(self.erase_sector_size()) + 1) << write_block_shift
    }

    /// The erase unit of an MMC v3 card, in 512-byte blocks.
    pub fn mmc_erase_block_sectors(&self) -> u32 {
        (u32::from(self.mmc_erase_group_size()) + 1)
            * (u32::from(self.mmc_erase_group_multiplier()) + 1)
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) << 10
    }
}

/// Card Identification register
#[derive(Default, Debug, Clone)]
pub struct Cid {
    /// The 16-bytes of data in this Card Identification block
    pub data: [u8; 16],
}

impl Cid {
    define_field!(manufacturer_id, u8, 0, 0, 8);
    define_field!(oem_id, u16, [(1, 0, 8), (2, 0, 8)]);
    define_field!(product_revision, u8, 8, 0, 8);
    define_field!(
        serial_number,
        u32,
        [(9, 0, 8), (10, 0, 8), (11, 0, 8), (12, 0, 8)]
    );
    define_field!(manufacture_month, u8, 14, 0, 4);

    /// The five ASCII characters of the product name
    pub fn product_name(&self) -> [u8; 5] {
        let mut name = [0u8; 5];
        name.copy_from_slice(&self.data[3..8]);
        name
    }

    /// The year of manufacture
    pub fn manufacture_year(&self) -> u16 {
        2000 + ((u16::from(self.data[13] & 0x0F) << 4) | u16::from(self.data[14] >> 4))
    }
}

/// Operation Conditions Register, as returned after CMD58
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ocr {
    /// The 4 bytes of the register, most significant first
    pub data: [u8; 4],
}

impl Ocr {
    define_field!(power_up_complete, bool, 0, 7);
    define_field!(card_capacity_status, bool, 0, 6);

    /// The whole register as a number
    pub fn value(&self) -> u32 {
        BigEndian::read_u32(&self.data)
    }
}

/// The 64-byte SD Status register, as returned by ACMD13
#[derive(Debug, Clone)]
pub struct SdStatus {
    /// The 64-bytes of data in the register
    pub data: [u8; 64],
}

impl Default for SdStatus {
    fn default() -> Self {
        SdStatus { data: [0; 64] }
    }
}

impl SdStatus {
    define_field!(bus_width, u8, 0, 6, 2);
    define_field!(speed_class, u8, 8, 0, 8);
    define_field!(au_size, u8, 10, 4, 4);

    /// The allocation unit (the erase unit) in 512-byte blocks
    pub fn erase_block_sectors(&self) -> u32 {
        16u32 << self.au_size()
    }
}

/// Perform the 7-bit CRC used on the SD card
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Perform the X25 CRC calculation, as used for data blocks.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
