//! A FatFs-style disk I/O interface.
//!
//! FAT filesystem libraries usually want five functions from their storage
//! layer, each taking a physical drive number. This module provides those
//! as the [`DiskIo`] trait, implemented for [`SdCard`].
//!
//! Sector buffers are plain byte slices here, and must hold at least
//! `count * 512` bytes.

use embedded_hal::delay::DelayNs;

use crate::blockdevice::{BlockIdx, BLOCK_LEN};
use crate::debug;
use crate::sdcard::transport::Transport;
use crate::sdcard::{Error, SdCard};
use crate::status::DeviceStatus;

/// The only physical drive number we answer to.
pub const DRIVE_SD: u8 = 0;

/// Miscellaneous requests to the drive.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ioctl {
    /// Wait for any pending write to finish
    Sync,
    /// How many sectors are on the card
    GetSectorCount,
    /// How big is a sector (always 512)
    GetSectorSize,
    /// How big is an erase block, in sectors
    GetBlockSize,
    /// What kind of card is it, as `CardType::FLAG_*` bits
    GetCardType,
    /// Read the raw CSD register
    GetCsd,
    /// Read the raw CID register
    GetCid,
    /// Read the raw OCR register
    GetOcr,
    /// Read the raw SD Status register
    GetSdStatus,
    /// Switch the socket off
    PowerOff,
    /// Is the socket powered?
    PowerGet,
}

/// Answers to an [`Ioctl`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlResponse {
    /// The request was carried out and has nothing to report
    Done,
    /// The number of sectors on the card
    SectorCount(u32),
    /// The size of a sector, in bytes
    SectorSize(u16),
    /// The erase block size, in sectors
    BlockSize(u32),
    /// The card type flags
    CardType(u8),
    /// CSD register contents
    Csd([u8; 16]),
    /// CID register contents
    Cid([u8; 16]),
    /// OCR register contents
    Ocr([u8; 4]),
    /// SD Status register contents
    SdStatus([u8; 64]),
    /// Whether the socket is powered
    Power(bool),
}

/// The disk I/O layer underneath a FAT filesystem.
pub trait DiskIo {
    /// Get the status of the drive.
    ///
    /// An unknown drive number reports [`DeviceStatus::UNINITIALIZED`].
    fn disk_status(&self, drive: u8) -> DeviceStatus;

    /// Initialise the drive, returning its new status.
    fn disk_initialize(&self, drive: u8) -> DeviceStatus;

    /// Read `count` sectors starting at `sector` into `buffer`.
    fn disk_read(&self, drive: u8, buffer: &mut [u8], sector: u32, count: u32) -> Result<(), Error>;

    /// Write `count` sectors from `buffer`, starting at `sector`.
    fn disk_write(&self, drive: u8, buffer: &[u8], sector: u32, count: u32) -> Result<(), Error>;

    /// Miscellaneous drive requests.
    fn disk_ioctl(&self, drive: u8, request: Ioctl) -> Result<IoctlResponse, Error>;
}

impl<T, D> SdCard<'_, T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Carry out a miscellaneous drive request.
    pub fn ioctl(&self, request: Ioctl) -> Result<IoctlResponse, Error> {
        debug!("ioctl {:?}", request);
        if !self.status().is_ready() {
            return Err(Error::NotReady);
        }
        let response = match request {
            Ioctl::Sync => {
                self.sync()?;
                IoctlResponse::Done
            }
            Ioctl::GetSectorCount => IoctlResponse::SectorCount(self.num_blocks()?.0),
            Ioctl::GetSectorSize => IoctlResponse::SectorSize(self.sector_size()),
            Ioctl::GetBlockSize => IoctlResponse::BlockSize(self.erase_block_size()?),
            Ioctl::GetCardType => {
                let card_type = self.card_type().ok_or(Error::NotReady)?;
                IoctlResponse::CardType(card_type.flags())
            }
            Ioctl::GetCsd => IoctlResponse::Csd(*self.read_csd()?.data()),
            Ioctl::GetCid => IoctlResponse::Cid(self.read_cid()?.data),
            Ioctl::GetOcr => IoctlResponse::Ocr(self.read_ocr()?.data),
            Ioctl::GetSdStatus => IoctlResponse::SdStatus(self.read_sd_status()?.data),
            Ioctl::PowerOff => {
                self.power_off()?;
                IoctlResponse::Done
            }
            Ioctl::PowerGet => IoctlResponse::Power(self.is_powered()),
        };
        Ok(response)
    }
}

impl<T, D> DiskIo for SdCard<'_, T, D>
where
    T: Transport,
    D: DelayNs,
{
    fn disk_status(&self, drive: u8) -> DeviceStatus {
        if drive != DRIVE_SD {
            return DeviceStatus::UNINITIALIZED;
        }
        self.status()
    }

    fn disk_initialize(&self, drive: u8) -> DeviceStatus {
        if drive != DRIVE_SD {
            return DeviceStatus::UNINITIALIZED;
        }
        self.initialize()
    }

    fn disk_read(
        &self,
        drive: u8,
        buffer: &mut [u8],
        sector: u32,
        count: u32,
    ) -> Result<(), Error> {
        let len = sector_buffer(drive, buffer.len(), count)?;
        self.read_sectors(buffer[..len].chunks_exact_mut(BLOCK_LEN), BlockIdx(sector))
    }

    fn disk_write(&self, drive: u8, buffer: &[u8], sector: u32, count: u32) -> Result<(), Error> {
        let len = sector_buffer(drive, buffer.len(), count)?;
        self.write_sectors(buffer[..len].chunks_exact(BLOCK_LEN), BlockIdx(sector))
    }

    fn disk_ioctl(&self, drive: u8, request: Ioctl) -> Result<IoctlResponse, Error> {
        if drive != DRIVE_SD {
            return Err(Error::ParameterError);
        }
        self.ioctl(request)
    }
}

/// Check a disk request and work out how much of the buffer it covers.
fn sector_buffer(drive: u8, buffer_len: usize, count: u32) -> Result<usize, Error> {
    if drive != DRIVE_SD || count == 0 {
        return Err(Error::ParameterError);
    }
    let len = usize::try_from(count)
        .ok()
        .and_then(|count| count.checked_mul(BLOCK_LEN))
        .ok_or(Error::ParameterError)?;
    if buffer_len < len {
        return Err(Error::ParameterError);
    }
    Ok(len)
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
